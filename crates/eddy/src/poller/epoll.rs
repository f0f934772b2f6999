#![cfg(any(target_os = "linux", target_os = "android"))]

use std::{
    collections::BTreeMap,
    io, mem,
    os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd},
    time::Duration as StdDuration,
};

use super::{Interest, Poller};

/// Kernel-set flavor: a level-triggered epoll instance mirrored from the
/// registration map. `epoll_wait` hands back a bounded batch per cycle; the
/// kernel re-reports whatever stays ready, so a capped consumer simply sees
/// the fd again next cycle.
pub(crate) struct EpollPoller {
    epfd: OwnedFd,
    events: Vec<libc::epoll_event>,
    registered: BTreeMap<RawFd, Interest>,
}

impl EpollPoller {
    pub(crate) fn new(event_batch: usize) -> io::Result<Self> {
        let epfd = unsafe { libc::epoll_create1(libc::EPOLL_CLOEXEC) };
        if epfd < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(Self {
            epfd: unsafe { OwnedFd::from_raw_fd(epfd) },
            events: vec![unsafe { mem::zeroed() }; event_batch.max(1)],
            registered: BTreeMap::new(),
        })
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, interest: Interest) -> io::Result<()> {
        let mut event =
            libc::epoll_event { events: epoll_mask(interest), u64: fd as u64 };
        let event_ptr =
            if op == libc::EPOLL_CTL_DEL { std::ptr::null_mut() } else { &raw mut event };
        let res = unsafe { libc::epoll_ctl(self.epfd.as_raw_fd(), op, fd, event_ptr) };
        if res < 0 {
            return Err(io::Error::last_os_error());
        }
        Ok(())
    }
}

fn epoll_mask(interest: Interest) -> u32 {
    let mut mask = 0u32;
    if interest.contains(Interest::READABLE) {
        mask |= libc::EPOLLIN as u32;
    }
    if interest.contains(Interest::WRITABLE) {
        mask |= libc::EPOLLOUT as u32;
    }
    if interest.contains(Interest::EXCEPTION) {
        mask |= libc::EPOLLPRI as u32;
    }
    mask
}

impl Poller for EpollPoller {
    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        let op = if self.registered.contains_key(&fd) {
            libc::EPOLL_CTL_MOD
        } else {
            libc::EPOLL_CTL_ADD
        };
        self.ctl(op, fd, interest)?;
        self.registered.insert(fd, interest);
        Ok(())
    }

    fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        if self.registered.remove(&fd).is_some() {
            self.ctl(libc::EPOLL_CTL_DEL, fd, Interest::empty())?;
        }
        Ok(())
    }

    fn poll(
        &mut self,
        ready: &mut Vec<(RawFd, Interest)>,
        timeout: StdDuration,
    ) -> io::Result<()> {
        // Round up so a sub-millisecond timeout doesn't turn into a spin.
        let millis = timeout
            .as_nanos()
            .div_ceil(1_000_000)
            .min(i32::MAX as u128) as i32;

        let n = unsafe {
            libc::epoll_wait(
                self.epfd.as_raw_fd(),
                self.events.as_mut_ptr(),
                self.events.len() as i32,
                millis,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }

        for event in &self.events[..n as usize] {
            let fd = event.u64 as RawFd;
            let bits = event.events;
            let mut hits = Interest::empty();
            if bits & (libc::EPOLLIN | libc::EPOLLRDHUP) as u32 != 0 {
                hits |= Interest::READABLE;
            }
            if bits & libc::EPOLLOUT as u32 != 0 {
                hits |= Interest::WRITABLE;
            }
            if bits & libc::EPOLLPRI as u32 != 0 {
                hits |= Interest::EXCEPTION;
            }
            if bits & (libc::EPOLLERR | libc::EPOLLHUP) as u32 != 0 {
                // Failure conditions surface through the owning actions' IO.
                hits |= Interest::READABLE | Interest::WRITABLE;
            }
            if !hits.is_empty() {
                ready.push((fd, hits));
            }
        }
        Ok(())
    }
}
