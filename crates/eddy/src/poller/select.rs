use std::{collections::BTreeMap, io, mem, os::fd::RawFd, time::Duration as StdDuration};

use super::{Interest, Poller};

/// `select(2)` flavor: keeps a sorted fd → interest map and rebuilds the
/// three fd sets on every poll. The map's last key is the `nfds` bound.
pub(crate) struct SelectPoller {
    fds: BTreeMap<RawFd, Interest>,
}

impl SelectPoller {
    pub(crate) fn new() -> Self {
        Self { fds: BTreeMap::new() }
    }
}

impl Poller for SelectPoller {
    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()> {
        if fd < 0 || fd as usize >= libc::FD_SETSIZE {
            return Err(io::Error::new(
                io::ErrorKind::InvalidInput,
                format!("fd {fd} out of range for select"),
            ));
        }
        self.fds.insert(fd, interest);
        Ok(())
    }

    fn disarm(&mut self, fd: RawFd) -> io::Result<()> {
        self.fds.remove(&fd);
        Ok(())
    }

    fn poll(
        &mut self,
        ready: &mut Vec<(RawFd, Interest)>,
        timeout: StdDuration,
    ) -> io::Result<()> {
        let mut read_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut write_set: libc::fd_set = unsafe { mem::zeroed() };
        let mut except_set: libc::fd_set = unsafe { mem::zeroed() };
        unsafe {
            libc::FD_ZERO(&mut read_set);
            libc::FD_ZERO(&mut write_set);
            libc::FD_ZERO(&mut except_set);
        }

        let mut max_fd: RawFd = -1;
        for (&fd, &interest) in &self.fds {
            if interest.is_empty() {
                continue;
            }
            unsafe {
                if interest.contains(Interest::READABLE) {
                    libc::FD_SET(fd, &mut read_set);
                }
                if interest.contains(Interest::WRITABLE) {
                    libc::FD_SET(fd, &mut write_set);
                }
                if interest.contains(Interest::EXCEPTION) {
                    libc::FD_SET(fd, &mut except_set);
                }
            }
            max_fd = fd;
        }

        let mut tv = libc::timeval {
            tv_sec: timeout.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_usec: timeout.subsec_micros() as libc::suseconds_t,
        };

        let n = unsafe {
            libc::select(
                max_fd + 1,
                &mut read_set,
                &mut write_set,
                &mut except_set,
                &mut tv,
            )
        };
        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(());
            }
            return Err(err);
        }
        if n == 0 {
            return Ok(());
        }

        for (&fd, _) in &self.fds {
            let mut hits = Interest::empty();
            unsafe {
                if libc::FD_ISSET(fd, &read_set) {
                    hits |= Interest::READABLE;
                }
                if libc::FD_ISSET(fd, &write_set) {
                    hits |= Interest::WRITABLE;
                }
                if libc::FD_ISSET(fd, &except_set) {
                    hits |= Interest::EXCEPTION;
                }
            }
            if !hits.is_empty() {
                ready.push((fd, hits));
            }
        }
        Ok(())
    }
}
