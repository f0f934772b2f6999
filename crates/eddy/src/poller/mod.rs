#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;
mod select;

use std::{io, os::fd::RawFd, time::Duration as StdDuration};

use bitflags::bitflags;
use serde::Deserialize;

bitflags! {
    /// Union of readiness conditions a descriptor is watched for.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub(crate) struct Interest: u8 {
        const READABLE = 1 << 0;
        const WRITABLE = 1 << 1;
        const EXCEPTION = 1 << 2;
    }
}

/// A single readiness condition an action can be bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Condition {
    Readable,
    Writable,
    /// Out-of-band/priority data. Backed by the `select` exception set and
    /// `EPOLLPRI`; a no-op on platforms without an equivalent.
    Exception,
}

impl Condition {
    /// Dispatch order within one cycle for a fd ready on several conditions.
    pub(crate) const DISPATCH_ORDER: [Condition; 3] =
        [Condition::Readable, Condition::Writable, Condition::Exception];

    #[inline]
    pub(crate) fn bit(self) -> Interest {
        match self {
            Condition::Readable => Interest::READABLE,
            Condition::Writable => Interest::WRITABLE,
            Condition::Exception => Interest::EXCEPTION,
        }
    }
}

/// Which OS multiplex facility backs a reactor.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Backend {
    /// `select(2)`: rebuilds the fd sets every cycle, fds must stay below
    /// `FD_SETSIZE`. Fine when the highest fd is small.
    Select,
    /// Kernel-maintained readiness set (level-triggered epoll) with a
    /// bounded event batch per cycle. Falls back to select on platforms
    /// without epoll.
    #[default]
    Epoll,
}

/// One interface over both multiplex flavors; picked at reactor construction.
pub(crate) trait Poller {
    /// Register `fd` or update its watched set. An empty set keeps the fd
    /// known but delivers nothing.
    fn arm(&mut self, fd: RawFd, interest: Interest) -> io::Result<()>;

    fn disarm(&mut self, fd: RawFd) -> io::Result<()>;

    /// Block up to `timeout` and append ready `(fd, conditions)` pairs.
    /// `EINTR` is swallowed and reported as no readiness.
    fn poll(
        &mut self,
        ready: &mut Vec<(RawFd, Interest)>,
        timeout: StdDuration,
    ) -> io::Result<()>;
}

pub(crate) fn make_poller(backend: Backend, event_batch: usize) -> io::Result<Box<dyn Poller>> {
    match backend {
        Backend::Select => {
            let _ = event_batch;
            Ok(Box::new(select::SelectPoller::new()))
        }
        #[cfg(any(target_os = "linux", target_os = "android"))]
        Backend::Epoll => Ok(Box::new(epoll::EpollPoller::new(event_batch)?)),
        #[cfg(not(any(target_os = "linux", target_os = "android")))]
        Backend::Epoll => {
            tracing::warn!("epoll backend unavailable on this platform, using select");
            Ok(Box::new(select::SelectPoller::new()))
        }
    }
}
