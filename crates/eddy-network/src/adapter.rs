use std::{
    cell::RefCell,
    collections::VecDeque,
    io,
    net::{SocketAddr, TcpStream},
    os::fd::{AsRawFd, OwnedFd, RawFd},
    rc::Rc,
};

use eddy::{Condition, Reactor};
use serde::Deserialize;
use tracing::{debug, warn};

/// What a receive callback wants next.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadControl {
    Continue,
    /// Pause reads; re-installing a receive callback resumes them.
    Stop,
}

/// Whether a writable producer stays installed for the next writable edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteControl {
    Keep,
    Stop,
}

/// Why an adapter reached `Closed`.
#[derive(Debug)]
pub enum CloseReason {
    /// `close`/`shutdown` from this side.
    Local,
    /// Zero-byte read, `ECONNRESET` or `EPIPE`.
    PeerClosed,
    Io(io::Error),
}

/// Per-socket tuning.
#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct AdapterConfig {
    /// `TCP_NOTSENT_LOWAT`, bytes; best-effort where the OS supports it.
    pub unsent_lowat: usize,
    /// Most bytes handed to the kernel per writable edge, so one fat
    /// connection can't starve the cycle.
    pub write_cap: usize,
    /// Read scratch buffer size; also the most bytes read per readable edge.
    pub input_buffer: usize,
}

impl Default for AdapterConfig {
    fn default() -> Self {
        Self { unsent_lowat: 4_096, write_cap: 2_048, input_buffer: 65_536 }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    Open,
    ShuttingDown,
    Closed,
}

type RecvCallback = Box<dyn FnMut(&[u8]) -> ReadControl>;
type WritableProducer = Box<dyn FnMut() -> WriteControl>;

struct Inner {
    reactor: Reactor,
    fd: Option<OwnedFd>,
    peer_addr: Option<SocketAddr>,
    state: State,
    config: AdapterConfig,
    scratch: Vec<u8>,
    outbuf: VecDeque<u8>,
    recv: Option<RecvCallback>,
    producer: Option<WritableProducer>,
    on_close: Option<Box<dyn FnOnce(CloseReason)>>,
    on_shutdown_complete: Option<Box<dyn FnOnce()>>,
    read_registered: bool,
    write_registered: bool,
}

impl Inner {
    fn raw_fd(&self) -> Option<RawFd> {
        self.fd.as_ref().map(AsRawFd::as_raw_fd)
    }
}

/// Non-blocking stream socket bound to a [`Reactor`].
///
/// Reads: one bounded read per readable edge (fairness across connections),
/// delivered as a slice to the receive callback. Writes: appended to an
/// output buffer and drained on writable edges under a per-cycle cap; bytes
/// queued while `Open` are never dropped. `shutdown` drains the buffer and
/// then closes; errors close immediately and surface a [`CloseReason`]
/// through the close callback.
#[derive(Clone)]
pub struct SocketAdapter {
    inner: Rc<RefCell<Inner>>,
}

impl SocketAdapter {
    /// Take ownership of `stream`: switch it to non-blocking, set
    /// `TCP_NODELAY`, apply `TCP_NOTSENT_LOWAT` and SIGPIPE suppression
    /// where available.
    pub fn attach(reactor: &Reactor, stream: TcpStream, config: AdapterConfig) -> io::Result<Self> {
        stream.set_nonblocking(true)?;
        stream.set_nodelay(true)?;
        let peer_addr = stream.peer_addr().ok();
        let fd: OwnedFd = stream.into();
        set_unsent_lowat(&fd, config.unsent_lowat);
        set_nosigpipe(&fd);

        Ok(Self {
            inner: Rc::new(RefCell::new(Inner {
                reactor: reactor.clone(),
                fd: Some(fd),
                peer_addr,
                state: State::Open,
                config,
                scratch: vec![0; config.input_buffer.max(1)],
                outbuf: VecDeque::new(),
                recv: None,
                producer: None,
                on_close: None,
                on_shutdown_complete: None,
                read_registered: false,
                write_registered: false,
            })),
        })
    }

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().peer_addr
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == State::Open
    }

    /// Bytes queued but not yet handed to the kernel.
    pub fn pending_output(&self) -> usize {
        self.inner.borrow().outbuf.len()
    }

    /// Install the receive callback and (re)arm reads. Returning
    /// [`ReadControl::Stop`] from the callback pauses reads until a callback
    /// is installed again.
    pub fn on_receive(&self, callback: impl FnMut(&[u8]) -> ReadControl + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                debug!("receive callback on a closed adapter dropped");
                return;
            }
            inner.recv = Some(Box::new(callback));
        }
        arm_read(&self.inner);
    }

    pub fn on_close(&self, callback: impl FnOnce(CloseReason) + 'static) {
        self.inner.borrow_mut().on_close = Some(Box::new(callback));
    }

    /// Runs when a shutdown finishes draining, right before the close
    /// callback.
    pub fn on_shutdown_complete(&self, callback: impl FnOnce() + 'static) {
        self.inner.borrow_mut().on_shutdown_complete = Some(Box::new(callback));
    }

    /// Queue bytes for sending. No-op (with a log) unless `Open`.
    pub fn write_bytes(&self, bytes: &[u8]) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open {
                debug!(len = bytes.len(), "write on a non-open adapter dropped");
                return;
            }
            inner.outbuf.extend(bytes);
        }
        arm_write(&self.inner);
    }

    /// Install a producer that runs at the start of the next writable edge,
    /// before the buffer drain, so its writes ride the same edge.
    pub fn notify_when_writable(&self, producer: impl FnMut() -> WriteControl + 'static) {
        {
            let mut inner = self.inner.borrow_mut();
            if inner.state == State::Closed {
                return;
            }
            inner.producer = Some(Box::new(producer));
        }
        arm_write(&self.inner);
    }

    /// Stop accepting writes, drain the output buffer, then close.
    pub fn shutdown(&self) {
        let drained = {
            let mut inner = self.inner.borrow_mut();
            if inner.state != State::Open {
                return;
            }
            inner.state = State::ShuttingDown;
            inner.outbuf.is_empty()
        };
        if drained {
            finish_shutdown(&self.inner);
        } else {
            arm_write(&self.inner);
        }
    }

    /// Immediate close: unregister, close the socket, invoke the close
    /// callback. Queued output is discarded.
    pub fn close(&self) {
        close_with(&self.inner, CloseReason::Local);
    }
}

fn arm_read(inner: &Rc<RefCell<Inner>>) {
    let (reactor, fd) = {
        let mut b = inner.borrow_mut();
        if b.read_registered || b.state == State::Closed || b.recv.is_none() {
            return;
        }
        let Some(fd) = b.raw_fd() else { return };
        b.read_registered = true;
        (b.reactor.clone(), fd)
    };
    let weak = Rc::downgrade(inner);
    let registered = reactor.register_descriptor(fd, Condition::Readable, move || {
        if let Some(inner) = weak.upgrade() {
            on_readable(&inner);
        }
    });
    if let Err(err) = registered {
        warn!(?err, "couldn't register for reads");
        close_with(inner, CloseReason::Io(err));
    }
}

fn arm_write(inner: &Rc<RefCell<Inner>>) {
    let (reactor, fd) = {
        let mut b = inner.borrow_mut();
        if b.write_registered || b.state == State::Closed {
            return;
        }
        if b.outbuf.is_empty() && b.producer.is_none() && b.state == State::Open {
            return;
        }
        let Some(fd) = b.raw_fd() else { return };
        b.write_registered = true;
        (b.reactor.clone(), fd)
    };
    let weak = Rc::downgrade(inner);
    let registered = reactor.register_descriptor(fd, Condition::Writable, move || {
        if let Some(inner) = weak.upgrade() {
            on_writable(&inner);
        }
    });
    if let Err(err) = registered {
        warn!(?err, "couldn't register for writes");
        close_with(inner, CloseReason::Io(err));
    }
}

fn on_readable(inner: &Rc<RefCell<Inner>>) {
    // One read per edge; a second would let a chatty peer hog the cycle.
    let n = {
        let mut b = inner.borrow_mut();
        if b.state == State::Closed {
            return;
        }
        let Some(fd) = b.raw_fd() else { return };
        let cap = b.scratch.len();
        unsafe { libc::read(fd, b.scratch.as_mut_ptr().cast(), cap) }
    };

    if n == 0 {
        close_with(inner, CloseReason::PeerClosed);
        return;
    }
    if n < 0 {
        let err = io::Error::last_os_error();
        match err.kind() {
            io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
            io::ErrorKind::ConnectionReset => close_with(inner, CloseReason::PeerClosed),
            _ => close_with(inner, CloseReason::Io(err)),
        }
        return;
    }

    // The callback and the scratch buffer both leave the cell so the
    // callback can freely call back into this adapter.
    let (mut recv, scratch) = {
        let mut b = inner.borrow_mut();
        let Some(recv) = b.recv.take() else { return };
        (recv, std::mem::take(&mut b.scratch))
    };
    let control = recv(&scratch[..n as usize]);
    {
        let mut b = inner.borrow_mut();
        b.scratch = scratch;
        if b.state != State::Closed && b.recv.is_none() {
            b.recv = Some(recv);
        }
    }

    if control == ReadControl::Stop {
        let unregister = {
            let mut b = inner.borrow_mut();
            if b.read_registered
                && let Some(fd) = b.raw_fd()
            {
                b.read_registered = false;
                b.recv = None;
                Some((b.reactor.clone(), fd))
            } else {
                None
            }
        };
        if let Some((reactor, fd)) = unregister {
            reactor.unregister_descriptor(fd, Condition::Readable);
        }
    }
}

fn on_writable(inner: &Rc<RefCell<Inner>>) {
    // Producer first: whatever it writes goes out on this same edge.
    let producer = inner.borrow_mut().producer.take();
    if let Some(mut producer) = producer {
        let control = producer();
        let mut b = inner.borrow_mut();
        if control == WriteControl::Keep && b.state != State::Closed && b.producer.is_none() {
            b.producer = Some(producer);
        }
    }

    let mut fatal: Option<CloseReason> = None;
    {
        let mut b = inner.borrow_mut();
        if b.state == State::Closed {
            return;
        }
        let Some(fd) = b.raw_fd() else { return };
        let mut budget = b.config.write_cap;
        while budget > 0 && !b.outbuf.is_empty() {
            let (front, _) = b.outbuf.as_slices();
            let len = front.len().min(budget);
            let n = unsafe { libc::send(fd, front.as_ptr().cast(), len, send_flags()) };
            if n < 0 {
                let err = io::Error::last_os_error();
                match err.kind() {
                    io::ErrorKind::WouldBlock | io::ErrorKind::Interrupted => {}
                    io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset => {
                        fatal = Some(CloseReason::PeerClosed);
                    }
                    _ => fatal = Some(CloseReason::Io(err)),
                }
                break;
            }
            let n = n as usize;
            b.outbuf.drain(..n);
            budget -= n;
            if n < len {
                break;
            }
        }
    }
    if let Some(reason) = fatal {
        close_with(inner, reason);
        return;
    }

    let next = {
        let mut b = inner.borrow_mut();
        if !b.outbuf.is_empty() {
            None
        } else if b.state == State::ShuttingDown {
            Some(Step::FinishShutdown)
        } else if b.producer.is_none() && b.write_registered {
            b.write_registered = false;
            b.raw_fd().map(|fd| Step::DropWritable(b.reactor.clone(), fd))
        } else {
            None
        }
    };
    match next {
        Some(Step::FinishShutdown) => finish_shutdown(inner),
        Some(Step::DropWritable(reactor, fd)) => {
            reactor.unregister_descriptor(fd, Condition::Writable);
        }
        None => {}
    }
}

enum Step {
    FinishShutdown,
    DropWritable(Reactor, RawFd),
}

fn finish_shutdown(inner: &Rc<RefCell<Inner>>) {
    let callback = inner.borrow_mut().on_shutdown_complete.take();
    if let Some(callback) = callback {
        callback();
    }
    close_with(inner, CloseReason::Local);
}

fn close_with(inner: &Rc<RefCell<Inner>>, reason: CloseReason) {
    let (reactor, fd, on_close) = {
        let mut b = inner.borrow_mut();
        if b.state == State::Closed {
            return;
        }
        b.state = State::Closed;
        b.recv = None;
        b.producer = None;
        b.on_shutdown_complete = None;
        b.outbuf.clear();
        b.read_registered = false;
        b.write_registered = false;
        (b.reactor.clone(), b.fd.take(), b.on_close.take())
    };
    if let Some(fd) = fd.as_ref() {
        reactor.unregister_fd(fd.as_raw_fd());
    }
    drop(fd);
    if let Some(on_close) = on_close {
        on_close(reason);
    }
}

fn send_flags() -> libc::c_int {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    {
        libc::MSG_NOSIGNAL
    }
    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    {
        0
    }
}

/// Bound the kernel's unsent backlog so writability tracks real delivery.
fn set_unsent_lowat(fd: &OwnedFd, bytes: usize) {
    #[cfg(any(target_os = "linux", target_os = "android", target_os = "macos", target_os = "ios"))]
    {
        let value = bytes as libc::c_int;
        let res = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::IPPROTO_TCP,
                libc::TCP_NOTSENT_LOWAT,
                (&raw const value).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            debug!(err = ?io::Error::last_os_error(), "TCP_NOTSENT_LOWAT not applied");
        }
    }
    #[cfg(not(any(
        target_os = "linux",
        target_os = "android",
        target_os = "macos",
        target_os = "ios"
    )))]
    let _ = (fd, bytes);
}

fn set_nosigpipe(fd: &OwnedFd) {
    // Linux suppresses SIGPIPE per send via MSG_NOSIGNAL instead.
    #[cfg(any(target_os = "macos", target_os = "ios"))]
    {
        let value: libc::c_int = 1;
        let res = unsafe {
            libc::setsockopt(
                fd.as_raw_fd(),
                libc::SOL_SOCKET,
                libc::SO_NOSIGPIPE,
                (&raw const value).cast(),
                size_of::<libc::c_int>() as libc::socklen_t,
            )
        };
        if res != 0 {
            debug!(err = ?io::Error::last_os_error(), "SO_NOSIGPIPE not applied");
        }
    }
    #[cfg(not(any(target_os = "macos", target_os = "ios")))]
    let _ = fd;
}
