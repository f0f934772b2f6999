use std::{
    cell::RefCell,
    io,
    net::{SocketAddr, TcpListener, TcpStream},
    os::fd::AsRawFd,
    rc::Rc,
};

use eddy::{Condition, Reactor};
use tracing::{debug, info, warn};

struct Inner {
    reactor: Reactor,
    socket: Option<TcpListener>,
}

/// Accepting socket bound to a [`Reactor`].
///
/// Each readable edge accepts until `WouldBlock` and hands every new
/// connection to the accept callback. Per-accept failures are logged and
/// skipped.
pub struct Listener {
    inner: Rc<RefCell<Inner>>,
}

impl Listener {
    pub fn bind(
        reactor: &Reactor,
        addr: SocketAddr,
        mut on_accept: impl FnMut(TcpStream, SocketAddr) + 'static,
    ) -> io::Result<Self> {
        let socket = TcpListener::bind(addr)?;
        socket.set_nonblocking(true)?;
        let fd = socket.as_raw_fd();

        let inner =
            Rc::new(RefCell::new(Inner { reactor: reactor.clone(), socket: Some(socket) }));
        let weak = Rc::downgrade(&inner);
        reactor.register_descriptor(fd, Condition::Readable, move || {
            let Some(inner) = weak.upgrade() else { return };
            loop {
                let accepted = {
                    let b = inner.borrow();
                    let Some(socket) = b.socket.as_ref() else { return };
                    socket.accept()
                };
                match accepted {
                    Ok((stream, peer_addr)) => {
                        debug!(%peer_addr, "accepted");
                        on_accept(stream, peer_addr);
                    }
                    Err(err) if err.kind() == io::ErrorKind::WouldBlock => break,
                    Err(err) if err.kind() == io::ErrorKind::Interrupted => {}
                    Err(err) => {
                        warn!(?err, "accept failed");
                        break;
                    }
                }
            }
        })?;

        Ok(Self { inner })
    }

    pub fn local_addr(&self) -> Option<SocketAddr> {
        self.inner.borrow().socket.as_ref().and_then(|s| s.local_addr().ok())
    }

    /// Unregister and drop the listening socket.
    pub fn close(&self) {
        let (reactor, socket) = {
            let mut b = self.inner.borrow_mut();
            (b.reactor.clone(), b.socket.take())
        };
        if let Some(socket) = socket.as_ref() {
            reactor.unregister_descriptor(socket.as_raw_fd(), Condition::Readable);
            info!("listener closed");
        }
    }
}
