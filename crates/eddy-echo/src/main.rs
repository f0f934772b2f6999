use std::{cell::RefCell, collections::HashMap, io, net::SocketAddr, rc::Rc};

use clap::Parser;
use eddy::{Backend, Performer, Reactor, ReactorConfig};
use eddy_network::{
    AdapterConfig, Listener, SocketAdapter,
    ws::{WebSocket, WsConfig, WsEvent},
};
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

/// WebSocket echo server on a single reactor thread.
#[derive(Parser, Debug)]
#[command(version, about)]
struct Args {
    /// Address to listen on.
    #[arg(long, default_value = "127.0.0.1:9001")]
    listen: SocketAddr,

    /// Multiplex backend: epoll or select.
    #[arg(long, default_value = "epoll")]
    backend: String,
}

fn main() -> io::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();
    let args = Args::parse();

    let backend = match args.backend.as_str() {
        "select" => Backend::Select,
        "epoll" => Backend::Epoll,
        other => {
            warn!(backend = other, "unknown backend, using epoll");
            Backend::Epoll
        }
    };

    let reactor = Reactor::with_config(ReactorConfig { backend, ..Default::default() })?;

    // Ctrl-C sets the stop flag and pokes the loop awake through a performer.
    let waker = Performer::new(&reactor)?;
    let stopper = reactor.stopper();
    ctrlc::set_handler(move || {
        stopper.stop();
        let _ = waker.perform(|| {});
    })
    .expect("installing the ctrl-c handler");

    let sessions: Rc<RefCell<HashMap<u64, WebSocket>>> = Rc::new(RefCell::new(HashMap::new()));
    let next_id = Rc::new(RefCell::new(0u64));

    let accept_reactor = reactor.clone();
    let accept_sessions = sessions.clone();
    let listener = Listener::bind(&reactor, args.listen, move |stream, peer_addr| {
        let adapter =
            match SocketAdapter::attach(&accept_reactor, stream, AdapterConfig::default()) {
                Ok(adapter) => adapter,
                Err(err) => {
                    warn!(%peer_addr, ?err, "couldn't attach socket");
                    return;
                }
            };

        let id = {
            let mut next = next_id.borrow_mut();
            *next += 1;
            *next
        };
        let sessions = accept_sessions.clone();
        let slot: Rc<RefCell<Option<WebSocket>>> = Rc::new(RefCell::new(None));
        let handler_slot = slot.clone();
        let session = WebSocket::attach(
            &accept_reactor,
            adapter,
            WsConfig::default(),
            move |event| match event {
                WsEvent::Open { path } => info!(%peer_addr, path, "session open"),
                WsEvent::Text(text) => {
                    if let Some(ws) = handler_slot.borrow().as_ref() {
                        ws.send_text(text);
                    }
                }
                WsEvent::Binary(bytes) => {
                    if let Some(ws) = handler_slot.borrow().as_ref() {
                        ws.send_binary(bytes);
                    }
                }
                WsEvent::Closed { code, reason } => {
                    info!(%peer_addr, ?code, reason, "session closed");
                    sessions.borrow_mut().remove(&id);
                }
            },
        );
        *slot.borrow_mut() = Some(session.clone());
        accept_sessions.borrow_mut().insert(id, session);
    })?;

    info!(listen = %args.listen, ?backend, "echo server up");
    let result = reactor.run();
    listener.close();
    result.map_err(io::Error::other)
}
