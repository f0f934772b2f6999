mod frame;
mod handshake;

use std::{cell::RefCell, rc::Rc};

use eddy::{Reactor, TimerHandle};
use eddy_timing::Duration;
use serde::Deserialize;
use thiserror::Error;
use tracing::{debug, warn};

pub use frame::Opcode;
use frame::{Frame, FrameDecoder, encode_frame};

use crate::{CloseReason, HeaderFeed, HttpError, ReadControl, SocketAdapter};

#[derive(Error, Debug)]
pub enum WsError {
    #[error("handshake rejected: {0}")]
    Handshake(&'static str),
    #[error(transparent)]
    Http(#[from] HttpError),
    #[error("protocol violation: {0}")]
    Protocol(&'static str),
    #[error("frame payload of {0} bytes exceeds the cap")]
    FrameTooLarge(u64),
    #[error("message of {0} bytes exceeds the cap")]
    MessageTooLarge(usize),
}

/// Everything a session surfaces to the application.
#[derive(Debug)]
pub enum WsEvent<'a> {
    /// Handshake accepted; `path` is the request target.
    Open { path: &'a str },
    /// Complete (reassembled) text message, UTF-8 validated.
    Text(&'a str),
    /// Complete (reassembled) binary message.
    Binary(&'a [u8]),
    /// The session is over and the socket is closed. `code` is the close
    /// code sent or received, `None` for abnormal closure.
    Closed { code: Option<u16>, reason: &'a str },
}

#[derive(Debug, Clone, Copy, Deserialize)]
#[serde(default)]
pub struct WsConfig {
    /// Largest accepted single-frame payload.
    pub max_frame_payload: usize,
    /// Largest accepted reassembled message.
    pub max_message: usize,
    /// How long `clean_close` waits for the peer's Close reply.
    pub close_timeout: Duration,
    /// Handshake header-block bound.
    pub max_header_block: usize,
}

impl Default for WsConfig {
    fn default() -> Self {
        Self {
            max_frame_payload: 16 << 20,
            max_message: 16 << 20,
            close_timeout: Duration::from_secs(5),
            max_header_block: crate::DEFAULT_MAX_HEADER_BLOCK,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum WsState {
    ExpectingHandshake,
    Open,
    Closing,
    Closed,
}

type WsHandler = Box<dyn FnMut(WsEvent<'_>)>;

struct Inner {
    reactor: Reactor,
    adapter: SocketAdapter,
    config: WsConfig,
    state: WsState,
    http: crate::HttpHeaderParser,
    decoder: FrameDecoder,
    message_opcode: Option<Opcode>,
    fragments: Vec<u8>,
    handler: Option<WsHandler>,
    close_code: Option<u16>,
    close_reason: String,
    close_timer: Option<TimerHandle>,
    closed_emitted: bool,
}

/// Server-side RFC 6455 endpoint on top of a [`SocketAdapter`].
///
/// Drives the handshake, decodes masked client frames, reassembles
/// fragmented messages, answers pings, and manages the close handshake.
/// Events arrive through the single handler closure given to
/// [`attach`](Self::attach); outbound messages go through
/// [`send_text`](Self::send_text) / [`send_binary`](Self::send_binary).
#[derive(Clone)]
pub struct WebSocket {
    inner: Rc<RefCell<Inner>>,
}

impl WebSocket {
    /// Take over `adapter`'s receive path. The adapter must be freshly
    /// attached (no bytes consumed yet).
    pub fn attach(
        reactor: &Reactor,
        adapter: SocketAdapter,
        config: WsConfig,
        handler: impl FnMut(WsEvent<'_>) + 'static,
    ) -> Self {
        let inner = Rc::new(RefCell::new(Inner {
            reactor: reactor.clone(),
            adapter: adapter.clone(),
            config,
            state: WsState::ExpectingHandshake,
            http: crate::HttpHeaderParser::with_max_header_block(config.max_header_block),
            decoder: FrameDecoder::new(config.max_frame_payload),
            message_opcode: None,
            fragments: Vec::new(),
            handler: Some(Box::new(handler)),
            close_code: None,
            close_reason: String::new(),
            close_timer: None,
            closed_emitted: false,
        }));

        let weak = Rc::downgrade(&inner);
        adapter.on_receive(move |bytes| match weak.upgrade() {
            Some(inner) => on_bytes(&inner, bytes),
            None => ReadControl::Stop,
        });
        let weak = Rc::downgrade(&inner);
        adapter.on_close(move |reason| {
            if let Some(inner) = weak.upgrade() {
                on_socket_closed(&inner, &reason);
            }
        });

        Self { inner }
    }

    pub fn is_open(&self) -> bool {
        self.inner.borrow().state == WsState::Open
    }

    /// Send a single unfragmented text frame. Returns false unless open.
    pub fn send_text(&self, text: &str) -> bool {
        self.send_data(Opcode::Text, text.as_bytes())
    }

    /// Send a single unfragmented binary frame. Returns false unless open.
    pub fn send_binary(&self, bytes: &[u8]) -> bool {
        self.send_data(Opcode::Binary, bytes)
    }

    /// Keepalive probe; the peer must answer with a Pong. Payload caps at
    /// 125 bytes.
    pub fn send_ping(&self, payload: &[u8]) -> bool {
        if payload.len() > 125 {
            warn!(len = payload.len(), "ping payload too long, not sent");
            return false;
        }
        self.send_data(Opcode::Ping, payload)
    }

    fn send_data(&self, opcode: Opcode, payload: &[u8]) -> bool {
        let adapter = {
            let b = self.inner.borrow();
            if b.state != WsState::Open {
                debug!(?opcode, "send on a non-open session dropped");
                return false;
            }
            b.adapter.clone()
        };
        let mut out = Vec::with_capacity(payload.len() + 10);
        encode_frame(&mut out, true, opcode, payload);
        adapter.write_bytes(&out);
        true
    }

    /// Send a Close frame and wait (bounded) for the peer's Close before
    /// closing the socket.
    pub fn clean_close(&self, code: u16, reason: &str) {
        let (reactor, adapter, timeout) = {
            let mut b = self.inner.borrow_mut();
            if b.state != WsState::Open {
                return;
            }
            b.state = WsState::Closing;
            b.close_code = Some(code);
            b.close_reason = reason.to_string();
            (b.reactor.clone(), b.adapter.clone(), b.config.close_timeout)
        };

        send_close_frame(&adapter, Some(code), reason);

        let weak = Rc::downgrade(&self.inner);
        let timer = reactor.schedule_in(timeout, Duration::ZERO, false, move |_| {
            if let Some(inner) = weak.upgrade() {
                debug!("close handshake timed out");
                let adapter = inner.borrow().adapter.clone();
                adapter.close();
            }
        });
        self.inner.borrow_mut().close_timer = Some(timer);
    }
}

fn on_bytes(inner: &Rc<RefCell<Inner>>, bytes: &[u8]) -> ReadControl {
    let state = inner.borrow().state;
    match state {
        WsState::ExpectingHandshake => on_handshake_bytes(inner, bytes),
        WsState::Open | WsState::Closing => on_frame_bytes(inner, bytes),
        WsState::Closed => ReadControl::Stop,
    }
}

fn on_handshake_bytes(inner: &Rc<RefCell<Inner>>, bytes: &[u8]) -> ReadControl {
    let fed = inner.borrow_mut().http.feed(bytes);
    match fed {
        Err(err) => {
            warn!(%err, "unparseable handshake");
            reject(inner, "malformed header block");
            ReadControl::Stop
        }
        Ok(HeaderFeed::Incomplete) => ReadControl::Continue,
        Ok(HeaderFeed::Complete { body_start }) => {
            let validated = handshake::validate_upgrade(&inner.borrow().http);
            match validated {
                Err(err) => {
                    debug!(%err, "handshake rejected");
                    reject(inner, "not a websocket upgrade");
                    ReadControl::Stop
                }
                Ok(request) => {
                    let adapter = {
                        let mut b = inner.borrow_mut();
                        b.state = WsState::Open;
                        b.adapter.clone()
                    };
                    adapter.write_bytes(&handshake::switching_protocols(&request.key));
                    emit(inner, WsEvent::Open { path: &request.path });
                    // Anything after the header block is already frames.
                    if body_start < bytes.len() {
                        return on_frame_bytes(inner, &bytes[body_start..]);
                    }
                    ReadControl::Continue
                }
            }
        }
    }
}

fn reject(inner: &Rc<RefCell<Inner>>, reason: &str) {
    let adapter = {
        let mut b = inner.borrow_mut();
        b.state = WsState::Closed;
        b.adapter.clone()
    };
    adapter.write_bytes(&handshake::bad_request(reason));
    adapter.shutdown();
}

fn on_frame_bytes(inner: &Rc<RefCell<Inner>>, bytes: &[u8]) -> ReadControl {
    let mut offset = 0;
    while offset < bytes.len() {
        let step = inner.borrow_mut().decoder.feed(&bytes[offset..]);
        match step {
            Err(err) => {
                let code = match &err {
                    WsError::FrameTooLarge(_) | WsError::MessageTooLarge(_) => 1009,
                    _ => 1002,
                };
                warn!(%err, "closing session");
                protocol_close(inner, code, "protocol violation");
                return ReadControl::Stop;
            }
            Ok((used, decoded)) => {
                offset += used;
                if let Some(frame) = decoded
                    && !handle_frame(inner, frame)
                {
                    return ReadControl::Stop;
                }
            }
        }
    }
    match inner.borrow().state {
        WsState::Closed => ReadControl::Stop,
        _ => ReadControl::Continue,
    }
}

/// Returns false when the session stopped consuming input.
fn handle_frame(inner: &Rc<RefCell<Inner>>, frame: Frame) -> bool {
    match frame.opcode {
        Opcode::Text | Opcode::Binary => {
            if inner.borrow().state == WsState::Closing {
                // We already sent our Close; data frames are dropped.
                return true;
            }
            if inner.borrow().message_opcode.is_some() {
                protocol_close(inner, 1002, "expected a continuation frame");
                return false;
            }
            // The message cap binds whether or not the message fragments.
            if frame.payload.len() > inner.borrow().config.max_message {
                protocol_close(inner, 1009, "message too big");
                return false;
            }
            if frame.fin {
                return deliver_message(inner, frame.opcode, &frame.payload);
            }
            let mut b = inner.borrow_mut();
            b.message_opcode = Some(frame.opcode);
            b.fragments = frame.payload;
            true
        }

        Opcode::Continuation => {
            let completed = {
                let mut b = inner.borrow_mut();
                if b.message_opcode.is_none() {
                    drop(b);
                    protocol_close(inner, 1002, "continuation without a message");
                    return false;
                }
                if b.fragments.len() + frame.payload.len() > b.config.max_message {
                    drop(b);
                    protocol_close(inner, 1009, "message too big");
                    return false;
                }
                b.fragments.extend_from_slice(&frame.payload);
                if frame.fin {
                    let opcode = b.message_opcode.take().unwrap_or(Opcode::Binary);
                    Some((opcode, std::mem::take(&mut b.fragments)))
                } else {
                    None
                }
            };
            match completed {
                Some((opcode, payload)) => deliver_message(inner, opcode, &payload),
                None => true,
            }
        }

        Opcode::Ping => {
            let adapter = {
                let b = inner.borrow();
                (b.state == WsState::Open).then(|| b.adapter.clone())
            };
            if let Some(adapter) = adapter {
                let mut out = Vec::with_capacity(frame.payload.len() + 2);
                encode_frame(&mut out, true, Opcode::Pong, &frame.payload);
                adapter.write_bytes(&out);
            }
            true
        }

        Opcode::Pong => {
            debug!(len = frame.payload.len(), "pong received");
            true
        }

        Opcode::Close => {
            if frame.payload.len() == 1 {
                protocol_close(inner, 1002, "one-byte close payload");
                return false;
            }
            let code = (frame.payload.len() >= 2)
                .then(|| u16::from_be_bytes([frame.payload[0], frame.payload[1]]));
            let reason = if frame.payload.len() > 2 {
                String::from_utf8_lossy(&frame.payload[2..]).into_owned()
            } else {
                String::new()
            };

            let (state, adapter, timer) = {
                let mut b = inner.borrow_mut();
                let state = b.state;
                b.close_code = b.close_code.or(code);
                if b.close_reason.is_empty() {
                    b.close_reason = reason;
                }
                (state, b.adapter.clone(), b.close_timer.take())
            };
            match state {
                WsState::Open => {
                    // Echo the code, flush, then close the socket.
                    inner.borrow_mut().state = WsState::Closing;
                    send_close_frame(&adapter, code, "");
                    adapter.shutdown();
                }
                WsState::Closing => {
                    // Peer answered our Close; the outbound frame is already
                    // queued, just drain and close.
                    if let Some(timer) = timer {
                        timer.cancel();
                    }
                    adapter.shutdown();
                }
                _ => {}
            }
            false
        }
    }
}

fn deliver_message(inner: &Rc<RefCell<Inner>>, opcode: Opcode, payload: &[u8]) -> bool {
    if opcode == Opcode::Text {
        // RFC 6455 validates complete messages, not individual fragments.
        match std::str::from_utf8(payload) {
            Ok(text) => emit(inner, WsEvent::Text(text)),
            Err(_) => {
                protocol_close(inner, 1007, "text message is not valid UTF-8");
                return false;
            }
        }
    } else {
        emit(inner, WsEvent::Binary(payload));
    }
    true
}

/// Fatal inbound violation: send a Close with `code`, drain, close.
fn protocol_close(inner: &Rc<RefCell<Inner>>, code: u16, reason: &str) {
    let adapter = {
        let mut b = inner.borrow_mut();
        if b.state == WsState::Closed {
            return;
        }
        b.state = WsState::Closed;
        b.close_code = Some(code);
        if b.close_reason.is_empty() {
            b.close_reason = reason.to_string();
        }
        b.adapter.clone()
    };
    send_close_frame(&adapter, Some(code), reason);
    adapter.shutdown();
}

fn send_close_frame(adapter: &SocketAdapter, code: Option<u16>, reason: &str) {
    let mut payload = Vec::new();
    if let Some(code) = code {
        payload.extend(code.to_be_bytes());
        // Control payload cap is 125 bytes, 2 already used by the code.
        let reason = &reason.as_bytes()[..reason.len().min(123)];
        payload.extend_from_slice(reason);
    }
    let mut out = Vec::with_capacity(payload.len() + 4);
    encode_frame(&mut out, true, Opcode::Close, &payload);
    adapter.write_bytes(&out);
}

fn on_socket_closed(inner: &Rc<RefCell<Inner>>, reason: &CloseReason) {
    let (emitting, code, close_reason) = {
        let mut b = inner.borrow_mut();
        if let Some(timer) = b.close_timer.take() {
            timer.cancel();
        }
        b.state = WsState::Closed;
        let emitting = !b.closed_emitted;
        b.closed_emitted = true;
        (emitting, b.close_code, std::mem::take(&mut b.close_reason))
    };
    if emitting {
        debug!(?reason, "session closed");
        emit(inner, WsEvent::Closed { code, reason: &close_reason });
    }
    // Handlers routinely close over their own session handle; dropping ours
    // breaks that cycle once the session is over.
    let mut b = inner.borrow_mut();
    b.handler = None;
    b.fragments = Vec::new();
}

fn emit(inner: &Rc<RefCell<Inner>>, event: WsEvent<'_>) {
    let handler = inner.borrow_mut().handler.take();
    if let Some(mut handler) = handler {
        handler(event);
        let mut b = inner.borrow_mut();
        if b.handler.is_none() {
            b.handler = Some(handler);
        }
    }
}
