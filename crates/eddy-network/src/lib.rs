mod adapter;
mod http;
mod listener;
pub mod ws;

pub use adapter::{AdapterConfig, CloseReason, ReadControl, SocketAdapter, WriteControl};
pub use http::{DEFAULT_MAX_HEADER_BLOCK, HeaderFeed, HttpError, HttpHeaderParser};
pub use listener::Listener;
