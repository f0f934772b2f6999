use base64::{Engine, engine::general_purpose::STANDARD};
use sha1::{Digest, Sha1};

use super::WsError;
use crate::HttpHeaderParser;

const ACCEPT_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// `base64(SHA1(key ++ magic))` per RFC 6455 §4.2.2.
pub(crate) fn accept_token(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(ACCEPT_MAGIC.as_bytes());
    STANDARD.encode(sha.finalize())
}

pub(crate) struct UpgradeRequest {
    pub path: String,
    pub key: String,
}

/// Validate a completed header block as a WebSocket upgrade.
pub(crate) fn validate_upgrade(parser: &HttpHeaderParser) -> Result<UpgradeRequest, WsError> {
    let mut parts = parser.start_line().split_whitespace();
    let method = parts.next().ok_or(WsError::Handshake("empty request line"))?;
    if method != "GET" {
        return Err(WsError::Handshake("method must be GET"));
    }
    let path = parts.next().ok_or(WsError::Handshake("missing request target"))?.to_string();
    let version = parts.next().ok_or(WsError::Handshake("missing HTTP version"))?;
    if !http_version_at_least_1_1(version) {
        return Err(WsError::Handshake("HTTP version below 1.1"));
    }

    let upgrade = parser.get("upgrade").unwrap_or_default();
    if !contains_token(&upgrade, "websocket") {
        return Err(WsError::Handshake("missing Upgrade: websocket"));
    }
    let connection = parser.get("connection").unwrap_or_default();
    if !contains_token(&connection, "upgrade") {
        return Err(WsError::Handshake("Connection does not include Upgrade"));
    }
    if parser.get("sec-websocket-version").as_deref().map(str::trim) != Some("13") {
        return Err(WsError::Handshake("unsupported Sec-WebSocket-Version"));
    }

    let key = parser
        .get("sec-websocket-key")
        .ok_or(WsError::Handshake("missing Sec-WebSocket-Key"))?
        .trim()
        .to_string();
    match STANDARD.decode(&key) {
        Ok(raw) if raw.len() == 16 => {}
        _ => return Err(WsError::Handshake("Sec-WebSocket-Key is not 16 base64 bytes")),
    }

    Ok(UpgradeRequest { path, key })
}

pub(crate) fn switching_protocols(key: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\
         \r\n",
        accept_token(key)
    )
    .into_bytes()
}

pub(crate) fn bad_request(reason: &str) -> Vec<u8> {
    format!(
        "HTTP/1.1 400 Bad Request\r\n\
         Connection: close\r\n\
         Content-Type: text/plain\r\n\
         Content-Length: {}\r\n\
         \r\n\
         {reason}",
        reason.len()
    )
    .into_bytes()
}

fn http_version_at_least_1_1(version: &str) -> bool {
    let Some(rest) = version.strip_prefix("HTTP/") else { return false };
    let Some((major, minor)) = rest.split_once('.') else { return false };
    let (Ok(major), Ok(minor)) = (major.parse::<u32>(), minor.parse::<u32>()) else {
        return false;
    };
    major > 1 || (major == 1 && minor >= 1)
}

/// Case-insensitive membership in a comma-separated header value.
fn contains_token(value: &str, token: &str) -> bool {
    value.split(',').any(|part| part.trim().eq_ignore_ascii_case(token))
}
