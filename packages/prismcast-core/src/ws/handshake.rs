//! HTTP Upgrade handshake (RFC 6455 opening handshake).

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use sha1::{Digest, Sha1};
use thiserror::Error;

/// GUID appended to the client key before hashing, fixed by RFC 6455.
const WS_MAGIC: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Upper bound on the upgrade request; anything larger is rejected rather
/// than buffered indefinitely.
pub const MAX_REQUEST_BYTES: usize = 16 * 1024;

/// Rejected handshake, mapped to the HTTP status we answer with.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    #[error("malformed HTTP request")]
    BadRequest,

    #[error("missing or invalid upgrade headers")]
    NotUpgrade,

    #[error("missing Origin header")]
    MissingOrigin,

    #[error("request exceeds {MAX_REQUEST_BYTES} bytes")]
    TooLarge,
}

impl HandshakeError {
    pub fn status_code(&self) -> u16 {
        match self {
            Self::MissingOrigin => 403,
            _ => 400,
        }
    }
}

/// The fields we keep from an accepted upgrade request.
#[derive(Debug, PartialEq, Eq)]
pub struct UpgradeRequest {
    pub path: String,
    pub key: String,
    pub origin: String,
}

/// Computes `Sec-WebSocket-Accept` for a client key.
pub fn accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_MAGIC.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Parses an HTTP request from the front of `buf`.
///
/// Returns `Ok(None)` while the request is still incomplete. On success the
/// consumed byte count is returned alongside the request so the caller can
/// drop the header bytes from its read buffer.
pub fn parse_upgrade(buf: &[u8]) -> Result<Option<(UpgradeRequest, usize)>, HandshakeError> {
    let mut headers = [httparse::EMPTY_HEADER; 32];
    let mut req = httparse::Request::new(&mut headers);

    let consumed = match req.parse(buf) {
        Ok(httparse::Status::Complete(n)) => n,
        Ok(httparse::Status::Partial) => {
            if buf.len() > MAX_REQUEST_BYTES {
                return Err(HandshakeError::TooLarge);
            }
            return Ok(None);
        }
        Err(_) => return Err(HandshakeError::BadRequest),
    };

    if req.method != Some("GET") {
        return Err(HandshakeError::NotUpgrade);
    }
    let path = req.path.ok_or(HandshakeError::BadRequest)?.to_string();

    let header = |name: &str| {
        req.headers
            .iter()
            .find(|h| h.name.eq_ignore_ascii_case(name))
            .and_then(|h| std::str::from_utf8(h.value).ok())
            .map(str::trim)
    };

    let upgrade_ok = header("Upgrade").is_some_and(|v| v.eq_ignore_ascii_case("websocket"));
    // Connection is a comma-separated token list, e.g. "keep-alive, Upgrade"
    let connection_ok = header("Connection").is_some_and(|v| {
        v.split(',')
            .any(|token| token.trim().eq_ignore_ascii_case("upgrade"))
    });
    if !upgrade_ok || !connection_ok {
        return Err(HandshakeError::NotUpgrade);
    }

    let key = header("Sec-WebSocket-Key")
        .ok_or(HandshakeError::NotUpgrade)?
        .to_string();
    let origin = header("Origin")
        .ok_or(HandshakeError::MissingOrigin)?
        .to_string();

    Ok(Some((UpgradeRequest { path, key, origin }, consumed)))
}

/// The `101 Switching Protocols` response for an accepted key.
pub fn response_101(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        accept_key(key)
    )
}

/// A terse error response for a rejected handshake.
pub fn response_error(err: &HandshakeError) -> String {
    let (code, reason) = match err.status_code() {
        403 => (403, "Forbidden"),
        _ => (400, "Bad Request"),
    };
    format!("HTTP/1.1 {code} {reason}\r\nConnection: close\r\nContent-Length: 0\r\n\r\n")
}
