//! WebSocket upgrade handshake (RFC 6455 §4).
//!
//! Covers the computational side of the handshake: parsing the HTTP
//! upgrade request head, validating its headers, and deriving the
//! `Sec-WebSocket-Accept` token. Reading the head off the stream and
//! writing the response are the server's job.

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use sha1::{Digest, Sha1};
use thiserror::Error;

/// Fixed GUID appended to the client key before hashing (RFC 6455).
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Errors that can occur validating an upgrade request.
///
/// Every variant maps to a 400-class rejection: the connection is
/// never promoted and no handler callback fires.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HandshakeError {
    /// Request head is not parseable HTTP.
    #[error("malformed upgrade request: {0}")]
    MalformedRequest(String),

    /// `Upgrade` header missing or not `websocket`.
    #[error("missing or invalid Upgrade header")]
    InvalidUpgrade,

    /// `Connection` header missing or lacking the `upgrade` token.
    #[error("missing or invalid Connection header")]
    InvalidConnection,

    /// `Sec-WebSocket-Key` header missing or empty.
    #[error("missing Sec-WebSocket-Key header")]
    MissingKey,
}

/// Computes the `Sec-WebSocket-Accept` token for a client key.
///
/// The token is `base64(SHA1(key + GUID))`.
///
/// # Example
///
/// ```rust
/// use shoal_protocol::compute_accept_key;
///
/// let accept = compute_accept_key("dGhlIHNhbXBsZSBub25jZQ==");
/// assert_eq!(accept, "s3pPLMBiTxaQ9kYGzzhZRbK+xOo=");
/// ```
pub fn compute_accept_key(key: &str) -> String {
    let mut hasher = Sha1::new();
    hasher.update(key.as_bytes());
    hasher.update(WS_GUID.as_bytes());
    BASE64.encode(hasher.finalize())
}

/// Builds the literal `101 Switching Protocols` response for a client
/// key, terminated by the blank line that ends the head.
pub fn accept_response(key: &str) -> String {
    format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         Upgrade: websocket\r\n\
         Connection: Upgrade\r\n\
         Sec-WebSocket-Accept: {}\r\n\r\n",
        compute_accept_key(key)
    )
}

/// A parsed HTTP upgrade request head.
#[derive(Debug, Clone)]
pub struct UpgradeRequest {
    /// Request path from the GET line.
    pub path: String,
    /// Header name/value pairs, names lowercased.
    headers: Vec<(String, String)>,
}

impl UpgradeRequest {
    /// Parses a raw request head (everything up to the blank line).
    pub fn parse(head: &[u8]) -> Result<Self, HandshakeError> {
        let text = std::str::from_utf8(head)
            .map_err(|_| HandshakeError::MalformedRequest("head is not UTF-8".into()))?;

        let mut lines = text.lines();
        let request_line = lines
            .next()
            .ok_or_else(|| HandshakeError::MalformedRequest("empty request".into()))?;

        let mut parts = request_line.split_whitespace();
        let (method, path) = match (parts.next(), parts.next(), parts.next()) {
            (Some(method), Some(path), Some(_version)) => (method, path),
            _ => {
                return Err(HandshakeError::MalformedRequest(format!(
                    "invalid request line: {request_line}"
                )));
            }
        };

        if !method.eq_ignore_ascii_case("GET") {
            return Err(HandshakeError::MalformedRequest(format!(
                "expected GET, got {method}"
            )));
        }

        let mut headers = Vec::new();
        for line in lines {
            if line.is_empty() {
                break;
            }
            if let Some((name, value)) = line.split_once(':') {
                headers.push((name.trim().to_ascii_lowercase(), value.trim().to_string()));
            }
        }

        Ok(Self {
            path: path.to_string(),
            headers,
        })
    }

    /// Returns a header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        let name = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(n, _)| *n == name)
            .map(|(_, v)| v.as_str())
    }

    /// Validates the upgrade headers, returning the client key.
    ///
    /// Requirements (header names case-insensitive):
    /// - `Upgrade` equal to `websocket` (case-insensitive);
    /// - `Connection` containing the token `upgrade` (case-insensitive
    ///   substring, so `keep-alive, Upgrade` passes);
    /// - a non-empty `Sec-WebSocket-Key`.
    pub fn validate(&self) -> Result<&str, HandshakeError> {
        match self.header("upgrade") {
            Some(v) if v.eq_ignore_ascii_case("websocket") => {}
            _ => return Err(HandshakeError::InvalidUpgrade),
        }

        match self.header("connection") {
            Some(v) if v.to_ascii_lowercase().contains("upgrade") => {}
            _ => return Err(HandshakeError::InvalidConnection),
        }

        match self.header("sec-websocket-key") {
            Some(key) if !key.is_empty() => Ok(key),
            _ => Err(HandshakeError::MissingKey),
        }
    }
}
