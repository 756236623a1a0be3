//! Client side of the HTTP/1.1 upgrade handshake (RFC 6455 section 4).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use http::header::{self, HeaderMap, HeaderName, HeaderValue};
use http::{Response, StatusCode, Uri, Version};
use sha1::{Digest, Sha1};
use tokio::io::{AsyncRead, AsyncReadExt};

use crate::config::Limits;
use crate::error::{Error, Result};

/// The GUID appended to the key when computing `Sec-WebSocket-Accept`.
pub const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Headers the dialer sets itself; callers may not supply them.
const RESERVED_HEADERS: [&str; 5] = [
    "upgrade",
    "connection",
    "sec-websocket-key",
    "sec-websocket-version",
    "sec-websocket-extensions",
];

/// Computes the `Sec-WebSocket-Accept` value for a client key.
///
/// ```
/// use rsmtls::duplex::compute_accept_key;
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

/// Generate a fresh `Sec-WebSocket-Key`: 16 random bytes, base64 encoded.
///
/// # Errors
///
/// Returns `Error::Io` if the system random source is unavailable.
pub fn generate_key() -> Result<String> {
    let mut bytes = [0u8; 16];
    getrandom::getrandom(&mut bytes).map_err(|e| Error::Io(e.to_string()))?;
    Ok(BASE64.encode(bytes))
}

/// An upgrade request ready to be written to the wire.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ClientRequest {
    /// Request target in origin form, e.g. `/chat?room=1`.
    pub path: String,
    /// Value of the `Host` header.
    pub host: String,
    /// The `Sec-WebSocket-Key` sent with this request.
    pub key: String,
    /// Extra headers supplied by the caller.
    pub headers: HeaderMap,
}

impl ClientRequest {
    /// Build a request for `uri` carrying the caller's `headers`.
    ///
    /// A caller-supplied `Host` header replaces the one derived from the URI.
    ///
    /// # Errors
    ///
    /// - `Error::InvalidUri` if the URI has no host
    /// - `Error::InvalidHandshake` if `headers` contains a header the dialer
    ///   sets itself
    pub fn new(uri: &Uri, key: String, headers: &HeaderMap) -> Result<Self> {
        let authority = uri
            .authority()
            .ok_or_else(|| Error::InvalidUri(format!("missing host in {}", uri)))?;

        if let Some(name) = headers
            .keys()
            .find(|name| RESERVED_HEADERS.contains(&name.as_str()))
        {
            return Err(Error::InvalidHandshake(format!(
                "Duplicate header not allowed: {}",
                name
            )));
        }

        let mut extra = headers.clone();
        let host = match extra.remove(header::HOST) {
            Some(value) => value
                .to_str()
                .map_err(|_| invalid_value(header::HOST.as_str()))?
                .to_string(),
            None => match authority.port_u16() {
                Some(port) => format!("{}:{}", authority.host(), port),
                None => authority.host().to_string(),
            },
        };

        let path = uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .filter(|pq| !pq.is_empty())
            .unwrap_or("/")
            .to_string();

        Ok(Self {
            path,
            host,
            key,
            headers: extra,
        })
    }

    /// Serialize the request head.
    ///
    /// # Errors
    ///
    /// Returns `Error::InvalidHeaderValue` if a value contains CR or LF.
    pub fn write(&self, buf: &mut Vec<u8>) -> Result<()> {
        validate_header_value("Host", &self.host)?;
        buf.extend_from_slice(format!("GET {} HTTP/1.1\r\n", self.path).as_bytes());
        buf.extend_from_slice(format!("Host: {}\r\n", self.host).as_bytes());
        buf.extend_from_slice(b"Upgrade: websocket\r\n");
        buf.extend_from_slice(b"Connection: Upgrade\r\n");
        buf.extend_from_slice(format!("Sec-WebSocket-Key: {}\r\n", self.key).as_bytes());
        buf.extend_from_slice(b"Sec-WebSocket-Version: 13\r\n");

        for (name, value) in &self.headers {
            buf.extend_from_slice(name.as_str().as_bytes());
            buf.extend_from_slice(b": ");
            buf.extend_from_slice(value.as_bytes());
            buf.extend_from_slice(b"\r\n");
        }

        buf.extend_from_slice(b"\r\n");
        Ok(())
    }
}

fn invalid_value(header: &str) -> Error {
    Error::InvalidHeaderValue {
        header: header.to_string(),
        reason: "not visible ASCII".to_string(),
    }
}

fn validate_header_value(header_name: &str, value: &str) -> Result<()> {
    if value.contains('\r') || value.contains('\n') {
        return Err(Error::InvalidHeaderValue {
            header: header_name.to_string(),
            reason: "contains CR or LF characters".to_string(),
        });
    }
    Ok(())
}

/// Read the response head from `io`.
///
/// Returns the raw head (up to and including the blank line) and any bytes
/// that arrived after it, which belong to the framed stream.
///
/// # Errors
///
/// - `Error::HandshakeTooLarge` if no blank line appears within the limit
/// - `Error::ConnectionClosed` if the peer hangs up first
pub async fn read_response_head<S>(io: &mut S, limits: &Limits) -> Result<(Vec<u8>, Vec<u8>)>
where
    S: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 1024];

    loop {
        if let Some(end) = find_head_end(&buf) {
            let rest = buf.split_off(end);
            return Ok((buf, rest));
        }
        limits.check_handshake_size(buf.len())?;

        let n = io.read(&mut chunk).await?;
        if n == 0 {
            return Err(Error::ConnectionClosed(None));
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

fn find_head_end(buf: &[u8]) -> Option<usize> {
    buf.windows(4).position(|w| w == b"\r\n\r\n").map(|i| i + 4)
}

/// Parse a response head into an [`http::Response`].
///
/// All headers are kept, including repeated ones, so callers can inspect the
/// negotiated subprotocol or anything else the server sent.
///
/// # Errors
///
/// Returns `Error::InvalidHandshake` if the status line or a header is
/// malformed.
pub fn parse_response(head: &[u8]) -> Result<Response<()>> {
    let text = std::str::from_utf8(head)
        .map_err(|_| Error::InvalidHandshake("Invalid UTF-8".into()))?;
    let mut lines = text.split("\r\n");

    let status_line = lines
        .next()
        .filter(|line| !line.is_empty())
        .ok_or_else(|| Error::InvalidHandshake("Empty response".into()))?;

    let mut parts = status_line.splitn(3, ' ');
    let version = match parts.next() {
        Some("HTTP/1.1") => Version::HTTP_11,
        Some("HTTP/1.0") => Version::HTTP_10,
        other => {
            return Err(Error::InvalidHandshake(format!(
                "Unsupported HTTP version: {}",
                other.unwrap_or_default()
            )));
        }
    };
    let status = parts
        .next()
        .and_then(|code| StatusCode::from_bytes(code.as_bytes()).ok())
        .ok_or_else(|| Error::InvalidHandshake(format!("Invalid status line: {}", status_line)))?;

    let mut response = Response::new(());
    *response.status_mut() = status;
    *response.version_mut() = version;

    for line in lines.take_while(|line| !line.is_empty()) {
        let (name, value) = line
            .split_once(':')
            .ok_or_else(|| Error::InvalidHandshake(format!("Malformed header: {}", line)))?;
        let name = HeaderName::from_bytes(name.trim().as_bytes())
            .map_err(|_| Error::InvalidHandshake(format!("Invalid header name: {}", name)))?;
        let value = HeaderValue::from_str(value.trim())
            .map_err(|_| invalid_value(name.as_str()))?;
        response.headers_mut().append(name, value);
    }

    Ok(response)
}

/// Check that `response` completes the upgrade started with `key`.
///
/// # Errors
///
/// - `Error::HandshakeRejected` if the status is not `101`
/// - `Error::InvalidHandshake` if `Upgrade`, `Connection` or
///   `Sec-WebSocket-Accept` is missing or wrong
pub fn validate_response(response: &Response<()>, key: &str) -> Result<()> {
    if response.status() != StatusCode::SWITCHING_PROTOCOLS {
        return Err(Error::HandshakeRejected {
            status: response.status().as_u16(),
        });
    }

    let headers = response.headers();
    if !header_has_token(headers, &header::UPGRADE, "websocket") {
        return Err(Error::InvalidHandshake(
            "Missing or invalid Upgrade header in response".into(),
        ));
    }
    if !header_has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(Error::InvalidHandshake(
            "Missing or invalid Connection header in response".into(),
        ));
    }

    let accept = headers
        .get(header::SEC_WEBSOCKET_ACCEPT)
        .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Accept header".into()))?;
    if accept.as_bytes() != compute_accept_key(key).as_bytes() {
        return Err(Error::InvalidHandshake("Invalid Sec-WebSocket-Accept".into()));
    }

    Ok(())
}

/// Whether any comma-separated token of `name` equals `token`, ignoring case.
pub(crate) fn header_has_token(headers: &HeaderMap, name: &HeaderName, token: &str) -> bool {
    headers
        .get_all(name)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}
