//! Server side of the upgrade, for use inside a [`Handler`](crate::Handler).

use base64::{Engine as _, engine::general_purpose::STANDARD as BASE64};
use bytes::Bytes;
use http::header::{self, HeaderValue};
use http::{Method, Request, Response, StatusCode};
use http_body_util::Full;
use hyper::upgrade::{OnUpgrade, Upgraded};
use hyper_util::rt::TokioIo;
use tracing::debug;

use crate::config::Limits;
use crate::duplex::connection::{Connection, Role};
use crate::duplex::handshake::{compute_accept_key, header_has_token};
use crate::error::{Error, Result};

/// An accepted upgrade whose stream becomes available once the `101`
/// response has been written.
pub struct PendingUpgrade {
    on_upgrade: OnUpgrade,
    limits: Limits,
    protocol: Option<String>,
}

impl PendingUpgrade {
    /// The subprotocol selected for this connection, if any.
    pub fn protocol(&self) -> Option<&str> {
        self.protocol.as_deref()
    }

    /// Replace the default limits for the resulting connection.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }

    /// Wait for the HTTP layer to hand over the stream.
    ///
    /// Must be awaited after the response returned by [`upgrade`] has been
    /// passed back to the server, typically from a spawned task.
    pub async fn connect(self) -> Result<Connection<TokioIo<Upgraded>>> {
        let upgraded = self.on_upgrade.await?;
        debug!(protocol = ?self.protocol, "duplex connection upgraded");
        Ok(Connection::new(TokioIo::new(upgraded), Role::Server, self.limits))
    }
}

/// Validate an upgrade request and prepare the `101 Switching Protocols`
/// response.
///
/// The first subprotocol offered by the client that also appears in
/// `protocols` is selected.
///
/// # Errors
///
/// Returns `Error::InvalidHandshake` if the request is not a version 13
/// upgrade with a well-formed key. Handlers usually answer `400` then.
pub fn upgrade<B>(
    req: &mut Request<B>,
    protocols: &[&str],
) -> Result<(Response<Full<Bytes>>, PendingUpgrade)> {
    if req.method() != Method::GET {
        return Err(Error::InvalidHandshake(format!(
            "Expected GET method, got {}",
            req.method()
        )));
    }

    let headers = req.headers();
    if !header_has_token(headers, &header::UPGRADE, "websocket") {
        return Err(Error::InvalidHandshake("Missing Upgrade header".into()));
    }
    if !header_has_token(headers, &header::CONNECTION, "upgrade") {
        return Err(Error::InvalidHandshake("Missing Connection header".into()));
    }
    if headers
        .get(header::SEC_WEBSOCKET_VERSION)
        .is_none_or(|v| v.as_bytes() != b"13")
    {
        return Err(Error::InvalidHandshake(
            "Unsupported WebSocket version (expected 13)".into(),
        ));
    }

    let key = headers
        .get(header::SEC_WEBSOCKET_KEY)
        .and_then(|v| v.to_str().ok())
        .ok_or_else(|| Error::InvalidHandshake("Missing Sec-WebSocket-Key header".into()))?;
    match BASE64.decode(key) {
        Ok(decoded) if decoded.len() == 16 => {}
        _ => {
            return Err(Error::InvalidHandshake(
                "Sec-WebSocket-Key must be 16 base64-encoded bytes".into(),
            ));
        }
    }

    let protocol = headers
        .get_all(header::SEC_WEBSOCKET_PROTOCOL)
        .iter()
        .filter_map(|v| v.to_str().ok())
        .flat_map(|v| v.split(','))
        .map(str::trim)
        .find(|offered| protocols.contains(offered))
        .map(str::to_string);

    let accept = compute_accept_key(key);

    let mut builder = Response::builder()
        .status(StatusCode::SWITCHING_PROTOCOLS)
        .header(header::UPGRADE, "websocket")
        .header(header::CONNECTION, "Upgrade")
        .header(header::SEC_WEBSOCKET_ACCEPT, accept);
    if let Some(protocol) = &protocol {
        builder = builder.header(
            header::SEC_WEBSOCKET_PROTOCOL,
            HeaderValue::from_str(protocol).map_err(|_| Error::InvalidHeaderValue {
                header: header::SEC_WEBSOCKET_PROTOCOL.to_string(),
                reason: "not visible ASCII".to_string(),
            })?,
        );
    }
    let response = builder.body(Full::new(Bytes::new()))?;

    let pending = PendingUpgrade {
        on_upgrade: hyper::upgrade::on(req),
        limits: Limits::default(),
        protocol,
    };

    Ok((response, pending))
}
