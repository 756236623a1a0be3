//! Client role: one-shot HTTP requests and duplex connections over mTLS.
//!
//! A [`Client`] only remembers where its credentials live. Every call reads
//! them again, so certificates rotated on disk take effect on the next
//! request without rebuilding anything.

use std::error::Error as StdError;
use std::path::PathBuf;
use std::sync::Arc;

use bytes::Bytes;
use http::header::{self, HeaderMap, HeaderValue};
use http::uri::PathAndQuery;
use http::{Request, Response, Uri};
use hyper::body::{Body, Incoming};
use hyper_util::rt::TokioIo;
use rustls::ClientConfig;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tracing::{debug, info};

use crate::config::DialConfig;
use crate::duplex::{
    ClientRequest, Connection, Role, generate_key, parse_response, read_response_head,
    validate_response,
};
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityPaths};
use crate::proxy::connect_tunnel;
use crate::tls::{MaybeTlsStream, TlsConnector};

/// The client end of a duplex connection returned by [`Client::dial`].
pub type ClientConnection = Connection<MaybeTlsStream<TcpStream>>;

/// Holds the paths to a CA bundle, a client certificate and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Client {
    paths: IdentityPaths,
}

impl Client {
    /// Create a client from the paths of its CA bundle, certificate and key.
    ///
    /// Nothing is read until the client is used.
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        client_cert: impl Into<PathBuf>,
        client_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            paths: IdentityPaths::new(ca_cert, client_cert, client_key),
        }
    }

    /// The credential paths this client reads on every call.
    pub fn paths(&self) -> &IdentityPaths {
        &self.paths
    }

    /// Build an HTTP transport that presents this client's certificate and
    /// trusts only servers signed by the configured CA bundle.
    ///
    /// # Errors
    ///
    /// Any error from [`Identity::load`] or [`Identity::client_config`].
    pub fn http_client(&self) -> Result<HttpClient> {
        let config = Identity::load(&self.paths)?.client_config()?;
        Ok(HttpClient::new(config))
    }

    /// Send a single request over a freshly built transport.
    ///
    /// # Errors
    ///
    /// Credential errors as returned by [`Client::http_client`], TLS failures
    /// as `Error::TlsHandshake` and other transport failures as `Error::Http`.
    pub async fn request<B>(&self, req: Request<B>) -> Result<Response<Incoming>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        self.http_client()?.send(req).await
    }

    /// Open a duplex connection to a `ws://` or `wss://` URI.
    ///
    /// `headers` are sent with the upgrade request. Proxies are taken from
    /// the environment and the whole handshake must finish within 45 seconds.
    /// Returns the connection and the server's handshake response.
    ///
    /// # Errors
    ///
    /// - credential errors as for [`Client::http_client`]
    /// - `Error::HandshakeTimeout` if the handshake does not finish in time
    /// - `Error::HandshakeRejected` if the server answers with anything but `101`
    pub async fn dial(
        &self,
        uri: &str,
        headers: &HeaderMap,
    ) -> Result<(ClientConnection, Response<()>)> {
        self.dial_with(uri, headers, &DialConfig::default()).await
    }

    /// [`Client::dial`] with explicit timeout, proxy and limits.
    pub async fn dial_with(
        &self,
        uri: &str,
        headers: &HeaderMap,
        config: &DialConfig,
    ) -> Result<(ClientConnection, Response<()>)> {
        let uri: Uri = uri
            .parse()
            .map_err(|e| Error::InvalidUri(format!("{uri}: {e}")))?;
        let secure = match uri.scheme_str() {
            Some("wss") => true,
            Some("ws") => false,
            _ => {
                return Err(Error::InvalidUri(format!(
                    "expected ws:// or wss:// scheme: {uri}"
                )));
            }
        };

        let tls = TlsConnector::new(Identity::load(&self.paths)?.client_config()?);
        let request = ClientRequest::new(&uri, generate_key()?, headers)?;

        tokio::time::timeout(
            config.handshake_timeout,
            handshake(&uri, secure, &tls, &request, config),
        )
        .await
        .map_err(|_| Error::HandshakeTimeout(config.handshake_timeout))?
    }
}

async fn handshake(
    uri: &Uri,
    secure: bool,
    tls: &TlsConnector,
    request: &ClientRequest,
    config: &DialConfig,
) -> Result<(ClientConnection, Response<()>)> {
    let host = uri
        .host()
        .ok_or_else(|| Error::InvalidUri(format!("missing host in {uri}")))?;
    let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });
    let scheme = if secure { "wss" } else { "ws" };

    let tcp = match config.proxy.proxy_for(scheme, host, port) {
        Some(proxy) => {
            debug!(%uri, %proxy, "dialing through proxy");
            connect_tunnel(&proxy, host, port).await?
        }
        None => {
            debug!(%uri, "dialing");
            TcpStream::connect(format!("{host}:{port}")).await?
        }
    };
    tcp.set_nodelay(true)?;

    let mut stream = if secure {
        tls.connect(host, tcp).await?
    } else {
        MaybeTlsStream::Plain(tcp)
    };

    let mut buf = Vec::with_capacity(256);
    request.write(&mut buf)?;
    stream.write_all(&buf).await?;
    stream.flush().await?;

    let (head, rest) = read_response_head(&mut stream, &config.limits).await?;
    let response = parse_response(&head)?;
    validate_response(&response, &request.key)?;

    info!(%uri, tls = stream.is_tls(), "duplex connection established");
    let conn = Connection::with_buffered(stream, Role::Client, config.limits.clone(), rest);
    Ok((conn, response))
}

/// An HTTP/1.1 transport bound to one client TLS configuration.
///
/// Each [`send`](HttpClient::send) opens a new connection; nothing is pooled.
#[derive(Clone)]
pub struct HttpClient {
    tls: TlsConnector,
}

impl HttpClient {
    /// Wrap a client TLS configuration, usually from [`Identity::client_config`].
    pub fn new(config: Arc<ClientConfig>) -> Self {
        Self {
            tls: TlsConnector::new(config),
        }
    }

    /// Send `req` to the host named in its URI.
    ///
    /// `https` URIs are sent over mTLS, `http` URIs over plain TCP. The
    /// request target is rewritten to origin form and a `Host` header is
    /// added when missing.
    pub async fn send<B>(&self, mut req: Request<B>) -> Result<Response<Incoming>>
    where
        B: Body + Send + 'static,
        B::Data: Send,
        B::Error: Into<Box<dyn StdError + Send + Sync>>,
    {
        let uri = req.uri().clone();
        let secure = match uri.scheme_str() {
            Some("https") => true,
            Some("http") => false,
            _ => {
                return Err(Error::InvalidUri(format!(
                    "expected http:// or https:// scheme: {uri}"
                )));
            }
        };
        let host = uri
            .host()
            .ok_or_else(|| Error::InvalidUri(format!("missing host in {uri}")))?;
        let port = uri.port_u16().unwrap_or(if secure { 443 } else { 80 });

        let addr = format!("{host}:{port}");
        let tcp = TcpStream::connect(&addr)
            .await
            .map_err(|e| Error::Http(format!("failed to connect to {addr}: {e}")))?;

        let stream = if secure {
            self.tls.connect(host, tcp).await?
        } else {
            MaybeTlsStream::Plain(tcp)
        };

        let (mut sender, conn) = hyper::client::conn::http1::handshake(TokioIo::new(stream)).await?;
        tokio::spawn(async move {
            if let Err(err) = conn.await {
                debug!(error = %err, "http connection closed with error");
            }
        });

        if !req.headers().contains_key(header::HOST) {
            let value = match uri.port_u16() {
                Some(port) => format!("{host}:{port}"),
                None => host.to_string(),
            };
            let value = HeaderValue::from_str(&value).map_err(|_| Error::InvalidHeaderValue {
                header: header::HOST.to_string(),
                reason: "not a valid header value".to_string(),
            })?;
            req.headers_mut().insert(header::HOST, value);
        }
        *req.uri_mut() = origin_form(&uri);

        debug!(method = %req.method(), %uri, "sending request");
        Ok(sender.send_request(req).await?)
    }
}

fn origin_form(uri: &Uri) -> Uri {
    let path = uri
        .path_and_query()
        .cloned()
        .unwrap_or_else(|| PathAndQuery::from_static("/"));
    Uri::from(path)
}

/// Shorthand for building an empty-bodied `GET` request.
///
/// # Errors
///
/// Returns `Error::Http` if `uri` is not a valid request target.
pub fn get(uri: &str) -> Result<Request<http_body_util::Empty<Bytes>>> {
    Ok(Request::get(uri).body(http_body_util::Empty::new())?)
}
