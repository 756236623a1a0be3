//! Server role: an HTTP/1.1 listener that only talks to verified clients.
//!
//! Every accepted connection must present a certificate chaining to the
//! server's CA bundle. There is no further authorization; whoever holds a
//! valid certificate reaches the handler.

use std::convert::Infallible;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::path::PathBuf;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http::{Request, Response};
use http_body_util::Full;
use hyper::body::Incoming;
use hyper::server::conn::http1;
use hyper::service::service_fn;
use hyper_util::rt::TokioIo;
use rustls::pki_types::CertificateDer;
use tokio::net::{TcpListener, TcpStream};
use tracing::{debug, info, warn};

use crate::config::VERIFIED_BODY;
use crate::error::{Error, Result};
use crate::identity::{Identity, IdentityPaths};
use crate::tls::TlsAcceptor;

/// Boxed future returned by [`Handler::handle`].
pub type HandlerFuture = Pin<Box<dyn Future<Output = Response<Full<Bytes>>> + Send>>;

/// Produces the response for one request.
///
/// Implemented for any `Fn(Request<Incoming>) -> impl Future<Output =
/// Response<Full<Bytes>>>` that is `Send + Sync + 'static`:
///
/// ```rust,ignore
/// let handler: Arc<dyn Handler> = Arc::new(|req: Request<Incoming>| async move {
///     Response::new(Full::new(Bytes::from(format!("hello {}", req.uri()))))
/// });
/// ```
pub trait Handler: Send + Sync + 'static {
    fn handle(&self, req: Request<Incoming>) -> HandlerFuture;
}

impl<F, Fut> Handler for F
where
    F: Fn(Request<Incoming>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Response<Full<Bytes>>> + Send + 'static,
{
    fn handle(&self, req: Request<Incoming>) -> HandlerFuture {
        Box::pin(self(req))
    }
}

/// The handler used when none is given: `200 OK` with body
/// `Request verified!` for every request.
#[derive(Debug, Clone, Copy, Default)]
pub struct Verified;

impl Handler for Verified {
    fn handle(&self, _req: Request<Incoming>) -> HandlerFuture {
        Box::pin(async { Response::new(Full::new(Bytes::from_static(VERIFIED_BODY.as_bytes()))) })
    }
}

/// The verified certificate chain of the client, leaf first.
///
/// Inserted into the extensions of every request handed to a [`Handler`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PeerCertificates(Vec<CertificateDer<'static>>);

impl PeerCertificates {
    /// The client's own certificate.
    pub fn leaf(&self) -> Option<&CertificateDer<'static>> {
        self.0.first()
    }

    pub fn chain(&self) -> &[CertificateDer<'static>] {
        &self.0
    }
}

/// Holds the paths to a CA bundle, a server certificate and its key.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Server {
    paths: IdentityPaths,
}

impl Server {
    /// Create a server from the paths of its CA bundle, certificate and key.
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        server_cert: impl Into<PathBuf>,
        server_key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            paths: IdentityPaths::new(ca_cert, server_cert, server_key),
        }
    }

    /// The credential paths loaded by [`Server::bind`].
    pub fn paths(&self) -> &IdentityPaths {
        &self.paths
    }

    /// Serve `handler` on `addr` until a fatal error occurs.
    ///
    /// Without a handler every verified request gets `200 Request verified!`.
    ///
    /// # Errors
    ///
    /// Credential errors before anything is bound, `Error::Bind` if the
    /// address cannot be bound, `Error::Io` if accepting fails fatally.
    pub async fn listen(&self, addr: &str, handler: Option<Arc<dyn Handler>>) -> Result<()> {
        self.bind(addr, handler).await?.serve().await
    }

    /// Load credentials and bind `addr` without serving yet.
    pub async fn bind(&self, addr: &str, handler: Option<Arc<dyn Handler>>) -> Result<Listener> {
        let config = Identity::load(&self.paths)?.server_config()?;

        let listener = TcpListener::bind(addr).await.map_err(|e| Error::Bind {
            addr: addr.to_string(),
            reason: e.to_string(),
        })?;
        let local_addr = listener.local_addr()?;
        info!(addr = %local_addr, "mTLS server listening");

        Ok(Listener {
            listener,
            local_addr,
            acceptor: TlsAcceptor::new(config),
            handler: handler.unwrap_or_else(|| Arc::new(Verified)),
        })
    }
}

/// A bound server socket, see [`Server::bind`].
pub struct Listener {
    listener: TcpListener,
    local_addr: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<dyn Handler>,
}

impl Listener {
    /// The address actually bound, with the real port when `:0` was requested.
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept connections forever, each on its own task.
    ///
    /// A failed TLS handshake only drops that connection.
    pub async fn serve(self) -> Result<()> {
        let mut backoff = Duration::ZERO;
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => {
                    backoff = Duration::ZERO;
                    accepted
                }
                Err(err) if is_transient(&err) => {
                    backoff = (backoff * 2).clamp(Duration::from_millis(5), Duration::from_secs(1));
                    warn!(error = %err, ?backoff, "accept failed, retrying");
                    tokio::time::sleep(backoff).await;
                    continue;
                }
                Err(err) => return Err(err.into()),
            };

            let acceptor = self.acceptor.clone();
            let handler = Arc::clone(&self.handler);
            tokio::spawn(serve_connection(stream, peer, acceptor, handler));
        }
    }
}

/// Per-process and system-wide open file limits (EMFILE, ENFILE).
const EMFILE: i32 = 24;
const ENFILE: i32 = 23;

fn is_transient(err: &io::Error) -> bool {
    matches!(
        err.kind(),
        io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionReset
            | io::ErrorKind::Interrupted
            | io::ErrorKind::WouldBlock
    ) || matches!(err.raw_os_error(), Some(EMFILE | ENFILE))
}

async fn serve_connection(
    stream: TcpStream,
    peer: SocketAddr,
    acceptor: TlsAcceptor,
    handler: Arc<dyn Handler>,
) {
    let tls = match acceptor.accept(stream).await {
        Ok(tls) => tls,
        Err(err) => {
            warn!(%peer, error = %err, "TLS handshake failed");
            return;
        }
    };

    let peer_certs = PeerCertificates(
        tls.get_ref()
            .1
            .peer_certificates()
            .map(<[CertificateDer<'static>]>::to_vec)
            .unwrap_or_default(),
    );
    debug!(%peer, chain_len = peer_certs.chain().len(), "client verified");

    let service = service_fn(move |mut req: Request<Incoming>| {
        let handler = Arc::clone(&handler);
        req.extensions_mut().insert(peer_certs.clone());
        async move { Ok::<_, Infallible>(handler.handle(req).await) }
    });

    if let Err(err) = http1::Builder::new()
        .serve_connection(TokioIo::new(tls), service)
        .with_upgrades()
        .await
    {
        debug!(%peer, error = %err, "connection closed with error");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_closure_is_handler() {
        fn assert_handler<H: Handler>(_: &H) {}
        let handler = |_req: Request<Incoming>| async { Response::new(Full::new(Bytes::new())) };
        assert_handler(&handler);
        let _: Arc<dyn Handler> = Arc::new(handler);
    }

    #[test]
    fn test_transient_accept_errors() {
        assert!(is_transient(&io::Error::from(io::ErrorKind::ConnectionAborted)));
        assert!(is_transient(&io::Error::from_raw_os_error(EMFILE)));
        assert!(is_transient(&io::Error::from_raw_os_error(ENFILE)));
        assert!(!is_transient(&io::Error::from(io::ErrorKind::InvalidInput)));
    }

    #[tokio::test]
    async fn test_bind_missing_files() {
        let server = Server::new("/nonexistent/ca.pem", "/nonexistent/s.pem", "/nonexistent/k.pem");
        let err = server.bind("127.0.0.1:0", None).await.err().unwrap();
        assert!(matches!(err, Error::FileRead { .. }));
    }
}
