//! # rsmtls - Mutually authenticated TLS for HTTP and duplex connections
//!
//! `rsmtls` turns three PEM files per peer (CA bundle, certificate, private
//! key) into working mTLS transports:
//!
//! - **[`Client`]** sends one-shot HTTP requests and dials `ws`/`wss` duplex
//!   connections, presenting its certificate to the server.
//! - **[`Server`]** runs an HTTP/1.1 listener that rejects every client whose
//!   certificate does not chain to its CA bundle.
//!
//! Credentials are read from disk on every operation, so rotated files take
//! effect on the next call.
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use rsmtls::{Client, Server};
//!
//! let server = Server::new("ca.pem", "server.pem", "server.key");
//! tokio::spawn(async move { server.listen("0.0.0.0:8443", None).await });
//!
//! let client = Client::new("ca.pem", "client.pem", "client.key");
//! let response = client.request(rsmtls::client::get("https://localhost:8443/")?).await?;
//! assert_eq!(response.status(), 200);
//! ```

pub mod client;
pub mod config;
pub mod duplex;
pub mod error;
pub mod identity;
pub mod proxy;
pub mod server;
pub mod tls;

pub use client::{Client, ClientConnection, HttpClient};
pub use config::{DialConfig, Limits};
pub use duplex::{CloseCode, CloseFrame, Connection, ConnectionState, Message, Role};
pub use error::{Error, Result};
pub use identity::{Identity, IdentityPaths};
pub use proxy::ProxyConfig;
pub use server::{Handler, Listener, PeerCertificates, Server, Verified};
