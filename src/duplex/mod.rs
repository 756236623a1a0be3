//! Persistent bidirectional connections over an HTTP upgrade.
//!
//! [`Client::dial`](crate::Client::dial) produces the client end; a server
//! [`Handler`](crate::Handler) obtains the other end through [`upgrade`].
//!
//! ```rust,ignore
//! let (mut conn, _response) = client.dial("wss://localhost:8443/ws", &HeaderMap::new()).await?;
//! conn.send(Message::text("hello")).await?;
//! while let Some(msg) = conn.recv().await? {
//!     println!("{msg:?}");
//! }
//! ```

mod connection;
pub mod frame;
pub mod handshake;
mod message;
mod upgrade;

pub use connection::{Connection, ConnectionState, Role};
pub use frame::{Frame, OpCode};
pub use handshake::{
    ClientRequest, WS_GUID, compute_accept_key, generate_key, parse_response,
    read_response_head, validate_response,
};
pub use message::{CloseCode, CloseFrame, Message};
pub use upgrade::{PendingUpgrade, upgrade};
