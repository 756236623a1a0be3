//! Error types for mTLS transport setup and duplex connections.
//!
//! Failures are reported as they happen and never retried. Errors from
//! foreign crates are carried as their display text so that [`Error`] stays
//! `Clone` and comparable.

use std::path::{Path, PathBuf};
use std::time::Duration;

use thiserror::Error;

/// Result type alias for rsmtls operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur while building or using an mTLS transport.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
#[non_exhaustive]
pub enum Error {
    /// A credential file is missing or unreadable.
    #[error("Failed to read {path:?}: {reason}")]
    FileRead {
        /// The file that could not be read.
        path: PathBuf,
        /// The underlying I/O error.
        reason: String,
    },

    /// Certificate or private key material is malformed or mismatched.
    #[error("Invalid key pair: {0}")]
    KeyPair(String),

    /// The CA bundle contained no usable certificate authority.
    #[error("No usable CA certificates in {path:?}")]
    EmptyTrustPool {
        /// The CA bundle that was read.
        path: PathBuf,
    },

    /// The TLS handshake failed or the peer rejected our certificate.
    #[error("TLS handshake failed: {0}")]
    TlsHandshake(String),

    /// The listener address could not be bound.
    #[error("Failed to bind {addr}: {reason}")]
    Bind {
        /// The requested address.
        addr: String,
        /// The underlying I/O error.
        reason: String,
    },

    /// The request or dial URI is unusable.
    #[error("Invalid URI: {0}")]
    InvalidUri(String),

    /// HTTP exchange failed after the transport was established.
    #[error("HTTP error: {0}")]
    Http(String),

    /// I/O error occurred.
    #[error("I/O error: {0}")]
    Io(String),

    /// The duplex handshake did not finish in time.
    #[error("Handshake timed out after {0:?}")]
    HandshakeTimeout(Duration),

    /// The server answered the upgrade request with something other than 101.
    #[error("Handshake rejected with status {status}")]
    HandshakeRejected {
        /// The HTTP status returned by the server.
        status: u16,
    },

    /// Malformed upgrade request or response.
    #[error("Invalid handshake: {0}")]
    InvalidHandshake(String),

    /// A header value cannot be written to the wire.
    #[error("Invalid value for header {header}: {reason}")]
    InvalidHeaderValue {
        /// Header name.
        header: String,
        /// Why the value was refused.
        reason: String,
    },

    /// Proxy tunnel setup failed.
    #[error("Proxy error: {0}")]
    Proxy(String),

    /// Invalid frame structure or header.
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Protocol violation detected.
    #[error("Protocol violation: {0}")]
    ProtocolViolation(String),

    /// Invalid UTF-8 in text frame.
    #[error("Invalid UTF-8 in text frame")]
    InvalidUtf8,

    /// Frame size exceeds configured maximum.
    #[error("Frame too large: {size} bytes (max: {max})")]
    FrameTooLarge {
        /// Actual frame size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Message size exceeds configured maximum.
    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge {
        /// Actual message size.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Too many fragments in a single message.
    #[error("Too many fragments: {count} (max: {max})")]
    TooManyFragments {
        /// Actual fragment count.
        count: usize,
        /// Maximum allowed fragments.
        max: usize,
    },

    /// Handshake data exceeds configured maximum.
    #[error("Handshake too large: {size} bytes (max: {max})")]
    HandshakeTooLarge {
        /// Bytes received so far.
        size: usize,
        /// Maximum allowed size.
        max: usize,
    },

    /// Connection has been closed.
    #[error("Connection closed: {0:?}")]
    ConnectionClosed(Option<u16>),

    /// Invalid close code.
    #[error("Invalid close code: {0}")]
    InvalidCloseCode(u16),

    /// Reserved opcode used.
    #[error("Reserved opcode: {0:#x}")]
    ReservedOpcode(u8),

    /// Control frame fragmented.
    #[error("Control frames cannot be fragmented")]
    FragmentedControlFrame,

    /// Control frame payload too large (>125 bytes).
    #[error("Control frame payload too large: {0} bytes (max: 125)")]
    ControlFrameTooLarge(usize),

    /// Unmasked client frame.
    #[error("Client frame must be masked")]
    UnmaskedClientFrame,

    /// Masked server frame.
    #[error("Server frame must not be masked")]
    MaskedServerFrame,

    /// Reserved bits set.
    #[error("Reserved bits set without negotiated extension")]
    ReservedBitsSet,

    /// Incomplete frame data.
    #[error("Incomplete frame: need {needed} more bytes")]
    IncompleteFrame {
        /// Number of additional bytes needed.
        needed: usize,
    },
}

impl Error {
    pub(crate) fn file_read(path: &Path, err: &std::io::Error) -> Self {
        Error::FileRead {
            path: path.to_path_buf(),
            reason: err.to_string(),
        }
    }

    /// Classify a transport failure, reporting TLS problems as
    /// [`Error::TlsHandshake`] wherever they sit in the source chain.
    pub(crate) fn transport(err: &(dyn std::error::Error + 'static)) -> Self {
        match find_tls_error(err) {
            Some(tls) => Error::TlsHandshake(tls.to_string()),
            None => Error::Http(err.to_string()),
        }
    }

    /// Returns `true` for failures raised by the TLS layer.
    #[must_use]
    pub fn is_tls(&self) -> bool {
        matches!(self, Error::TlsHandshake(_))
    }
}

fn find_tls_error<'a>(
    err: &'a (dyn std::error::Error + 'static),
) -> Option<&'a rustls::Error> {
    let mut current = Some(err);
    while let Some(err) = current {
        if let Some(tls) = err.downcast_ref::<rustls::Error>() {
            return Some(tls);
        }
        if let Some(io) = err.downcast_ref::<std::io::Error>() {
            if let Some(tls) = io
                .get_ref()
                .and_then(|inner| inner.downcast_ref::<rustls::Error>())
            {
                return Some(tls);
            }
        }
        current = err.source();
    }
    None
}

impl From<std::io::Error> for Error {
    fn from(err: std::io::Error) -> Self {
        match find_tls_error(&err) {
            Some(tls) => Error::TlsHandshake(tls.to_string()),
            None => Error::Io(err.to_string()),
        }
    }
}

impl From<std::str::Utf8Error> for Error {
    fn from(_: std::str::Utf8Error) -> Self {
        Error::InvalidUtf8
    }
}

impl From<rustls::Error> for Error {
    fn from(err: rustls::Error) -> Self {
        Error::KeyPair(err.to_string())
    }
}

impl From<hyper::Error> for Error {
    fn from(err: hyper::Error) -> Self {
        Error::transport(&err)
    }
}

impl From<http::Error> for Error {
    fn from(err: http::Error) -> Self {
        Error::Http(err.to_string())
    }
}
