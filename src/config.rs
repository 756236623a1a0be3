//! Configuration and limits for dialing and duplex connections.

use std::time::Duration;

use crate::proxy::ProxyConfig;

/// Time allowed for a duplex dial, from TCP connect to the `101` response.
pub const DEFAULT_HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(45);

/// Body sent by the built-in responder when no handler is installed.
pub const VERIFIED_BODY: &str = "Request verified!";

/// Configuration limits for duplex connections.
///
/// These limits bound memory use when reading frames and handshakes from a
/// peer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Limits {
    /// Maximum size of a single frame in bytes.
    ///
    /// Default: 16 MB
    pub max_frame_size: usize,

    /// Maximum size of a complete message in bytes, after reassembly.
    ///
    /// Default: 64 MB
    pub max_message_size: usize,

    /// Maximum number of fragments in a single message.
    ///
    /// Default: 128
    pub max_fragment_count: usize,

    /// Maximum size of the upgrade response head in bytes.
    ///
    /// Default: 8 KB
    pub max_handshake_size: usize,
}

impl Default for Limits {
    fn default() -> Self {
        Self {
            max_frame_size: 16 * 1024 * 1024,
            max_message_size: 64 * 1024 * 1024,
            max_fragment_count: 128,
            max_handshake_size: 8192,
        }
    }
}

impl Limits {
    /// Create new limits with custom values.
    #[must_use]
    pub const fn new(
        max_frame_size: usize,
        max_message_size: usize,
        max_fragment_count: usize,
        max_handshake_size: usize,
    ) -> Self {
        Self {
            max_frame_size,
            max_message_size,
            max_fragment_count,
            max_handshake_size,
        }
    }

    /// Validate that message size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::MessageTooLarge`](crate::Error::MessageTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_message_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_message_size {
            Err(crate::Error::MessageTooLarge {
                size,
                max: self.max_message_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that frame size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::FrameTooLarge`](crate::Error::FrameTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_frame_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_frame_size {
            Err(crate::Error::FrameTooLarge {
                size,
                max: self.max_frame_size,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that fragment count is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::TooManyFragments`](crate::Error::TooManyFragments) if `count` exceeds the configured maximum.
    pub const fn check_fragment_count(&self, count: usize) -> Result<(), crate::Error> {
        if count > self.max_fragment_count {
            Err(crate::Error::TooManyFragments {
                count,
                max: self.max_fragment_count,
            })
        } else {
            Ok(())
        }
    }

    /// Validate that handshake size is within limits.
    ///
    /// # Errors
    ///
    /// Returns [`Error::HandshakeTooLarge`](crate::Error::HandshakeTooLarge) if `size` exceeds the configured maximum.
    pub const fn check_handshake_size(&self, size: usize) -> Result<(), crate::Error> {
        if size > self.max_handshake_size {
            Err(crate::Error::HandshakeTooLarge {
                size,
                max: self.max_handshake_size,
            })
        } else {
            Ok(())
        }
    }
}

/// Settings for [`Client::dial_with`](crate::Client::dial_with).
///
/// `DialConfig::default()` reproduces [`Client::dial`](crate::Client::dial):
/// a 45 second handshake timeout and proxies taken from the environment.
#[derive(Debug, Clone)]
pub struct DialConfig {
    /// Upper bound for connect, proxy tunnel, TLS and upgrade together.
    pub handshake_timeout: Duration,
    /// Proxy selection for the target URI.
    pub proxy: ProxyConfig,
    /// Limits applied to the handshake and to the resulting connection.
    pub limits: Limits,
}

impl Default for DialConfig {
    fn default() -> Self {
        Self {
            handshake_timeout: DEFAULT_HANDSHAKE_TIMEOUT,
            proxy: ProxyConfig::from_env(),
            limits: Limits::default(),
        }
    }
}

impl DialConfig {
    /// A configuration that never uses a proxy, regardless of the environment.
    #[must_use]
    pub fn direct() -> Self {
        Self {
            proxy: ProxyConfig::none(),
            ..Self::default()
        }
    }

    /// Set the handshake timeout.
    #[must_use]
    pub fn with_handshake_timeout(mut self, timeout: Duration) -> Self {
        self.handshake_timeout = timeout;
        self
    }

    /// Set the proxy configuration.
    #[must_use]
    pub fn with_proxy(mut self, proxy: ProxyConfig) -> Self {
        self.proxy = proxy;
        self
    }

    /// Set the connection limits.
    #[must_use]
    pub fn with_limits(mut self, limits: Limits) -> Self {
        self.limits = limits;
        self
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_limits() {
        let limits = Limits::default();
        assert_eq!(limits.max_frame_size, 16 * 1024 * 1024);
        assert_eq!(limits.max_message_size, 64 * 1024 * 1024);
        assert_eq!(limits.max_fragment_count, 128);
        assert_eq!(limits.max_handshake_size, 8192);
    }

    #[test]
    fn test_check_message_size() {
        let limits = Limits::new(100, 200, 4, 50);
        assert!(limits.check_message_size(200).is_ok());
        assert!(matches!(
            limits.check_message_size(201),
            Err(crate::Error::MessageTooLarge { size: 201, max: 200 })
        ));
    }

    #[test]
    fn test_check_frame_and_fragments() {
        let limits = Limits::new(100, 200, 4, 50);
        assert!(limits.check_frame_size(100).is_ok());
        assert!(limits.check_frame_size(101).is_err());
        assert!(limits.check_fragment_count(4).is_ok());
        assert!(limits.check_fragment_count(5).is_err());
        assert!(limits.check_handshake_size(51).is_err());
    }

    #[test]
    fn test_dial_config_defaults() {
        let config = DialConfig::direct();
        assert_eq!(config.handshake_timeout, Duration::from_secs(45));
        assert_eq!(config.limits, Limits::default());
        assert!(config.proxy.is_disabled());
    }

    #[test]
    fn test_dial_config_builders() {
        let config = DialConfig::direct()
            .with_handshake_timeout(Duration::from_secs(5))
            .with_limits(Limits::new(1, 2, 3, 4));
        assert_eq!(config.handshake_timeout, Duration::from_secs(5));
        assert_eq!(config.limits.max_handshake_size, 4);
    }
}
