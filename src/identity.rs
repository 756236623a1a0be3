//! Credential loading and TLS configuration for both connection roles.
//!
//! An [`Identity`] is read from disk every time it is needed. Nothing here is
//! cached, so rotated certificates take effect on the next call.

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::sign::CertifiedKey;
use rustls::{ClientConfig, InconsistentKeys, RootCertStore, ServerConfig};
use tracing::{debug, warn};

use crate::error::{Error, Result};

/// Paths to the three PEM files that make up one peer's credentials.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IdentityPaths {
    /// CA bundle used to validate the remote peer.
    pub ca_cert: PathBuf,
    /// This peer's certificate chain, leaf first.
    pub cert: PathBuf,
    /// Private key matching the leaf certificate.
    pub key: PathBuf,
}

impl IdentityPaths {
    pub fn new(
        ca_cert: impl Into<PathBuf>,
        cert: impl Into<PathBuf>,
        key: impl Into<PathBuf>,
    ) -> Self {
        Self {
            ca_cert: ca_cert.into(),
            cert: cert.into(),
            key: key.into(),
        }
    }
}

/// A loaded identity pair together with the pool of trusted authorities.
#[derive(Debug)]
pub struct Identity {
    cert_chain: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    trust_pool: RootCertStore,
}

impl Identity {
    /// Read certificate, key and CA bundle from `paths`.
    ///
    /// # Errors
    ///
    /// - [`Error::FileRead`] if any of the three files cannot be read
    /// - [`Error::KeyPair`] if the certificate or key file holds no usable item
    /// - [`Error::EmptyTrustPool`] if the CA bundle yields no authority
    pub fn load(paths: &IdentityPaths) -> Result<Self> {
        let cert_chain = load_certs_from_file(&paths.cert)?;
        let key = load_private_key_from_file(&paths.key)?;
        let trust_pool = load_trust_pool(&paths.ca_cert)?;

        debug!(
            cert = ?paths.cert,
            ca = ?paths.ca_cert,
            chain_len = cert_chain.len(),
            authorities = trust_pool.len(),
            "loaded identity"
        );

        Ok(Self {
            cert_chain,
            key,
            trust_pool,
        })
    }

    /// The certificate chain presented to peers, leaf first.
    pub fn cert_chain(&self) -> &[CertificateDer<'static>] {
        &self.cert_chain
    }

    /// The authorities that remote peers are validated against.
    pub fn trust_pool(&self) -> &RootCertStore {
        &self.trust_pool
    }

    /// Build a client-role configuration.
    ///
    /// The identity is sent as the TLS client certificate and the server is
    /// validated against the trust pool.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyPair`] if the key cannot be used or does not match
    /// the leaf certificate.
    pub fn client_config(&self) -> Result<Arc<ClientConfig>> {
        let provider = provider();
        self.check_keys_match(&provider)?;

        let config = ClientConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_root_certificates(self.trust_pool.clone())
            .with_client_auth_cert(self.cert_chain.clone(), self.key.clone_key())?;

        Ok(Arc::new(config))
    }

    /// Build a server-role configuration.
    ///
    /// Clients must present a certificate that chains to the trust pool;
    /// anything else is refused during the handshake. TLS 1.2 is the minimum
    /// version and the server's cipher suite order wins.
    ///
    /// # Errors
    ///
    /// Returns [`Error::KeyPair`] if the key cannot be used or does not match
    /// the leaf certificate.
    pub fn server_config(&self) -> Result<Arc<ServerConfig>> {
        let provider = provider();

        let verifier =
            WebPkiClientVerifier::builder_with_provider(Arc::new(self.trust_pool.clone()), provider.clone())
                .build()
                .map_err(|e| Error::KeyPair(e.to_string()))?;

        let mut config = ServerConfig::builder_with_provider(provider)
            .with_protocol_versions(&[&rustls::version::TLS13, &rustls::version::TLS12])?
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.cert_chain.clone(), self.key.clone_key())?;
        config.ignore_client_order = true;
        config.alpn_protocols = vec![b"http/1.1".to_vec()];

        Ok(Arc::new(config))
    }

    fn check_keys_match(&self, provider: &CryptoProvider) -> Result<()> {
        let signing_key = provider.key_provider.load_private_key(self.key.clone_key())?;
        let certified = CertifiedKey::new(self.cert_chain.clone(), signing_key);
        match certified.keys_match() {
            Ok(()) | Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => Ok(()),
            Err(e) => Err(Error::KeyPair(e.to_string())),
        }
    }
}

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

fn open(path: &Path) -> Result<BufReader<File>> {
    let file = File::open(path).map_err(|e| Error::file_read(path, &e))?;
    Ok(BufReader::new(file))
}

/// Load every certificate from a PEM file.
///
/// # Errors
///
/// Returns [`Error::FileRead`] if the file cannot be read and
/// [`Error::KeyPair`] if it is malformed or holds no certificate.
pub fn load_certs_from_file(path: &Path) -> Result<Vec<CertificateDer<'static>>> {
    let mut reader = open(path)?;

    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .collect::<std::result::Result<Vec<_>, _>>()
        .map_err(|e| Error::KeyPair(format!("{}: {}", path.display(), e)))?;

    if certs.is_empty() {
        return Err(Error::KeyPair(format!(
            "no certificates found in {}",
            path.display()
        )));
    }

    Ok(certs)
}

/// Load the first private key from a PEM file.
///
/// PKCS#1, PKCS#8 and SEC1 keys are accepted.
///
/// # Errors
///
/// Returns [`Error::FileRead`] if the file cannot be read and
/// [`Error::KeyPair`] if it holds no key.
pub fn load_private_key_from_file(path: &Path) -> Result<PrivateKeyDer<'static>> {
    let mut reader = open(path)?;

    for item in rustls_pemfile::read_all(&mut reader) {
        let item = item.map_err(|e| Error::KeyPair(format!("{}: {}", path.display(), e)))?;
        match item {
            rustls_pemfile::Item::Pkcs1Key(key) => return Ok(PrivateKeyDer::Pkcs1(key)),
            rustls_pemfile::Item::Pkcs8Key(key) => return Ok(PrivateKeyDer::Pkcs8(key)),
            rustls_pemfile::Item::Sec1Key(key) => return Ok(PrivateKeyDer::Sec1(key)),
            _ => continue,
        }
    }

    Err(Error::KeyPair(format!(
        "no private key found in {}",
        path.display()
    )))
}

/// Load a CA bundle into a trust pool.
///
/// Sections that fail to decode and certificates the pool cannot parse are
/// skipped with a warning.
///
/// # Errors
///
/// Returns [`Error::FileRead`] if the file cannot be read and
/// [`Error::EmptyTrustPool`] if nothing usable was found.
pub fn load_trust_pool(path: &Path) -> Result<RootCertStore> {
    let mut reader = open(path)?;

    let mut undecodable = 0usize;
    let certs: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut reader)
        .filter_map(|item| match item {
            Ok(cert) => Some(cert),
            Err(_) => {
                undecodable += 1;
                None
            }
        })
        .collect();

    let mut pool = RootCertStore::empty();
    let (_, unparsable) = pool.add_parsable_certificates(certs);

    if undecodable + unparsable > 0 {
        warn!(
            path = %path.display(),
            skipped = undecodable + unparsable,
            "ignored malformed entries in CA bundle"
        );
    }

    if pool.is_empty() {
        return Err(Error::EmptyTrustPool {
            path: path.to_path_buf(),
        });
    }

    Ok(pool)
}
