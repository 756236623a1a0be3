//! Throw-away PKIs for integration tests.
//!
//! Each [`Pki`] owns a temporary directory holding a CA certificate and any
//! leaf certificates issued from it, all as PEM files.

#![allow(dead_code)]

use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose,
};
use rsmtls::{Client, Handler, Server};
use tempfile::TempDir;

pub struct Pki {
    dir: TempDir,
    ca: Certificate,
    ca_key: KeyPair,
}

/// Paths of one issued certificate and its key.
pub struct Leaf {
    pub cert: PathBuf,
    pub key: PathBuf,
}

impl Pki {
    pub fn new(name: &str) -> Self {
        let mut params = CertificateParams::default();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, format!("{name} test CA"));
        params.distinguished_name = dn;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];

        let ca_key = KeyPair::generate().unwrap();
        let ca = params.self_signed(&ca_key).unwrap();

        let dir = tempfile::tempdir().unwrap();
        std::fs::write(dir.path().join("ca.pem"), ca.pem()).unwrap();

        Self { dir, ca, ca_key }
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }

    pub fn ca_path(&self) -> PathBuf {
        self.dir.path().join("ca.pem")
    }

    /// Issue a leaf valid for `localhost` and `127.0.0.1`, named `cn`.
    pub fn issue(&self, cn: &str) -> Leaf {
        let leaf = Leaf {
            cert: self.dir.path().join(format!("{cn}.pem")),
            key: self.dir.path().join(format!("{cn}.key")),
        };
        self.issue_to(cn, &leaf);
        leaf
    }

    /// Issue a fresh leaf and overwrite the files of `leaf` with it.
    pub fn issue_to(&self, cn: &str, leaf: &Leaf) {
        let mut params =
            CertificateParams::new(vec!["localhost".to_string(), "127.0.0.1".to_string()])
                .unwrap();
        let mut dn = DistinguishedName::new();
        dn.push(DnType::CommonName, cn);
        params.distinguished_name = dn;
        params.is_ca = IsCa::NoCa;
        params.key_usages = vec![
            KeyUsagePurpose::DigitalSignature,
            KeyUsagePurpose::KeyEncipherment,
        ];
        params.extended_key_usages = vec![
            ExtendedKeyUsagePurpose::ServerAuth,
            ExtendedKeyUsagePurpose::ClientAuth,
        ];

        let key = KeyPair::generate().unwrap();
        let cert = params.signed_by(&key, &self.ca, &self.ca_key).unwrap();

        std::fs::write(&leaf.cert, cert.pem()).unwrap();
        std::fs::write(&leaf.key, key.serialize_pem()).unwrap();
    }

    pub fn server(&self) -> Server {
        let leaf = self.issue("server");
        Server::new(self.ca_path(), leaf.cert, leaf.key)
    }

    pub fn client(&self, cn: &str) -> Client {
        let leaf = self.issue(cn);
        Client::new(self.ca_path(), leaf.cert, leaf.key)
    }
}

/// Bind `server` on an ephemeral port and serve it in the background.
pub async fn spawn_server(server: &Server, handler: Option<Arc<dyn Handler>>) -> SocketAddr {
    let listener = server.bind("127.0.0.1:0", handler).await.unwrap();
    let addr = listener.local_addr();
    tokio::spawn(listener.serve());
    addr
}
