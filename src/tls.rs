//! TLS utilities for loading certificates and configuring mTLS.
//!
//! Worker sessions are mutually authenticated: the dispatcher presents its
//! certificate, requires one from the worker, verifies both against the
//! shared CA, and optionally pins worker client certificates by SHA-256
//! fingerprint.

use std::path::PathBuf;
use std::sync::Arc;

use sha2::{Digest, Sha256};
use tokio::fs;
use tokio::net::TcpStream;
use tokio_rustls::client::TlsStream as ClientTlsStream;
use tokio_rustls::rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName};
use tokio_rustls::rustls::server::WebPkiClientVerifier;
use tokio_rustls::rustls::{ClientConfig, RootCertStore, ServerConfig};
use tokio_rustls::{TlsAcceptor, TlsConnector};

use crate::config::TlsConfig;

/// Error type for TLS configuration issues.
#[derive(Debug, thiserror::Error)]
pub enum TlsError {
    #[error("CA certificate path not configured")]
    MissingCaCert,

    #[error("Node certificate path not configured")]
    MissingCert,

    #[error("Private key path not configured")]
    MissingKey,

    #[error("CA certificate not found: {0}")]
    CaCertNotFound(PathBuf),

    #[error("Node certificate not found: {0}")]
    CertNotFound(PathBuf),

    #[error("Private key not found: {0}")]
    KeyNotFound(PathBuf),

    #[error("No private key in key file")]
    EmptyKey,

    #[error("Peer presented no certificate")]
    NoPeerCertificate,

    #[error("Peer certificate fingerprint {0} is not pinned")]
    FingerprintMismatch(String),

    #[error("Failed to read file: {0}")]
    IoError(#[from] std::io::Error),

    #[error("TLS configuration rejected: {0}")]
    Rustls(#[from] tokio_rustls::rustls::Error),

    #[error("Client verifier rejected: {0}")]
    Verifier(#[from] tokio_rustls::rustls::server::VerifierBuilderError),

    #[error("Invalid server name: {0}")]
    InvalidServerName(String),
}

/// SHA-256 fingerprint of a DER certificate, lowercase hex.
pub fn fingerprint(cert: &CertificateDer<'_>) -> String {
    let digest = Sha256::digest(cert.as_ref());
    digest.iter().map(|b| format!("{:02x}", b)).collect()
}

/// Loaded TLS materials ready for use on worker sessions.
pub struct TlsIdentity {
    certs: Vec<CertificateDer<'static>>,
    key: PrivateKeyDer<'static>,
    roots: RootCertStore,
}

impl TlsIdentity {
    /// Load TLS materials from the file paths in the config.
    ///
    /// # Errors
    ///
    /// Returns an error if any required path is not configured, or any file
    /// does not exist, cannot be read, or fails to parse.
    pub async fn load(config: &TlsConfig) -> Result<Self, TlsError> {
        let ca_cert_path = config
            .ca_cert_path
            .as_ref()
            .ok_or(TlsError::MissingCaCert)?;
        let cert_path = config.cert_path.as_ref().ok_or(TlsError::MissingCert)?;
        let key_path = config.key_path.as_ref().ok_or(TlsError::MissingKey)?;

        if !ca_cert_path.exists() {
            return Err(TlsError::CaCertNotFound(ca_cert_path.clone()));
        }
        if !cert_path.exists() {
            return Err(TlsError::CertNotFound(cert_path.clone()));
        }
        if !key_path.exists() {
            return Err(TlsError::KeyNotFound(key_path.clone()));
        }

        let ca_pem = fs::read(ca_cert_path).await?;
        let cert_pem = fs::read(cert_path).await?;
        let key_pem = fs::read(key_path).await?;

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut ca_pem.as_slice()).collect::<Result<_, _>>()?;
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }

        let certs: Vec<CertificateDer<'static>> =
            rustls_pemfile::certs(&mut cert_pem.as_slice()).collect::<Result<_, _>>()?;
        let key = rustls_pemfile::private_key(&mut key_pem.as_slice())?
            .ok_or(TlsError::EmptyKey)?;

        Ok(Self { certs, key, roots })
    }

    /// Acceptor for inbound worker sessions: presents this node's identity
    /// and requires a client certificate signed by the CA.
    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsError> {
        let verifier = WebPkiClientVerifier::builder(Arc::new(self.roots.clone())).build()?;
        let config = ServerConfig::builder()
            .with_client_cert_verifier(verifier)
            .with_single_cert(self.certs.clone(), self.key.clone_key())?;
        Ok(TlsAcceptor::from(Arc::new(config)))
    }

    /// Connector for dispatcher-initiated worker sessions.
    ///
    /// Certificate validation is rooted in the shared CA; `server_name` is a
    /// fixed logical name since workers are dialed by address. Non-empty
    /// `pinned` additionally restricts peers by certificate fingerprint.
    pub fn client(
        &self,
        server_name: &str,
        pinned: Vec<String>,
    ) -> Result<TlsClient, TlsError> {
        let config = ClientConfig::builder()
            .with_root_certificates(self.roots.clone())
            .with_client_auth_cert(self.certs.clone(), self.key.clone_key())?;
        let server_name = ServerName::try_from(server_name.to_string())
            .map_err(|_| TlsError::InvalidServerName(server_name.to_string()))?;
        Ok(TlsClient {
            connector: TlsConnector::from(Arc::new(config)),
            server_name,
            pinned,
        })
    }
}

/// Client-side TLS wrapper with optional peer-certificate pinning.
#[derive(Clone)]
pub struct TlsClient {
    connector: TlsConnector,
    server_name: ServerName<'static>,
    /// Allowed peer certificate SHA-256 fingerprints; empty pins nothing.
    pinned: Vec<String>,
}

impl TlsClient {
    pub async fn connect(&self, tcp: TcpStream) -> Result<ClientTlsStream<TcpStream>, TlsError> {
        let stream = self.connector.connect(self.server_name.clone(), tcp).await?;
        if !self.pinned.is_empty() {
            let (_, session) = stream.get_ref();
            let peer = session
                .peer_certificates()
                .and_then(|chain| chain.first())
                .ok_or(TlsError::NoPeerCertificate)?;
            let fp = fingerprint(peer);
            if !self.pinned.iter().any(|p| p.eq_ignore_ascii_case(&fp)) {
                return Err(TlsError::FingerprintMismatch(fp));
            }
        }
        Ok(stream)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_tls_config_is_complete() {
        let mut config = TlsConfig::default();
        assert!(!config.is_complete());

        config.enabled = true;
        assert!(!config.is_complete());

        config.ca_cert_path = Some(PathBuf::from("/tmp/ca.crt"));
        assert!(!config.is_complete());

        config.cert_path = Some(PathBuf::from("/tmp/node.crt"));
        assert!(!config.is_complete());

        config.key_path = Some(PathBuf::from("/tmp/node.key"));
        assert!(config.is_complete());
    }

    #[tokio::test]
    async fn test_load_missing_paths() {
        let config = TlsConfig {
            enabled: true,
            ..TlsConfig::default()
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::MissingCaCert)));
    }

    #[tokio::test]
    async fn test_load_nonexistent_files() {
        let config = TlsConfig {
            enabled: true,
            ca_cert_path: Some(PathBuf::from("/nonexistent/ca.crt")),
            cert_path: Some(PathBuf::from("/nonexistent/node.crt")),
            key_path: Some(PathBuf::from("/nonexistent/node.key")),
            pinned_fingerprints: Vec::new(),
        };
        let result = TlsIdentity::load(&config).await;
        assert!(matches!(result, Err(TlsError::CaCertNotFound(_))));
    }

    #[test]
    fn fingerprint_is_stable_hex() {
        let cert = CertificateDer::from(vec![1u8, 2, 3]);
        let fp = fingerprint(&cert);
        assert_eq!(fp.len(), 64);
        assert_eq!(fp, fingerprint(&CertificateDer::from(vec![1u8, 2, 3])));
    }
}
