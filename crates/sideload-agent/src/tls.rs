//! Mutual TLS configuration for the secure listener.
//!
//! The agent presents a fixed server certificate and refuses any client that
//! does not present a certificate chaining to the configured trust roots.
//! Verification happens inside the handshake, so an unauthenticated peer
//! never reaches the HTTP layer.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig};
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use zeroize::Zeroizing;

/// Errors that can occur while building the TLS configuration
#[derive(Debug, Error)]
pub enum TlsError {
    /// A PEM file could not be read
    #[error("failed to read {}: {source}", .path.display())]
    Read {
        /// File that failed to load
        path: PathBuf,
        /// Underlying IO error
        #[source]
        source: std::io::Error,
    },
    /// Certificate parsing error
    #[error("certificate error: {0}")]
    Certificate(String),
    /// Private key parsing error
    #[error("private key error: {0}")]
    PrivateKey(String),
    /// rustls rejected the configuration
    #[error("TLS configuration error: {0}")]
    Config(String),
}

/// Builder for the server side of a mutual TLS session.
#[derive(Default)]
pub struct MutualTlsBuilder {
    server_cert_pem: Option<Vec<u8>>,
    server_key_pem: Option<Zeroizing<Vec<u8>>>,
    client_ca_pem: Option<Vec<u8>>,
}

impl std::fmt::Debug for MutualTlsBuilder {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutualTlsBuilder")
            .field("server_cert_pem", &self.server_cert_pem.is_some())
            .field("server_key_pem", &self.server_key_pem.is_some())
            .field("client_ca_pem", &self.client_ca_pem.is_some())
            .finish()
    }
}

impl MutualTlsBuilder {
    /// Creates an empty builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Load all three PEM inputs from disk.
    pub fn from_files(
        server_cert: impl AsRef<Path>,
        server_key: impl AsRef<Path>,
        client_ca: impl AsRef<Path>,
    ) -> Result<Self, TlsError> {
        Ok(Self::new()
            .server_cert_pem(read_pem(server_cert.as_ref())?)
            .server_key_pem(read_pem(server_key.as_ref())?)
            .client_ca_pem(read_pem(client_ca.as_ref())?))
    }

    /// Sets the server certificate chain in PEM format.
    pub fn server_cert_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.server_cert_pem = Some(pem.into());
        self
    }

    /// Sets the server private key in PEM format.
    pub fn server_key_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.server_key_pem = Some(Zeroizing::new(pem.into()));
        self
    }

    /// Sets the trust roots for client certificates in PEM format.
    pub fn client_ca_pem(mut self, pem: impl Into<Vec<u8>>) -> Self {
        self.client_ca_pem = Some(pem.into());
        self
    }

    /// Builds the rustls server configuration.
    pub fn build(self) -> Result<Arc<ServerConfig>, TlsError> {
        let cert_pem = self
            .server_cert_pem
            .ok_or_else(|| TlsError::Config("server certificate required".into()))?;
        let key_pem = self
            .server_key_pem
            .ok_or_else(|| TlsError::Config("server private key required".into()))?;
        let ca_pem = self
            .client_ca_pem
            .ok_or_else(|| TlsError::Config("client trust roots required".into()))?;

        let ca_certs = parse_certificates(&ca_pem)?;
        if ca_certs.is_empty() {
            return Err(TlsError::Certificate("no client trust roots found".into()));
        }
        let mut roots = RootCertStore::empty();
        for cert in ca_certs {
            roots
                .add(cert)
                .map_err(|e| TlsError::Certificate(format!("failed to add trust root: {e}")))?;
        }

        let server_certs = parse_certificates(&cert_pem)?;
        if server_certs.is_empty() {
            return Err(TlsError::Certificate("no server certificates found".into()));
        }
        let server_key = PrivateKeyDer::from_pem_slice(&key_pem)
            .map_err(|e| TlsError::PrivateKey(format!("failed to parse private key: {e}")))?;

        let provider = Arc::new(crypto_provider());
        let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider.clone())
            .build()
            .map_err(|e| TlsError::Config(format!("client verifier error: {e}")))?;

        let config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()
            .map_err(|e| TlsError::Config(format!("protocol versions: {e}")))?
            .with_client_cert_verifier(verifier)
            .with_single_cert(server_certs, server_key)
            .map_err(|e| TlsError::Config(format!("server config error: {e}")))?;

        Ok(Arc::new(config))
    }

    /// Builds a ready-to-use acceptor.
    pub fn acceptor(self) -> Result<TlsAcceptor, TlsError> {
        Ok(TlsAcceptor::from(self.build()?))
    }
}

/// The crypto provider used for every session.
pub fn crypto_provider() -> CryptoProvider {
    rustls::crypto::ring::default_provider()
}

fn read_pem(path: &Path) -> Result<Vec<u8>, TlsError> {
    std::fs::read(path).map_err(|source| TlsError::Read {
        path: path.to_path_buf(),
        source,
    })
}

fn parse_certificates(pem: &[u8]) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    CertificateDer::pem_slice_iter(pem)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TlsError::Certificate(format!("failed to parse certificates: {e}")))
}
