use rustls::RootCertStore;
use rustls::crypto::ring;
use rustls::server::{VerifierBuilderError, WebPkiClientVerifier};
use rustls_pki_types::pem::{self, PemObject};
use rustls_pki_types::{CertificateDer, PrivateKeyDer};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tracing::debug;

/// Where to find the server's key material.
///
/// `cert_path` holds the certificate chain and `key_path` the private key, both PEM encoded.
/// When `client_ca_path` is set, clients must present a certificate signed by one of the
/// authorities in that file.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct TlsConfig {
    pub cert_path: PathBuf,
    pub key_path: PathBuf,
    #[serde(default)]
    pub client_ca_path: Option<PathBuf>,
}

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read pem file: {source}")]
    Pem {
        #[from]
        source: pem::Error,
    },

    #[error("no certificate found in {path}")]
    NoCertificates { path: PathBuf },

    #[error("invalid tls configuration: {source}")]
    Tls {
        #[from]
        source: rustls::Error,
    },

    #[error("invalid client verifier: {source}")]
    Verifier {
        #[from]
        source: VerifierBuilderError,
    },
}

impl TlsConfig {
    pub fn new(cert_path: impl Into<PathBuf>, key_path: impl Into<PathBuf>) -> Self {
        Self { cert_path: cert_path.into(), key_path: key_path.into(), client_ca_path: None }
    }

    #[must_use]
    pub fn with_client_ca(mut self, client_ca_path: impl Into<PathBuf>) -> Self {
        self.client_ca_path = Some(client_ca_path.into());
        self
    }

    /// Loads the PEM files and builds a rustls server configuration.
    pub fn build(&self) -> Result<Arc<rustls::ServerConfig>, TlsConfigError> {
        let provider = Arc::new(ring::default_provider());
        let certs = load_certs(&self.cert_path)?;
        let key = PrivateKeyDer::from_pem_file(&self.key_path)?;

        let builder = rustls::ServerConfig::builder_with_provider(Arc::clone(&provider))
            .with_safe_default_protocol_versions()?;

        let config = match &self.client_ca_path {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                for ca in load_certs(path)? {
                    roots.add(ca)?;
                }
                let verifier = WebPkiClientVerifier::builder_with_provider(Arc::new(roots), provider).build()?;
                builder.with_client_cert_verifier(verifier).with_single_cert(certs, key)?
            }
            None => builder.with_no_client_auth().with_single_cert(certs, key)?,
        };

        debug!(cert = %self.cert_path.display(), mutual = self.client_ca_path.is_some(), "tls configuration loaded");
        Ok(Arc::new(config))
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let certs = CertificateDer::pem_file_iter(path)?.collect::<Result<Vec<_>, _>>()?;
    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificates { path: path.to_path_buf() });
    }
    Ok(certs)
}
