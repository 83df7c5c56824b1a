//! TLS identity
//!
//! Loads the operator-supplied key, certificate and intermediate chain,
//! checks that they form a usable identity, and builds the acceptor used
//! by the public listener.

use crate::config::TlsPaths;
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::sign::CertifiedKey;
use rustls::{InconsistentKeys, ServerConfig};
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use thiserror::Error;
use tokio_rustls::TlsAcceptor;
use tracing::{debug, warn};

#[derive(Debug, Error)]
pub enum TlsConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("no certificate found in {0}")]
    NoCertificate(PathBuf),

    #[error("no private key found in {0}")]
    NoPrivateKey(PathBuf),

    #[error("certificate {index} in the chain cannot be parsed: {reason}")]
    InvalidCertificate { index: usize, reason: String },

    #[error("certificate {0} in the chain is not issued by the certificate that follows it")]
    ChainOrder(usize),

    #[error("private key does not match the leaf certificate")]
    KeyMismatch,

    #[error("TLS configuration error: {0}")]
    Rustls(#[from] rustls::Error),
}

fn io_error(path: &Path) -> impl FnOnce(std::io::Error) -> TlsConfigError + '_ {
    move |source| TlsConfigError::Io {
        path: path.to_path_buf(),
        source,
    }
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsConfigError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);
    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(io_error(path))?;

    if certs.is_empty() {
        return Err(TlsConfigError::NoCertificate(path.to_path_buf()));
    }
    Ok(certs)
}

fn load_key(path: &Path) -> Result<PrivateKeyDer<'static>, TlsConfigError> {
    let file = File::open(path).map_err(io_error(path))?;
    let mut reader = BufReader::new(file);

    loop {
        match rustls_pemfile::read_one(&mut reader).map_err(io_error(path))? {
            Some(rustls_pemfile::Item::Pkcs1Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Pkcs8Key(key)) => return Ok(key.into()),
            Some(rustls_pemfile::Item::Sec1Key(key)) => return Ok(key.into()),
            None => break,
            _ => continue,
        }
    }

    Err(TlsConfigError::NoPrivateKey(path.to_path_buf()))
}

/// Each certificate must be issued by the one that follows it
fn check_chain_order(chain: &[CertificateDer<'_>]) -> Result<(), TlsConfigError> {
    let parsed = chain
        .iter()
        .enumerate()
        .map(|(index, der)| {
            x509_parser::parse_x509_certificate(der.as_ref())
                .map(|(_, cert)| cert)
                .map_err(|e| TlsConfigError::InvalidCertificate {
                    index,
                    reason: e.to_string(),
                })
        })
        .collect::<Result<Vec<_>, _>>()?;

    if let Some(leaf) = parsed.first() {
        if !leaf.validity().is_valid() {
            warn!(
                subject = %leaf.subject(),
                not_after = %leaf.validity().not_after,
                "TLS certificate is outside its validity period"
            );
        }
    }

    for (index, pair) in parsed.windows(2).enumerate() {
        if pair[0].issuer().as_raw() != pair[1].subject().as_raw() {
            return Err(TlsConfigError::ChainOrder(index));
        }
    }
    Ok(())
}

/// Validated key, leaf certificate and intermediates
#[derive(Debug)]
pub struct TlsIdentity {
    key: PrivateKeyDer<'static>,
    chain: Vec<CertificateDer<'static>>,
}

impl TlsIdentity {
    pub fn load(paths: &TlsPaths) -> Result<Self, TlsConfigError> {
        let key = load_key(&paths.key)?;
        let certs = load_certs(&paths.cert)?;
        let intermediates = load_certs(&paths.chain)?;
        Self::from_parts(key, certs, intermediates)
    }

    /// Assemble the chain (leaf first, duplicates dropped) and validate it
    pub fn from_parts(
        key: PrivateKeyDer<'static>,
        certs: Vec<CertificateDer<'static>>,
        intermediates: Vec<CertificateDer<'static>>,
    ) -> Result<Self, TlsConfigError> {
        let mut chain: Vec<CertificateDer<'static>> = Vec::with_capacity(certs.len() + intermediates.len());
        for cert in certs.into_iter().chain(intermediates) {
            if !chain.contains(&cert) {
                chain.push(cert);
            }
        }

        check_chain_order(&chain)?;

        let signing_key = rustls::crypto::ring::sign::any_supported_type(&key)?;
        match CertifiedKey::new(chain.clone(), signing_key).keys_match() {
            Ok(()) => {}
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::KeyMismatch)) => {
                return Err(TlsConfigError::KeyMismatch)
            }
            Err(rustls::Error::InconsistentKeys(InconsistentKeys::Unknown)) => {
                debug!("Cannot verify that the private key matches the certificate");
            }
            Err(e) => return Err(e.into()),
        }

        Ok(Self { key, chain })
    }

    pub fn chain_len(&self) -> usize {
        self.chain.len()
    }

    pub fn server_config(&self) -> Result<ServerConfig, TlsConfigError> {
        let provider = Arc::new(rustls::crypto::ring::default_provider());
        let mut config = ServerConfig::builder_with_provider(provider)
            .with_safe_default_protocol_versions()?
            .with_no_client_auth()
            .with_single_cert(self.chain.clone(), self.key.clone_key())?;
        config.alpn_protocols = vec![b"h2".to_vec(), b"http/1.1".to_vec()];
        Ok(config)
    }

    pub fn acceptor(&self) -> Result<TlsAcceptor, TlsConfigError> {
        Ok(TlsAcceptor::from(Arc::new(self.server_config()?)))
    }
}
