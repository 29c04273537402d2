//! TLS configuration and certificate loading.
//!
//! # Responsibilities
//! - Load certificate chain, private key and client trust store for a listener
//! - Map configured protocol names to rustls protocol versions
//! - Build the rustls `ServerConfig` (client auth, ALPN)
//!
//! # Design Decisions
//! - Material loading sits behind `TlsMaterialProvider`; failures abort only
//!   the listener being built
//! - Unknown protocol names are logged and ignored; an empty result is an error

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use rustls::server::WebPkiClientVerifier;
use rustls::{RootCertStore, ServerConfig, SupportedProtocolVersion};
use thiserror::Error;

use crate::config::{ClientAuth, TlsConfig};

/// Error type for TLS setup.
#[derive(Debug, Error)]
pub enum TlsError {
    #[error("cannot read {}: {source}", .path.display())]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("no certificates found in {}", .0.display())]
    NoCertificates(PathBuf),
    #[error("no private key found in {}", .0.display())]
    NoPrivateKey(PathBuf),
    #[error("none of the configured protocol versions {0:?} is supported")]
    NoProtocols(Vec<String>),
    #[error("client certificate verification requires a trust store")]
    MissingTrustStore,
    #[error("invalid client trust store: {0}")]
    TrustStore(String),
    #[error(transparent)]
    Rustls(#[from] rustls::Error),
}

/// Everything needed to terminate TLS on one listener.
#[derive(Debug)]
pub struct TlsMaterial {
    pub cert_chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
    pub trust_roots: Option<RootCertStore>,
    pub protocols: Vec<&'static SupportedProtocolVersion>,
}

/// Supplies TLS material for a listener's TLS settings.
pub trait TlsMaterialProvider: Send + Sync {
    fn load(&self, config: &TlsConfig) -> Result<TlsMaterial, TlsError>;
}

/// Reads PEM files from disk.
#[derive(Debug, Default, Clone, Copy)]
pub struct PemFileProvider;

impl TlsMaterialProvider for PemFileProvider {
    fn load(&self, config: &TlsConfig) -> Result<TlsMaterial, TlsError> {
        let cert_chain = load_certs(&config.cert_path)?;
        if cert_chain.is_empty() {
            return Err(TlsError::NoCertificates(config.cert_path.clone()));
        }

        let key = rustls_pemfile::private_key(&mut open(&config.key_path)?)
            .map_err(|source| TlsError::Io {
                path: config.key_path.clone(),
                source,
            })?
            .ok_or_else(|| TlsError::NoPrivateKey(config.key_path.clone()))?;

        let trust_roots = match &config.trust_store_path {
            Some(path) => {
                let mut roots = RootCertStore::empty();
                let certs = load_certs(path)?;
                if certs.is_empty() {
                    return Err(TlsError::NoCertificates(path.clone()));
                }
                let (_, ignored) = roots.add_parsable_certificates(certs);
                if ignored > 0 {
                    tracing::warn!(path = ?path, ignored, "Skipped unparsable trust store certificates");
                }
                Some(roots)
            }
            None => None,
        };

        Ok(TlsMaterial {
            cert_chain,
            key,
            trust_roots,
            protocols: protocol_versions(&config.protocols)?,
        })
    }
}

fn open(path: &Path) -> Result<BufReader<File>, TlsError> {
    File::open(path)
        .map(BufReader::new)
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

fn load_certs(path: &Path) -> Result<Vec<CertificateDer<'static>>, TlsError> {
    rustls_pemfile::certs(&mut open(path)?)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|source| TlsError::Io {
            path: path.to_path_buf(),
            source,
        })
}

/// Map names such as `TLSv1.3` to rustls versions.
pub fn protocol_versions(names: &[String]) -> Result<Vec<&'static SupportedProtocolVersion>, TlsError> {
    let mut versions: Vec<&'static SupportedProtocolVersion> = Vec::new();
    for name in names {
        let version = match name.to_ascii_uppercase().as_str() {
            "TLSV1.3" => &rustls::version::TLS13,
            "TLSV1.2" => &rustls::version::TLS12,
            _ => {
                tracing::warn!(protocol = %name, "Ignoring unsupported TLS protocol version");
                continue;
            }
        };
        if !versions.iter().any(|v| v.version == version.version) {
            versions.push(version);
        }
    }
    if versions.is_empty() {
        return Err(TlsError::NoProtocols(names.to_vec()));
    }
    Ok(versions)
}

/// Build the rustls server configuration for a listener.
pub fn server_config(
    material: TlsMaterial,
    client_auth: ClientAuth,
    alpn: &[String],
) -> Result<Arc<ServerConfig>, TlsError> {
    let builder = ServerConfig::builder_with_protocol_versions(&material.protocols);

    let builder = match client_auth {
        ClientAuth::None => builder.with_no_client_auth(),
        ClientAuth::Optional | ClientAuth::Require => {
            let roots = material.trust_roots.ok_or(TlsError::MissingTrustStore)?;
            let verifier = WebPkiClientVerifier::builder(Arc::new(roots));
            let verifier = if client_auth == ClientAuth::Optional {
                verifier.allow_unauthenticated()
            } else {
                verifier
            };
            let verifier = verifier
                .build()
                .map_err(|e| TlsError::TrustStore(e.to_string()))?;
            builder.with_client_cert_verifier(verifier)
        }
    };

    let mut config = builder.with_single_cert(material.cert_chain, material.key)?;
    config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
    Ok(Arc::new(config))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_protocol_names() {
        let names = ["TLSv1.3", "tlsv1.2", "SSLv3", "TLSV1.3"].map(String::from);
        let versions = protocol_versions(&names).unwrap();
        assert_eq!(versions.len(), 2);
        assert_eq!(versions[0].version, rustls::ProtocolVersion::TLSv1_3);
    }

    #[test]
    fn rejects_only_unsupported_protocols() {
        let err = protocol_versions(&["TLSv1.0".to_string()]).unwrap_err();
        assert!(matches!(err, TlsError::NoProtocols(_)));
    }

    #[test]
    fn missing_certificate_file_is_io_error() {
        let config = TlsConfig {
            cert_path: PathBuf::from("/nonexistent/server.crt"),
            key_path: PathBuf::from("/nonexistent/server.key"),
            trust_store_path: None,
            client_auth: ClientAuth::None,
            protocols: vec!["TLSv1.3".to_string()],
            alpn: None,
        };
        assert!(matches!(PemFileProvider.load(&config), Err(TlsError::Io { .. })));
    }

    #[test]
    fn empty_pem_has_no_certificates() {
        let dir = tempfile::tempdir().unwrap();
        let cert = dir.path().join("empty.crt");
        std::fs::write(&cert, "").unwrap();
        let config = TlsConfig {
            cert_path: cert,
            key_path: dir.path().join("missing.key"),
            trust_store_path: None,
            client_auth: ClientAuth::None,
            protocols: vec!["TLSv1.3".to_string()],
            alpn: None,
        };
        assert!(matches!(
            PemFileProvider.load(&config),
            Err(TlsError::NoCertificates(_))
        ));
    }
}
