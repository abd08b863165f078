//! TLS material and rustls configuration.
//!
//! Every config is built against the `ring` provider explicitly, so nothing
//! depends on a process-wide default provider being installed.

use std::fs::File;
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::CryptoProvider;
use rustls::pki_types::pem::PemObject;
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer, ServerName, UnixTime};
use rustls::{DigitallySignedStruct, RootCertStore, SignatureScheme};

use crate::error::ConfigError;

/// ALPN for the request/response protocol over QUIC.
pub const QUIC_ALPN: &[u8] = b"quic-demo/1";

/// ALPN for the TLS over TCP fallback.
pub const TCP_ALPN: &[u8] = b"http/1.1";

/// ALPN for the echo protocol.
pub const ECHO_ALPN: &[u8] = b"quic-echo-example";

fn provider() -> Arc<CryptoProvider> {
    Arc::new(rustls::crypto::ring::default_provider())
}

/// Certificate and key file paths.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TlsFiles {
    pub cert: PathBuf,
    pub key: PathBuf,
}

/// A certificate chain with its private key.
#[derive(Debug)]
pub struct CertifiedPair {
    pub certs: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl Clone for CertifiedPair {
    fn clone(&self) -> Self {
        Self {
            certs: self.certs.clone(),
            key: self.key.clone_key(),
        }
    }
}

impl CertifiedPair {
    /// Load a PEM certificate chain and private key.
    pub fn load(files: &TlsFiles) -> Result<Self, ConfigError> {
        let certs = CertificateDer::pem_file_iter(&files.cert)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|source| ConfigError::TlsMaterial {
                what: "certificate",
                path: files.cert.clone(),
                source,
            })?;
        let key =
            PrivateKeyDer::from_pem_file(&files.key).map_err(|source| ConfigError::TlsMaterial {
                what: "private key",
                path: files.key.clone(),
                source,
            })?;
        Ok(Self { certs, key })
    }

    /// Generate a self-signed certificate for `names`.
    pub fn self_signed(names: &[&str]) -> Result<Self, ConfigError> {
        let names: Vec<String> = names.iter().map(|n| n.to_string()).collect();
        let rcgen::CertifiedKey { cert, key_pair } = rcgen::generate_simple_self_signed(names)?;
        Ok(Self {
            certs: vec![cert.der().clone()],
            key: PrivatePkcs8KeyDer::from(key_pair.serialize_der()).into(),
        })
    }

    /// A root store trusting this pair's leaf certificate.
    pub fn root_store(&self) -> Result<RootCertStore, ConfigError> {
        let mut roots = RootCertStore::empty();
        for cert in &self.certs {
            roots.add(cert.clone())?;
        }
        Ok(roots)
    }
}

/// Where listeners get their certificate from.
#[derive(Debug, Clone)]
pub enum TlsSource {
    /// PEM files, read by each listener when it starts.
    Files(TlsFiles),
    /// Material already in memory, typically an ephemeral self-signed pair.
    Pair(Arc<CertifiedPair>),
}

impl TlsSource {
    pub fn load(&self) -> Result<CertifiedPair, ConfigError> {
        match self {
            TlsSource::Files(files) => CertifiedPair::load(files),
            TlsSource::Pair(pair) => Ok(CertifiedPair::clone(pair)),
        }
    }
}

/// Build a rustls server config advertising `alpn`.
pub fn server_config(pair: &CertifiedPair, alpn: &[&[u8]]) -> Result<rustls::ServerConfig, ConfigError> {
    let mut config = rustls::ServerConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?
        .with_no_client_auth()
        .with_single_cert(pair.certs.clone(), pair.key.clone_key())?;
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();
    Ok(config)
}

/// Build a QUIC server config with an idle timeout.
pub fn quic_server_config(
    pair: &CertifiedPair,
    alpn: &[&[u8]],
    idle_timeout: Duration,
) -> Result<quinn::ServerConfig, ConfigError> {
    let crypto = quinn::crypto::rustls::QuicServerConfig::try_from(server_config(pair, alpn)?)?;
    let mut config = quinn::ServerConfig::with_crypto(Arc::new(crypto));

    let mut transport = quinn::TransportConfig::default();
    transport.max_idle_timeout(quinn::IdleTimeout::try_from(idle_timeout).ok());
    config.transport_config(Arc::new(transport));
    Ok(config)
}

/// How a client decides to trust the server.
#[derive(Debug, Clone)]
pub enum Trust {
    Roots(RootCertStore),
    /// Accept any certificate. Only for demos against self-signed servers.
    Insecure,
}

impl Trust {
    /// Trust the certificates in a PEM file.
    pub fn from_ca_file(path: &Path) -> Result<Self, ConfigError> {
        let certs = CertificateDer::pem_file_iter(path)
            .and_then(|iter| iter.collect::<Result<Vec<_>, _>>())
            .map_err(|source| ConfigError::TlsMaterial {
                what: "CA certificate",
                path: path.to_path_buf(),
                source,
            })?;
        let mut roots = RootCertStore::empty();
        for cert in certs {
            roots.add(cert)?;
        }
        Ok(Trust::Roots(roots))
    }
}

/// Build a rustls client config offering `alpn`.
pub fn client_config(
    trust: &Trust,
    alpn: &[&[u8]],
    keylog: Option<&Path>,
) -> Result<rustls::ClientConfig, ConfigError> {
    let builder = rustls::ClientConfig::builder_with_provider(provider())
        .with_safe_default_protocol_versions()?;

    let mut config = match trust {
        Trust::Roots(roots) => builder
            .with_root_certificates(roots.clone())
            .with_no_client_auth(),
        Trust::Insecure => builder
            .dangerous()
            .with_custom_certificate_verifier(Arc::new(SkipServerVerification(provider())))
            .with_no_client_auth(),
    };
    config.alpn_protocols = alpn.iter().map(|p| p.to_vec()).collect();

    if let Some(path) = keylog {
        let file = File::create(path).map_err(|e| ConfigError::KeyLog(path.to_path_buf(), e))?;
        config.key_log = Arc::new(FileKeyLog {
            file: Mutex::new(file),
        });
    }
    Ok(config)
}

/// Wrap a rustls client config for quinn.
pub fn quic_client_config(config: rustls::ClientConfig) -> Result<quinn::ClientConfig, ConfigError> {
    let crypto = quinn::crypto::rustls::QuicClientConfig::try_from(config)?;
    Ok(quinn::ClientConfig::new(Arc::new(crypto)))
}

/// Accepts any server certificate but still checks handshake signatures.
#[derive(Debug)]
struct SkipServerVerification(Arc<CryptoProvider>);

impl ServerCertVerifier for SkipServerVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &ServerName<'_>,
        _ocsp_response: &[u8],
        _now: UnixTime,
    ) -> Result<ServerCertVerified, rustls::Error> {
        Ok(ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls12_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn verify_tls13_signature(
        &self,
        message: &[u8],
        cert: &CertificateDer<'_>,
        dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        rustls::crypto::verify_tls13_signature(
            message,
            cert,
            dss,
            &self.0.signature_verification_algorithms,
        )
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.0.signature_verification_algorithms.supported_schemes()
    }
}

/// Writes session secrets in NSS key log format.
#[derive(Debug)]
struct FileKeyLog {
    file: Mutex<File>,
}

impl rustls::KeyLog for FileKeyLog {
    fn log(&self, label: &str, client_random: &[u8], secret: &[u8]) {
        if let Ok(mut file) = self.file.lock() {
            let _ = writeln!(
                file,
                "{} {} {}",
                label,
                hex::encode(client_random),
                hex::encode(secret)
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_self_signed_configs() {
        let pair = CertifiedPair::self_signed(&["localhost"]).unwrap();
        assert_eq!(pair.certs.len(), 1);

        let server = server_config(&pair, &[QUIC_ALPN]).unwrap();
        assert_eq!(server.alpn_protocols, vec![QUIC_ALPN.to_vec()]);
        assert!(quic_server_config(&pair, &[QUIC_ALPN], Duration::from_secs(5)).is_ok());

        let trust = Trust::Roots(pair.root_store().unwrap());
        let client = client_config(&trust, &[QUIC_ALPN], None).unwrap();
        assert!(quic_client_config(client).is_ok());
    }

    #[test]
    fn test_missing_pem_files() {
        let files = TlsFiles {
            cert: PathBuf::from("/nonexistent/cert.pem"),
            key: PathBuf::from("/nonexistent/key.pem"),
        };
        let err = TlsSource::Files(files).load().unwrap_err();
        assert!(matches!(err, ConfigError::TlsMaterial { what: "certificate", .. }));
    }

    #[test]
    fn test_load_pem_files() {
        let generated = rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
        let dir = std::env::temp_dir().join(format!("quic-demo-tls-{}", std::process::id()));
        std::fs::create_dir_all(&dir).unwrap();
        let files = TlsFiles {
            cert: dir.join("cert.pem"),
            key: dir.join("key.pem"),
        };
        std::fs::write(&files.cert, generated.cert.pem()).unwrap();
        std::fs::write(&files.key, generated.key_pair.serialize_pem()).unwrap();

        let pair = CertifiedPair::load(&files).unwrap();
        assert_eq!(pair.certs[0].as_ref(), generated.cert.der().as_ref());
        assert!(server_config(&pair, &[TCP_ALPN]).is_ok());

        std::fs::remove_dir_all(&dir).unwrap();
    }

    #[test]
    fn test_insecure_client_config() {
        let config = client_config(&Trust::Insecure, &[ECHO_ALPN], None).unwrap();
        assert_eq!(config.alpn_protocols, vec![ECHO_ALPN.to_vec()]);
    }
}
