//! TLS configuration for the broker listener and for outgoing connections

use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use tokio_rustls::{TlsAcceptor, TlsConnector};
use tracing::{debug, info};

use crate::error::{TransportError, TransportResult};

/// Where the broker gets its certificate from
#[derive(Debug, Clone)]
pub enum ServerTlsConfig {
    /// Operator-supplied PEM certificate chain and private key
    Pem { cert_path: PathBuf, key_path: PathBuf },

    /// Ephemeral self-signed certificate minted at startup
    SelfSigned { host: String },
}

impl ServerTlsConfig {
    /// Build rustls TlsAcceptor for the listener
    pub fn build_acceptor(&self) -> TransportResult<TlsAcceptor> {
        ensure_crypto_provider();

        let (certs, key) = match self {
            ServerTlsConfig::Pem {
                cert_path,
                key_path,
            } => (load_certs(cert_path)?, load_private_key(key_path)?),
            ServerTlsConfig::SelfSigned { host } => {
                let cert = burrow_cert::generate_self_signed_cert(host).map_err(|e| {
                    TransportError::TlsError(format!("Failed to generate self-signed cert: {}", e))
                })?;
                info!(host = %host, "Using self-signed TLS certificate");
                (vec![cert.cert_der], cert.key_der)
            }
        };

        let server_crypto = rustls::ServerConfig::builder()
            .with_no_client_auth()
            .with_single_cert(certs, key)
            .map_err(|e| TransportError::TlsError(format!("Invalid cert/key: {}", e)))?;

        Ok(TlsAcceptor::from(Arc::new(server_crypto)))
    }
}

/// How outgoing `wss://` connections verify the broker
#[derive(Debug, Clone, Default)]
pub struct ClientTlsConfig {
    /// Skip certificate verification entirely (INSECURE)
    pub insecure: bool,

    /// Trust only the certificates in this PEM file
    pub ca_cert_path: Option<PathBuf>,
}

impl ClientTlsConfig {
    pub fn insecure() -> Self {
        Self {
            insecure: true,
            ca_cert_path: None,
        }
    }

    /// Build rustls TlsConnector for client
    pub fn build_connector(&self) -> TransportResult<TlsConnector> {
        ensure_crypto_provider();

        let client_crypto = if self.insecure {
            debug!("TLS certificate verification disabled");
            rustls::ClientConfig::builder()
                .dangerous()
                .with_custom_certificate_verifier(SkipVerification::new())
                .with_no_client_auth()
        } else {
            let mut roots = rustls::RootCertStore::empty();
            match &self.ca_cert_path {
                Some(path) => {
                    for cert in load_certs(path)? {
                        roots.add(cert).map_err(|e| {
                            TransportError::ConfigurationError(format!("Invalid root cert: {}", e))
                        })?;
                    }
                }
                None => roots.extend(webpki_roots::TLS_SERVER_ROOTS.iter().cloned()),
            }
            rustls::ClientConfig::builder()
                .with_root_certificates(roots)
                .with_no_client_auth()
        };

        Ok(TlsConnector::from(Arc::new(client_crypto)))
    }
}

static CRYPTO_PROVIDER_INIT: std::sync::Once = std::sync::Once::new();

/// Install the ring provider as the process default, once
pub fn ensure_crypto_provider() {
    CRYPTO_PROVIDER_INIT.call_once(|| {
        if rustls::crypto::ring::default_provider()
            .install_default()
            .is_err()
        {
            tracing::debug!("Rustls crypto provider already installed");
        }
    });
}

fn load_certs(path: &Path) -> TransportResult<Vec<CertificateDer<'static>>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open cert file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    let certs = rustls_pemfile::certs(&mut reader)
        .collect::<Result<Vec<_>, _>>()
        .map_err(|e| TransportError::TlsError(format!("Failed to parse certs: {}", e)))?;

    if certs.is_empty() {
        return Err(TransportError::TlsError(format!(
            "No certificates found in {}",
            path.display()
        )));
    }
    Ok(certs)
}

fn load_private_key(path: &Path) -> TransportResult<PrivateKeyDer<'static>> {
    let file = File::open(path).map_err(|e| {
        TransportError::TlsError(format!("Failed to open key file {}: {}", path.display(), e))
    })?;
    let mut reader = BufReader::new(file);

    rustls_pemfile::private_key(&mut reader)
        .map_err(|e| TransportError::TlsError(format!("Failed to parse key: {}", e)))?
        .ok_or_else(|| TransportError::TlsError("No private key found".to_string()))
}

// Certificate verifier that skips verification (INSECURE)
#[derive(Debug)]
struct SkipVerification;

impl SkipVerification {
    fn new() -> Arc<Self> {
        Arc::new(Self)
    }
}

impl rustls::client::danger::ServerCertVerifier for SkipVerification {
    fn verify_server_cert(
        &self,
        _end_entity: &CertificateDer<'_>,
        _intermediates: &[CertificateDer<'_>],
        _server_name: &rustls::pki_types::ServerName<'_>,
        _ocsp_response: &[u8],
        _now: rustls::pki_types::UnixTime,
    ) -> Result<rustls::client::danger::ServerCertVerified, rustls::Error> {
        Ok(rustls::client::danger::ServerCertVerified::assertion())
    }

    fn verify_tls12_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &rustls::DigitallySignedStruct,
    ) -> Result<rustls::client::danger::HandshakeSignatureValid, rustls::Error> {
        Ok(rustls::client::danger::HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<rustls::SignatureScheme> {
        use rustls::SignatureScheme;
        vec![
            SignatureScheme::RSA_PKCS1_SHA256,
            SignatureScheme::RSA_PKCS1_SHA384,
            SignatureScheme::RSA_PKCS1_SHA512,
            SignatureScheme::ECDSA_NISTP256_SHA256,
            SignatureScheme::ECDSA_NISTP384_SHA384,
            SignatureScheme::ECDSA_NISTP521_SHA512,
            SignatureScheme::RSA_PSS_SHA256,
            SignatureScheme::RSA_PSS_SHA384,
            SignatureScheme::RSA_PSS_SHA512,
            SignatureScheme::ED25519,
            SignatureScheme::ED448,
        ]
    }
}
