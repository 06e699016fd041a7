//! Self-signed certificate generation for `--self-signed-tls`
//!
//! The broker can serve `wss://` without operator-provided key material by
//! minting an ephemeral certificate at startup. Clients and agents then
//! connect with `--insecure` or pin the certificate via `--ca-cert`.

use rcgen::{CertificateParams, DistinguishedName, DnType, Ia5String, SanType};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use std::net::{IpAddr, Ipv4Addr, Ipv6Addr};
use std::time::{Duration, SystemTime};
use thiserror::Error;
use tracing::debug;

/// Validity window of a generated certificate
const VALIDITY: Duration = Duration::from_secs(365 * 24 * 60 * 60);

#[derive(Error, Debug)]
pub enum SelfSignedError {
    #[error("Certificate generation failed: {0}")]
    GenerationFailed(String),

    #[error("Key generation failed: {0}")]
    KeyGenerationFailed(String),

    #[error("Invalid host name {0:?}")]
    InvalidHost(String),
}

/// Generate a self-signed certificate for `host`
///
/// The subject CN is `host`. SANs always cover `localhost`, `127.0.0.1` and
/// `::1` in addition to `host` itself, which may be a DNS name or an IP.
pub fn generate_self_signed_cert(host: &str) -> Result<SelfSignedCertificate, SelfSignedError> {
    let host = host.trim();
    if host.is_empty() {
        return Err(SelfSignedError::InvalidHost(host.to_string()));
    }

    let mut params = CertificateParams::default();

    let mut dn = DistinguishedName::new();
    dn.push(DnType::CommonName, host);
    dn.push(DnType::OrganizationName, "Burrow");
    params.distinguished_name = dn;

    params.subject_alt_names = subject_alt_names(host)?;

    let now = SystemTime::now()
        .duration_since(SystemTime::UNIX_EPOCH)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_before = time::OffsetDateTime::from_unix_timestamp(now.as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;
    params.not_after = time::OffsetDateTime::from_unix_timestamp((now + VALIDITY).as_secs() as i64)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    params.serial_number = Some(rcgen::SerialNumber::from(rand::random::<u64>()));

    let key_pair =
        rcgen::KeyPair::generate().map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?;

    let cert = params
        .self_signed(&key_pair)
        .map_err(|e| SelfSignedError::GenerationFailed(e.to_string()))?;

    debug!(host = %host, "Generated self-signed certificate");

    Ok(SelfSignedCertificate {
        cert_der: CertificateDer::from(cert.der().to_vec()),
        key_der: PrivateKeyDer::try_from(key_pair.serialize_der())
            .map_err(|e| SelfSignedError::KeyGenerationFailed(e.to_string()))?,
        pem_cert: cert.pem(),
        pem_key: key_pair.serialize_pem(),
    })
}

fn subject_alt_names(host: &str) -> Result<Vec<SanType>, SelfSignedError> {
    let dns = |name: &str| {
        Ia5String::try_from(name)
            .map(SanType::DnsName)
            .map_err(|_| SelfSignedError::InvalidHost(name.to_string()))
    };

    let mut sans = Vec::with_capacity(4);
    match host.parse::<IpAddr>() {
        Ok(ip) => sans.push(SanType::IpAddress(ip)),
        Err(_) => sans.push(dns(host)?),
    }
    if host != "localhost" {
        sans.push(dns("localhost")?);
    }
    for ip in [IpAddr::V4(Ipv4Addr::LOCALHOST), IpAddr::V6(Ipv6Addr::LOCALHOST)] {
        if !matches!(sans.first(), Some(SanType::IpAddress(first)) if *first == ip) {
            sans.push(SanType::IpAddress(ip));
        }
    }
    Ok(sans)
}

/// A self-signed certificate with its private key
pub struct SelfSignedCertificate {
    /// Certificate in DER format
    pub cert_der: CertificateDer<'static>,

    /// Private key in DER format
    pub key_der: PrivateKeyDer<'static>,

    /// Certificate in PEM format
    pub pem_cert: String,

    /// Private key in PEM format
    pub pem_key: String,
}

impl std::fmt::Debug for SelfSignedCertificate {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SelfSignedCertificate")
            .field("cert_len", &self.cert_der.len())
            .finish_non_exhaustive()
    }
}

impl SelfSignedCertificate {
    /// Save certificate and key to PEM files
    pub fn save_to_files(&self, cert_path: &str, key_path: &str) -> std::io::Result<()> {
        std::fs::write(cert_path, &self.pem_cert)?;
        std::fs::write(key_path, &self.pem_key)?;
        Ok(())
    }
}
