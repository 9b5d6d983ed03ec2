//! Certificate Authority - leaf certificates for intercepted hosts
//!
//! Leaf certificates are issued per root domain with a wildcard SAN, signed by
//! a CA loaded from PEM files or generated at startup, and kept in an LRU cache.

use async_trait::async_trait;
use lru::LruCache;
use rcgen::{
    BasicConstraints, Certificate, CertificateParams, DistinguishedName, DnType,
    ExtendedKeyUsagePurpose, IsCa, KeyPair, KeyUsagePurpose, SerialNumber,
};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, PrivatePkcs8KeyDer};
use std::io::BufReader;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::path::Path;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::{debug, info};

use crate::error::ProxyError;
use crate::proxy_metrics::CERTIFICATES_GENERATED;

/// Certificate chain and key presented to an intercepted client
pub struct LeafCertificate {
    /// Leaf first, then the CA
    pub chain: Vec<CertificateDer<'static>>,
    key_der: Vec<u8>,
}

impl LeafCertificate {
    pub fn private_key(&self) -> PrivateKeyDer<'static> {
        PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(self.key_der.clone()))
    }
}

/// Supplies leaf certificates for CONNECT interception
#[async_trait]
pub trait CertificateProvider: Send + Sync {
    async fn get_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>, ProxyError>;

    /// PEM of the signing CA, served to clients that ask the proxy for it
    fn ca_certificate_pem(&self) -> String;
}

/// Host identifier used as the cache key
#[derive(Debug, Clone, Hash, Eq, PartialEq)]
pub enum HostIdentifier {
    /// Registrable part of a host name; the leaf covers it and `*.` of it
    Domain(String),
    IpAddress(IpAddr),
}

impl HostIdentifier {
    pub fn from_hostname(hostname: &str) -> Self {
        let trimmed = hostname.trim_start_matches('[').trim_end_matches(']');
        if let Ok(ip) = trimmed.parse::<IpAddr>() {
            return Self::IpAddress(ip);
        }
        Self::Domain(root_domain(&trimmed.to_ascii_lowercase()))
    }

    fn subject_alt_names(&self) -> Vec<String> {
        match self {
            Self::Domain(root) if root.contains('.') => vec![root.clone(), format!("*.{}", root)],
            Self::Domain(root) => vec![root.clone()],
            Self::IpAddress(ip) => vec![ip.to_string()],
        }
    }

    fn common_name(&self) -> String {
        match self {
            Self::Domain(root) => root.clone(),
            Self::IpAddress(ip) => ip.to_string(),
        }
    }
}

/// `a.b.example.com` → `b.example.com`; names with two labels or fewer are kept
fn root_domain(host: &str) -> String {
    let labels: Vec<&str> = host.split('.').filter(|l| !l.is_empty()).collect();
    if labels.len() <= 2 {
        return labels.join(".");
    }
    labels[1..].join(".")
}

pub struct CertificateAuthority {
    ca_cert: Certificate,
    ca_key: KeyPair,
    ca_der: CertificateDer<'static>,
    ca_pem: String,
    cache: Mutex<LruCache<HostIdentifier, Arc<LeafCertificate>>>,
    generated: AtomicU64,
}

fn cert_error(e: impl ToString) -> ProxyError {
    ProxyError::Certificate(e.to_string())
}

fn validity(params: &mut CertificateParams, days: i64) {
    params.not_before = time::OffsetDateTime::now_utc() - time::Duration::days(1);
    params.not_after = time::OffsetDateTime::now_utc() + time::Duration::days(days);
}

/// Crypto RNG + timestamp
fn generate_serial_number() -> SerialNumber {
    use rand::Rng;
    let random_part: u32 = rand::thread_rng().gen();
    let timestamp_part = chrono::Utc::now().timestamp() as u32;
    let serial = ((timestamp_part as u64) << 32) | (random_part as u64);
    SerialNumber::from(serial.to_be_bytes().to_vec())
}

fn cache_capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl CertificateAuthority {
    /// Generate an ephemeral CA valid for ten years
    pub fn generate(cache_size: usize) -> Result<Self, ProxyError> {
        let mut params = CertificateParams::default();
        let mut name = DistinguishedName::new();
        name.push(DnType::CommonName, "Fluxgate Interception CA".to_string());
        name.push(DnType::OrganizationName, "Fluxgate".to_string());
        params.distinguished_name = name;
        params.is_ca = IsCa::Ca(BasicConstraints::Unconstrained);
        params.key_usages = vec![
            KeyUsagePurpose::KeyCertSign,
            KeyUsagePurpose::CrlSign,
            KeyUsagePurpose::DigitalSignature,
        ];
        params.serial_number = Some(generate_serial_number());
        validity(&mut params, 3650);

        let ca_key = KeyPair::generate().map_err(cert_error)?;
        let ca_cert = params.self_signed(&ca_key).map_err(cert_error)?;
        let ca_der = ca_cert.der().clone();
        let ca_pem = ca_cert.pem();

        info!("Generated ephemeral interception CA");

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            ca_pem,
            cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
            generated: AtomicU64::new(0),
        })
    }

    /// Load a CA from PEM strings
    pub fn from_pem(cert_pem: &str, key_pem: &str, cache_size: usize) -> Result<Self, ProxyError> {
        let ca_key = KeyPair::from_pem(key_pem).map_err(cert_error)?;
        let params = CertificateParams::from_ca_cert_pem(cert_pem).map_err(cert_error)?;
        // Issuer object used for signing; the original DER is what clients trust
        let ca_cert = params.self_signed(&ca_key).map_err(cert_error)?;

        let ca_der = rustls_pemfile::certs(&mut BufReader::new(cert_pem.as_bytes()))
            .next()
            .ok_or_else(|| ProxyError::Certificate("no certificate in CA PEM".into()))?
            .map_err(cert_error)?;

        Ok(Self {
            ca_cert,
            ca_key,
            ca_der,
            ca_pem: cert_pem.to_string(),
            cache: Mutex::new(LruCache::new(cache_capacity(cache_size))),
            generated: AtomicU64::new(0),
        })
    }

    /// Load a CA from PEM files
    pub fn from_files(
        cert_path: impl AsRef<Path>,
        key_path: impl AsRef<Path>,
        cache_size: usize,
    ) -> Result<Self, ProxyError> {
        let cert_pem = std::fs::read_to_string(cert_path.as_ref()).map_err(|e| {
            ProxyError::Certificate(format!("{}: {}", cert_path.as_ref().display(), e))
        })?;
        let key_pem = std::fs::read_to_string(key_path.as_ref()).map_err(|e| {
            ProxyError::Certificate(format!("{}: {}", key_path.as_ref().display(), e))
        })?;
        Self::from_pem(&cert_pem, &key_pem, cache_size)
    }

    pub fn ca_der(&self) -> &CertificateDer<'static> {
        &self.ca_der
    }

    /// Number of leaf certificates generated so far
    pub fn generated(&self) -> u64 {
        self.generated.load(Ordering::Relaxed)
    }

    fn issue(&self, host: &HostIdentifier) -> Result<LeafCertificate, ProxyError> {
        let mut params = CertificateParams::new(host.subject_alt_names()).map_err(cert_error)?;
        params
            .distinguished_name
            .push(DnType::CommonName, host.common_name());
        params.extended_key_usages = vec![ExtendedKeyUsagePurpose::ServerAuth];
        params.serial_number = Some(generate_serial_number());
        validity(&mut params, 365);

        let key = KeyPair::generate().map_err(cert_error)?;
        let cert = params
            .signed_by(&key, &self.ca_cert, &self.ca_key)
            .map_err(cert_error)?;

        self.generated.fetch_add(1, Ordering::Relaxed);
        CERTIFICATES_GENERATED.inc();

        Ok(LeafCertificate {
            chain: vec![cert.der().clone(), self.ca_der.clone()],
            key_der: key.serialize_der(),
        })
    }
}

#[async_trait]
impl CertificateProvider for CertificateAuthority {
    async fn get_certificate(&self, host: &str) -> Result<Arc<LeafCertificate>, ProxyError> {
        let id = HostIdentifier::from_hostname(host);
        let mut cache = self.cache.lock().await;
        if let Some(leaf) = cache.get(&id) {
            debug!(host = %host, "Certificate cache hit");
            return Ok(Arc::clone(leaf));
        }

        debug!(host = %host, id = ?id, "Generating leaf certificate");
        let leaf = Arc::new(self.issue(&id)?);
        cache.put(id, Arc::clone(&leaf));
        Ok(leaf)
    }

    fn ca_certificate_pem(&self) -> String {
        self.ca_pem.clone()
    }
}
