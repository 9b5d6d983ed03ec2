//! TLS configuration for both sides of the proxy
//!
//! - Upstream (proxy → remote): webpki roots, optional client certificate,
//!   optional verification bypass, ALPN from settings or rule overrides
//! - Downstream (client → proxy): leaf certificate from the certificate provider,
//!   HTTP/1.1 only

use rustls::client::danger::{HandshakeSignatureValid, ServerCertVerified, ServerCertVerifier};
use rustls::crypto::{ring, CryptoProvider};
use rustls::pki_types::{CertificateDer, PrivateKeyDer, ServerName, UnixTime};
use rustls::version::{TLS12, TLS13};
use rustls::{ClientConfig, DigitallySignedStruct, RootCertStore, ServerConfig, SignatureScheme};
use std::collections::HashMap;
use std::fs::File;
use std::io::BufReader;
use std::path::Path;
use std::sync::{Arc, Mutex};
use tracing::{debug, warn};
use webpki_roots::TLS_SERVER_ROOTS;

use crate::certificate::LeafCertificate;
use crate::error::{ProxyError, RuleExecutionFailure};
use crate::exchange::{AlpnProtocol, ClientCertificate, ExchangeContext};

fn provider() -> Arc<CryptoProvider> {
    Arc::new(ring::default_provider())
}

/// Accepts every remote certificate
#[derive(Debug)]
pub struct NoCertificateVerification {
    provider: Arc<CryptoProvider>,
}

impl NoCertificateVerification {
    pub fn new() -> Self {
        Self {
            provider: provider(),
        }
    }
}

impl Default for NoCertificateVerification {
    fn default() -> Self {
        Self::new()
    }
}

impl ServerCertVerifier for NoCertificateVerification {
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
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn verify_tls13_signature(
        &self,
        _message: &[u8],
        _cert: &CertificateDer<'_>,
        _dss: &DigitallySignedStruct,
    ) -> Result<HandshakeSignatureValid, rustls::Error> {
        Ok(HandshakeSignatureValid::assertion())
    }

    fn supported_verify_schemes(&self) -> Vec<SignatureScheme> {
        self.provider
            .signature_verification_algorithms
            .supported_schemes()
    }
}

type ConfigKey = (Vec<AlpnProtocol>, bool);

/// Builds upstream client configs; certificate-less configs are cached
pub struct UpstreamTlsFactory {
    default_alpn: Vec<AlpnProtocol>,
    skip_verification: bool,
    roots: Arc<RootCertStore>,
    cache: Mutex<HashMap<ConfigKey, Arc<ClientConfig>>>,
}

impl UpstreamTlsFactory {
    pub fn new(default_alpn: Vec<AlpnProtocol>, skip_verification: bool) -> Self {
        let mut roots = RootCertStore::empty();
        roots.extend(TLS_SERVER_ROOTS.iter().cloned());
        debug!(roots_count = TLS_SERVER_ROOTS.len(), "Upstream TLS roots loaded");
        Self {
            default_alpn,
            skip_verification,
            roots: Arc::new(roots),
            cache: Mutex::new(HashMap::new()),
        }
    }

    /// Trust an additional root (private CAs, test servers)
    pub fn with_extra_root(mut self, der: CertificateDer<'static>) -> Result<Self, ProxyError> {
        let mut roots = (*self.roots).clone();
        roots
            .add(der)
            .map_err(|e| ProxyError::Certificate(e.to_string()))?;
        self.roots = Arc::new(roots);
        Ok(self)
    }

    /// Client config honoring the exchange context overrides
    pub fn client_config(&self, context: &ExchangeContext) -> Result<Arc<ClientConfig>, ProxyError> {
        let alpn = context
            .ssl_application_protocols
            .clone()
            .unwrap_or_else(|| self.default_alpn.clone());
        let skip = self.skip_verification || context.skip_remote_certificate_validation;

        if let Some(certificate) = &context.client_certificate {
            return self.build(&alpn, skip, Some(certificate));
        }

        let key = (alpn, skip);
        let mut cache = self.cache.lock().unwrap_or_else(|e| e.into_inner());
        if let Some(config) = cache.get(&key) {
            return Ok(config.clone());
        }
        let config = self.build(&key.0, key.1, None)?;
        cache.insert(key, config.clone());
        Ok(config)
    }

    fn build(
        &self,
        alpn: &[AlpnProtocol],
        skip_verification: bool,
        client_certificate: Option<&Arc<ClientCertificate>>,
    ) -> Result<Arc<ClientConfig>, ProxyError> {
        let builder = ClientConfig::builder_with_provider(provider())
            .with_protocol_versions(&[&TLS12, &TLS13])
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        let builder = if skip_verification {
            warn!("Remote certificate validation disabled");
            builder
                .dangerous()
                .with_custom_certificate_verifier(Arc::new(NoCertificateVerification::new()))
        } else {
            builder.with_root_certificates(self.roots.clone())
        };

        let mut config = match client_certificate {
            Some(cert) => builder
                .with_client_auth_cert(cert.chain.clone(), cert.key.clone_key())
                .map_err(|e| ProxyError::Certificate(e.to_string()))?,
            None => builder.with_no_client_auth(),
        };

        config.alpn_protocols = alpn.iter().map(|p| p.as_bytes().to_vec()).collect();
        Ok(Arc::new(config))
    }
}

/// Server config presented to an intercepted client
pub fn downstream_server_config(leaf: &LeafCertificate) -> Result<Arc<ServerConfig>, ProxyError> {
    let mut config = ServerConfig::builder_with_provider(provider())
        .with_protocol_versions(&[&TLS12, &TLS13])
        .map_err(|e| ProxyError::Config(e.to_string()))?
        .with_no_client_auth()
        .with_single_cert(leaf.chain.clone(), leaf.private_key())
        .map_err(|e| ProxyError::Certificate(e.to_string()))?;

    // Downstream is always HTTP/1.1
    config.alpn_protocols = vec![AlpnProtocol::Http11.as_bytes().to_vec()];
    Ok(Arc::new(config))
}

/// SNI value for a host; IP literals become IP server names
pub fn server_name(host: &str) -> Result<ServerName<'static>, ProxyError> {
    let host = host.trim_start_matches('[').trim_end_matches(']');
    ServerName::try_from(host.to_string()).map_err(|e| ProxyError::tls(host, e))
}

/// Load a PEM certificate chain and private key for client authentication
pub fn load_client_certificate(
    cert_path: impl AsRef<Path>,
    key_path: impl AsRef<Path>,
) -> Result<ClientCertificate, RuleExecutionFailure> {
    let cert_file = File::open(cert_path.as_ref())
        .map_err(|e| RuleExecutionFailure::ClientCertificate(e.to_string()))?;
    let chain: Vec<CertificateDer<'static>> = rustls_pemfile::certs(&mut BufReader::new(cert_file))
        .collect::<Result<_, _>>()
        .map_err(|e| RuleExecutionFailure::ClientCertificate(e.to_string()))?;
    if chain.is_empty() {
        return Err(RuleExecutionFailure::ClientCertificate(format!(
            "no certificate in {}",
            cert_path.as_ref().display()
        )));
    }

    let key_file = File::open(key_path.as_ref())
        .map_err(|e| RuleExecutionFailure::ClientCertificate(e.to_string()))?;
    let key: PrivateKeyDer<'static> = rustls_pemfile::private_key(&mut BufReader::new(key_file))
        .map_err(|e| RuleExecutionFailure::ClientCertificate(e.to_string()))?
        .ok_or_else(|| {
            RuleExecutionFailure::ClientCertificate(format!(
                "no private key in {}",
                key_path.as_ref().display()
            ))
        })?;

    Ok(ClientCertificate { chain, key })
}
