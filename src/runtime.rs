//! Runtime context shared by every component of a running proxy
//!
//! Built once from [`ProxySettings`]; collaborators (DNS, TCP, certificates,
//! archive) can be swapped before [`ProxyRuntimeBuilder::build`].

use rustls::pki_types::CertificateDer;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::archive::{ArchiveWriter, NoArchiveWriter};
use crate::certificate::{CertificateAuthority, CertificateProvider};
use crate::config::ProxySettings;
use crate::error::ProxyError;
use crate::establish::{
    ConnectionBuilder, DefaultTcpConnectionProvider, DnsSolver, SystemDnsSolver,
    TcpConnectionProvider, UpstreamTlsFactory,
};
use crate::exchange::builder::ExchangeBuilder;
use crate::exchange::IdGenerator;
use crate::http::h11::H11Options;
use crate::pool::{PoolBuilder, PoolSettings};
use crate::rules::{builtin_rules, load_rules, Rule, RuleEngine};

pub struct ProxyRuntimeContext {
    pub settings: ProxySettings,
    pub certificates: Arc<dyn CertificateProvider>,
    pub rules: Arc<RuleEngine>,
    pub archive: Arc<dyn ArchiveWriter>,
    pub connections: Arc<ConnectionBuilder>,
    pub pools: Arc<PoolBuilder>,
    pub exchanges: Arc<ExchangeBuilder>,
    pub exchange_ids: Arc<IdGenerator>,
    pub connection_ids: Arc<IdGenerator>,
    /// Cancelled to stop accepting; also fired when the exchange limit is reached
    pub shutdown: CancellationToken,
}

impl ProxyRuntimeContext {
    pub fn h11_options(&self) -> H11Options {
        H11Options {
            max_header_length: self.settings.max_header_length,
            buffer_size: self.settings.buffer_size,
        }
    }
}

impl std::fmt::Debug for ProxyRuntimeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ProxyRuntimeContext")
            .field("settings", &self.settings)
            .field("rules", &self.rules)
            .finish()
    }
}

pub struct ProxyRuntimeBuilder {
    settings: ProxySettings,
    archive: Option<Arc<dyn ArchiveWriter>>,
    dns: Option<Arc<dyn DnsSolver>>,
    tcp: Option<Arc<dyn TcpConnectionProvider>>,
    certificates: Option<Arc<dyn CertificateProvider>>,
    extra_rules: Vec<Rule>,
    trusted_roots: Vec<CertificateDer<'static>>,
}

impl ProxyRuntimeBuilder {
    pub fn new(settings: ProxySettings) -> Self {
        Self {
            settings,
            archive: None,
            dns: None,
            tcp: None,
            certificates: None,
            extra_rules: Vec::new(),
            trusted_roots: Vec::new(),
        }
    }

    pub fn archive(mut self, archive: Arc<dyn ArchiveWriter>) -> Self {
        self.archive = Some(archive);
        self
    }

    pub fn dns(mut self, dns: Arc<dyn DnsSolver>) -> Self {
        self.dns = Some(dns);
        self
    }

    pub fn tcp(mut self, tcp: Arc<dyn TcpConnectionProvider>) -> Self {
        self.tcp = Some(tcp);
        self
    }

    pub fn certificates(mut self, certificates: Arc<dyn CertificateProvider>) -> Self {
        self.certificates = Some(certificates);
        self
    }

    /// Append a rule after the rule file's rules
    pub fn rule(mut self, rule: Rule) -> Self {
        self.extra_rules.push(rule);
        self
    }

    /// Trust an extra upstream root certificate
    pub fn trust_root(mut self, der: CertificateDer<'static>) -> Self {
        self.trusted_roots.push(der);
        self
    }

    pub fn build(self) -> Result<Arc<ProxyRuntimeContext>, ProxyError> {
        let settings = self.settings;
        settings
            .validate()
            .map_err(|e| ProxyError::Config(e.to_string()))?;

        let certificates: Arc<dyn CertificateProvider> = match self.certificates {
            Some(certificates) => certificates,
            None => match (&settings.ca_certificate_path, &settings.ca_private_key_path) {
                (Some(cert), Some(key)) => Arc::new(CertificateAuthority::from_files(
                    cert,
                    key,
                    settings.certificate_cache_size,
                )?),
                _ => {
                    info!("No CA configured, generating an ephemeral interception CA");
                    Arc::new(CertificateAuthority::generate(
                        settings.certificate_cache_size,
                    )?)
                }
            },
        };

        let mut user_rules = match &settings.rules_file {
            Some(path) => {
                let rules = load_rules(path)?;
                info!(path = %path.display(), count = rules.len(), "Rules loaded");
                rules
            }
            None => Vec::new(),
        };
        user_rules.extend(self.extra_rules);
        let rules = Arc::new(RuleEngine::new(
            builtin_rules(
                settings.skip_global_ssl_decryption,
                certificates.ca_certificate_pem(),
            ),
            user_rules,
        ));

        let dns: Arc<dyn DnsSolver> = match self.dns {
            Some(dns) => dns,
            None => Arc::new(SystemDnsSolver::new(
                settings.dns_cache_size,
                settings.dns_cache_ttl_seconds,
                settings.dns_timeout_seconds,
            )),
        };
        let tcp: Arc<dyn TcpConnectionProvider> = match self.tcp {
            Some(tcp) => tcp,
            None => Arc::new(DefaultTcpConnectionProvider::new(settings.connect_timeout())),
        };

        let mut tls = UpstreamTlsFactory::new(
            settings.alpn_protocols.clone(),
            settings.skip_remote_certificate_validation,
        );
        for root in self.trusted_roots {
            tls = tls.with_extra_root(root)?;
        }

        let connection_ids = Arc::new(IdGenerator::new());
        let exchange_ids = Arc::new(IdGenerator::new());
        let connections = Arc::new(ConnectionBuilder::new(
            dns,
            tcp,
            Arc::new(tls),
            rules.clone(),
            connection_ids.clone(),
        ));

        let h11 = H11Options {
            max_header_length: settings.max_header_length,
            buffer_size: settings.buffer_size,
        };
        let pools = Arc::new(PoolBuilder::new(
            connections.clone(),
            PoolSettings {
                connection_per_host: settings.connection_per_host,
                idle_timeout: settings.idle_timeout(),
                h11,
            },
        ));
        let exchanges = Arc::new(ExchangeBuilder::new(
            rules.clone(),
            certificates.clone(),
            exchange_ids.clone(),
            settings.max_header_length,
        ));

        let archive: Arc<dyn ArchiveWriter> = match self.archive {
            Some(archive) => archive,
            None => Arc::new(NoArchiveWriter::new()),
        };
        let shutdown = CancellationToken::new();
        if let Some(max) = settings.max_exchange_count {
            let token = shutdown.clone();
            archive.register_exchange_limit(
                max,
                Box::new(move || {
                    info!(max, "Exchange limit reached, stopping proxy");
                    token.cancel();
                }),
            );
        }

        Ok(Arc::new(ProxyRuntimeContext {
            settings,
            certificates,
            rules,
            archive,
            connections,
            pools,
            exchanges,
            exchange_ids,
            connection_ids,
            shutdown,
        }))
    }
}
