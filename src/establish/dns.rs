//! Host name resolution with an LRU cache

use async_trait::async_trait;
use lru::LruCache;
use std::net::IpAddr;
use std::num::NonZeroUsize;
use std::time::{Duration, Instant};
use tokio::sync::Mutex;
use tokio::time::timeout;
use tracing::{debug, warn};
use trust_dns_resolver::config::{ResolverConfig, ResolverOpts};
use trust_dns_resolver::TokioAsyncResolver;

use crate::error::ProxyError;

/// Resolves a host name to one IP address
#[async_trait]
pub trait DnsSolver: Send + Sync {
    async fn solve(&self, host: &str) -> Result<IpAddr, ProxyError>;
}

/// IP literals (optionally bracketed) need no lookup
pub fn parse_ip_literal(host: &str) -> Option<IpAddr> {
    host.trim_start_matches('[')
        .trim_end_matches(']')
        .parse::<IpAddr>()
        .ok()
}

struct CachedResolution {
    ip: IpAddr,
    resolved_at: Instant,
}

/// System resolver (falls back to public resolvers) with a TTL bounded cache
pub struct SystemDnsSolver {
    resolver: TokioAsyncResolver,
    cache: Mutex<LruCache<String, CachedResolution>>,
    resolver_timeout: Duration,
    cache_ttl: Duration,
}

impl SystemDnsSolver {
    pub fn new(cache_size: usize, cache_ttl_seconds: u64, resolver_timeout_seconds: u64) -> Self {
        let mut opts = ResolverOpts::default();
        opts.timeout = Duration::from_secs(resolver_timeout_seconds);
        opts.attempts = 2;

        let resolver = TokioAsyncResolver::tokio_from_system_conf().unwrap_or_else(|_| {
            warn!("Failed to load system DNS config, falling back to Google DNS");
            TokioAsyncResolver::tokio(ResolverConfig::google(), opts.clone())
        });

        let capacity = NonZeroUsize::new(cache_size).unwrap_or(NonZeroUsize::MIN);

        Self {
            resolver,
            cache: Mutex::new(LruCache::new(capacity)),
            resolver_timeout: Duration::from_secs(resolver_timeout_seconds),
            cache_ttl: Duration::from_secs(cache_ttl_seconds),
        }
    }
}

#[async_trait]
impl DnsSolver for SystemDnsSolver {
    async fn solve(&self, host: &str) -> Result<IpAddr, ProxyError> {
        if let Some(ip) = parse_ip_literal(host) {
            return Ok(ip);
        }

        let key = host.to_ascii_lowercase();
        {
            let mut cache = self.cache.lock().await;
            if let Some(cached) = cache.get(&key) {
                if cached.resolved_at.elapsed() < self.cache_ttl {
                    debug!(host = %host, ip = %cached.ip, "DNS cache hit");
                    return Ok(cached.ip);
                }
            }
        }

        let ip = match timeout(self.resolver_timeout, self.resolver.lookup_ip(host)).await {
            Ok(Ok(lookup)) => lookup
                .iter()
                .next()
                .ok_or_else(|| ProxyError::dns(host, "no address found"))?,
            Ok(Err(e)) => {
                warn!(host = %host, error = %e, "DNS resolution failed");
                return Err(ProxyError::dns(host, e));
            }
            Err(_) => {
                warn!(host = %host, "DNS resolution timeout");
                return Err(ProxyError::dns(host, "timeout"));
            }
        };

        debug!(host = %host, ip = %ip, "Resolved");
        self.cache.lock().await.put(
            key,
            CachedResolution {
                ip,
                resolved_at: Instant::now(),
            },
        );
        Ok(ip)
    }
}
