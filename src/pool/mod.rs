//! Upstream connection pools
//!
//! [`PoolBuilder`] maps each [`Authority`] to exactly one live pool. The pool
//! type is decided once, when the pool is created:
//!
//! - plaintext authorities get an HTTP/1.1 pool
//! - secure authorities open a first TLS connection and follow its ALPN result
//! - blind tunnels and WebSocket upgrades get a dedicated single-use pool that
//!   is never registered
//!
//! Creation for one authority is serialized by a per-authority async gate, so
//! concurrent callers observe the pool built by the first one.

pub mod http11;
pub mod http2;
pub mod tunnel;
pub mod websocket;

pub use self::http11::Http11ConnectionPool;
pub use self::http2::H2ConnectionPool;
pub use self::tunnel::TunnelOnlyConnectionPool;
pub use self::websocket::WebSocketConnectionPool;

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;
use tracing::{debug, info};

use crate::authority::Authority;
use crate::error::ProxyError;
use crate::establish::{ConnectionBuilder, RemoteConnectionResultType};
use crate::exchange::Exchange;
use crate::http::h11::H11Options;
use crate::proxy_metrics;

/// Limits shared by every pool
#[derive(Debug, Clone, Copy)]
pub struct PoolSettings {
    pub connection_per_host: usize,
    pub idle_timeout: Duration,
    pub h11: H11Options,
}

impl Default for PoolSettings {
    fn default() -> Self {
        Self {
            connection_per_host: 16,
            idle_timeout: Duration::from_secs(4),
            h11: H11Options::default(),
        }
    }
}

/// Pool variants, fixed by the protocol negotiated for an authority
pub enum ConnectionPool {
    Http11(Http11ConnectionPool),
    Http2(H2ConnectionPool),
    TunnelOnly(TunnelOnlyConnectionPool),
    WebSocket(WebSocketConnectionPool),
}

impl ConnectionPool {
    pub fn authority(&self) -> &Authority {
        match self {
            Self::Http11(p) => p.authority(),
            Self::Http2(p) => p.authority(),
            Self::TunnelOnly(p) => p.authority(),
            Self::WebSocket(p) => p.authority(),
        }
    }

    /// Label used in logs and metrics
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Http11(_) => "http11",
            Self::Http2(_) => "h2",
            Self::TunnelOnly(_) => "tunnel",
            Self::WebSocket(_) => "websocket",
        }
    }

    /// Forward the exchange. On success the response (or the upgraded link) is
    /// attached to the exchange.
    pub async fn send(&self, exchange: &mut Exchange) -> Result<(), ProxyError> {
        match self {
            Self::Http11(p) => p.send(exchange).await,
            Self::Http2(p) => p.send(exchange).await,
            Self::TunnelOnly(p) => p.send(exchange).await,
            Self::WebSocket(p) => p.send(exchange).await,
        }
    }

    /// False once the pool cannot serve further exchanges
    pub fn check_alive(&self) -> bool {
        match self {
            Self::Http11(p) => p.check_alive(),
            Self::Http2(p) => p.check_alive(),
            Self::TunnelOnly(_) | Self::WebSocket(_) => true,
        }
    }

    pub fn dispose(&self) {
        match self {
            Self::Http11(p) => p.dispose(),
            Self::Http2(p) => p.dispose(),
            Self::TunnelOnly(_) | Self::WebSocket(_) => {}
        }
    }
}

impl std::fmt::Debug for ConnectionPool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionPool")
            .field("kind", &self.kind())
            .field("authority", self.authority())
            .finish()
    }
}

/// Authority → pool map
#[derive(Default)]
pub struct PoolRegistry {
    pools: Mutex<HashMap<Authority, Arc<ConnectionPool>>>,
}

impl PoolRegistry {
    fn get(&self, authority: &Authority) -> Option<Arc<ConnectionPool>> {
        let pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.get(authority).cloned()
    }

    fn insert(&self, pool: Arc<ConnectionPool>) {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.insert(pool.authority().clone(), pool);
    }

    /// Remove the pool registered for `authority` if it is still `pool`
    pub fn remove_if(&self, authority: &Authority, pool: &Weak<ConnectionPool>) -> bool {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        let registered = pools
            .get(authority)
            .map(|p| std::ptr::eq(Arc::as_ptr(p), pool.as_ptr()))
            .unwrap_or(false);
        if registered {
            pools.remove(authority);
        }
        registered
    }

    fn drain(&self) -> Vec<Arc<ConnectionPool>> {
        let mut pools = self.pools.lock().unwrap_or_else(|e| e.into_inner());
        pools.drain().map(|(_, p)| p).collect()
    }

    pub fn len(&self) -> usize {
        self.pools.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

type Gates = Mutex<HashMap<Authority, Arc<tokio::sync::Mutex<()>>>>;

/// Per-authority creation gate, released from the map by its last holder
struct GateLease<'a> {
    gates: &'a Gates,
    authority: Authority,
    gate: Arc<tokio::sync::Mutex<()>>,
}

impl Drop for GateLease<'_> {
    fn drop(&mut self) {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        // The map and this lease
        if Arc::strong_count(&self.gate) == 2 {
            gates.remove(&self.authority);
        }
    }
}

/// Resolves the pool of an exchange, creating it on first use
pub struct PoolBuilder {
    connections: Arc<ConnectionBuilder>,
    settings: PoolSettings,
    registry: Arc<PoolRegistry>,
    gates: Gates,
    created: AtomicUsize,
}

impl PoolBuilder {
    pub fn new(connections: Arc<ConnectionBuilder>, settings: PoolSettings) -> Self {
        Self {
            connections,
            settings,
            registry: Arc::new(PoolRegistry::default()),
            gates: Mutex::new(HashMap::new()),
            created: AtomicUsize::new(0),
        }
    }

    /// Number of pools constructed so far, registered or not
    pub fn pools_created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn registry(&self) -> &Arc<PoolRegistry> {
        &self.registry
    }

    fn gate(&self, authority: &Authority) -> GateLease<'_> {
        let mut gates = self.gates.lock().unwrap_or_else(|e| e.into_inner());
        let gate = gates
            .entry(authority.clone())
            .or_insert_with(|| Arc::new(tokio::sync::Mutex::new(())))
            .clone();
        GateLease {
            gates: &self.gates,
            authority: authority.clone(),
            gate,
        }
    }

    /// Authorities with a creation gate still allocated
    #[cfg(test)]
    fn gate_count(&self) -> usize {
        self.gates.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn live(&self, authority: &Authority) -> Option<Arc<ConnectionPool>> {
        self.registry.get(authority).filter(|p| p.check_alive())
    }

    fn created(&self, pool: &ConnectionPool) {
        self.created.fetch_add(1, Ordering::SeqCst);
        proxy_metrics::record_pool_created(pool.kind());
    }

    /// Pool serving `exchange.authority`
    pub async fn get_pool(&self, exchange: &mut Exchange) -> Result<Arc<ConnectionPool>, ProxyError> {
        exchange.metrics.stamp(|m| &mut m.retrieving_pool);
        let authority = exchange.authority.clone();

        if exchange.tunneled_only {
            let pool = ConnectionPool::TunnelOnly(TunnelOnlyConnectionPool::new(
                authority,
                self.connections.clone(),
            ));
            self.created(&pool);
            return Ok(Arc::new(pool));
        }

        if exchange.is_websocket() {
            let pool = ConnectionPool::WebSocket(WebSocketConnectionPool::new(
                authority,
                self.connections.clone(),
                self.settings.h11,
            ));
            self.created(&pool);
            return Ok(Arc::new(pool));
        }

        if let Some(pool) = self.live(&authority) {
            return Ok(pool);
        }

        let lease = self.gate(&authority);
        let _guard = lease.gate.lock().await;

        if let Some(pool) = self.live(&authority) {
            return Ok(pool);
        }

        let pool = self.create(exchange).await?;
        self.created(&pool);
        info!(authority = %authority, kind = pool.kind(), "Connection pool created");
        self.registry.insert(pool.clone());
        Ok(pool)
    }

    async fn create(&self, exchange: &mut Exchange) -> Result<Arc<ConnectionPool>, ProxyError> {
        let authority = exchange.authority.clone();

        if !authority.secure() {
            return Ok(Arc::new(ConnectionPool::Http11(Http11ConnectionPool::new(
                authority,
                self.connections.clone(),
                self.settings,
            ))));
        }

        // ALPN decides the pool type; the first connection is kept by the pool
        let result = self
            .connections
            .open(&authority, &mut exchange.context, Some(&exchange.metrics), true)
            .await?;

        match result.kind {
            RemoteConnectionResultType::Http2 => {
                debug!(authority = %authority, "Remote negotiated h2");
                let handshake = http2::handshake(result, self.settings.h11.buffer_size).await?;
                let registry = Arc::downgrade(&self.registry);
                Ok(Arc::new_cyclic(|weak: &Weak<ConnectionPool>| {
                    let weak = weak.clone();
                    let key = authority.clone();
                    let on_fault = move || {
                        if let Some(registry) = registry.upgrade() {
                            if registry.remove_if(&key, &weak) {
                                info!(authority = %key, "Faulted h2 pool removed");
                            }
                        }
                    };
                    ConnectionPool::Http2(H2ConnectionPool::new(authority, handshake, on_fault))
                }))
            }
            RemoteConnectionResultType::Http11 => {
                let pool = Http11ConnectionPool::new(
                    authority,
                    self.connections.clone(),
                    self.settings,
                );
                pool.seed(result);
                Ok(Arc::new(ConnectionPool::Http11(pool)))
            }
        }
    }

    /// Dispose and forget every registered pool
    pub fn dispose_all(&self) {
        for pool in self.registry.drain() {
            pool.dispose();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::establish::{DefaultTcpConnectionProvider, SystemDnsSolver, UpstreamTlsFactory};
    use crate::exchange::{ExchangeContext, IdGenerator, Request};
    use crate::http::body::Body;
    use crate::http::header::RequestHeader;
    use crate::rules::RuleEngine;

    fn builder() -> PoolBuilder {
        let connections = ConnectionBuilder::new(
            Arc::new(SystemDnsSolver::new(16, 60, 1)),
            Arc::new(DefaultTcpConnectionProvider::new(Duration::from_secs(1))),
            Arc::new(UpstreamTlsFactory::new(vec![], false)),
            Arc::new(RuleEngine::new(Vec::new(), Vec::new())),
            Arc::new(IdGenerator::new()),
        );
        PoolBuilder::new(Arc::new(connections), PoolSettings::default())
    }

    fn exchange(raw: &[u8], authority: Authority) -> Exchange {
        let header = RequestHeader::parse(raw, false, None).unwrap();
        Exchange::new(1, authority, ExchangeContext::new(), Request::new(header, Body::empty()))
    }

    #[tokio::test]
    async fn test_plaintext_pool_is_reused() {
        let builder = builder();
        let authority = Authority::new("example.com", 80, false);
        let mut a = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", authority.clone());
        let mut b = exchange(
            b"GET / HTTP/1.1\r\nHost: EXAMPLE.com\r\n\r\n",
            Authority::new("EXAMPLE.COM", 80, false),
        );

        let first = builder.get_pool(&mut a).await.unwrap();
        let second = builder.get_pool(&mut b).await.unwrap();
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.kind(), "http11");
        assert_eq!(builder.pools_created(), 1);
        assert!(a.metrics.snapshot().retrieving_pool.is_some());
    }

    #[tokio::test]
    async fn test_tunnel_and_websocket_pools_are_not_registered() {
        let builder = builder();
        let authority = Authority::new("example.com", 443, true);

        let mut tunnel = exchange(b"CONNECT example.com:443 HTTP/1.1\r\n\r\n", authority.clone());
        tunnel.tunneled_only = true;
        assert_eq!(builder.get_pool(&mut tunnel).await.unwrap().kind(), "tunnel");

        let mut ws = exchange(
            b"GET /ws HTTP/1.1\r\nHost: example.com\r\nUpgrade: websocket\r\nConnection: Upgrade\r\n\r\n",
            authority,
        );
        assert_eq!(builder.get_pool(&mut ws).await.unwrap().kind(), "websocket");
        assert!(builder.registry().is_empty());
        assert_eq!(builder.pools_created(), 2);
    }

    #[tokio::test]
    async fn test_remove_if_only_removes_same_instance() {
        let builder = builder();
        let authority = Authority::new("example.com", 80, false);
        let mut ex = exchange(b"GET / HTTP/1.1\r\nHost: example.com\r\n\r\n", authority.clone());
        let pool = builder.get_pool(&mut ex).await.unwrap();

        let stranger = Arc::new(ConnectionPool::TunnelOnly(TunnelOnlyConnectionPool::new(
            authority.clone(),
            builder.connections.clone(),
        )));
        assert!(!builder
            .registry()
            .remove_if(&authority, &Arc::downgrade(&stranger)));
        assert!(builder
            .registry()
            .remove_if(&authority, &Arc::downgrade(&pool)));
        assert!(builder.registry().is_empty());
    }

    #[tokio::test]
    async fn test_creation_gates_are_released() {
        let builder = Arc::new(builder());
        let mut tasks = Vec::new();
        for id in 0..16u16 {
            let builder = builder.clone();
            tasks.push(tokio::spawn(async move {
                let host = format!("host{}.test", id % 4);
                let raw = format!("GET / HTTP/1.1\r\nHost: {}\r\n\r\n", host);
                let mut ex = exchange(raw.as_bytes(), Authority::new(&host, 80, false));
                builder.get_pool(&mut ex).await.unwrap();
            }));
        }
        for task in tasks {
            task.await.unwrap();
        }
        assert_eq!(builder.registry().len(), 4);
        assert_eq!(builder.gate_count(), 0);

        // Failed creation releases its gate too
        let mut refused = exchange(
            b"GET / HTTP/1.1\r\nHost: 127.0.0.1:1\r\n\r\n",
            Authority::new("127.0.0.1", 1, true),
        );
        assert!(builder.get_pool(&mut refused).await.is_err());
        assert_eq!(builder.gate_count(), 0);
    }
}
