//! Fluxgate - Intercepting HTTP proxy
//!
//! Fluxgate is a man-in-the-middle HTTP proxy that accepts plaintext and CONNECT
//! traffic, optionally decrypts it with a per-host leaf certificate, and forwards
//! every request/response pair ("exchange") to the remote through pooled
//! connections while a rule engine rewrites headers, routing and TLS behavior.
//!
//! ## Features
//!
//! - **HTTP/1.1 & HTTP/2 upstream**: ALPN negotiation once per authority, then a
//!   dedicated pool per protocol
//! - **TLS interception**: leaf certificates signed by a configurable CA
//! - **Blind tunnels**: CONNECT pass-through when a rule skips decryption
//! - **WebSocket**: upgrade forwarding with bidirectional splicing
//! - **Rule engine**: filters and actions evaluated at fixed lifecycle scopes
//! - **Metrics**: per-exchange timestamps and Prometheus counters
//!
//! ## Usage
//!
//! ```rust,no_run
//! use fluxgate::{Proxy, ProxyRuntimeBuilder, ProxySettings};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let runtime = ProxyRuntimeBuilder::new(ProxySettings::default()).build()?;
//!     let mut proxy = Proxy::new(runtime);
//!     let endpoints = proxy.start().await?;
//!     println!("listening on {:?}", endpoints);
//!     proxy.shutdown().await;
//!     Ok(())
//! }
//! ```
//!
//! ## Architecture
//!
//! - `exchange` - exchange model, context, metrics and the downstream builder
//! - `http` - header model, header-block detection, body framing, HTTP/1.1 engine
//! - `pool` - authority to pool registry and the pool implementations
//! - `establish` - DNS, TCP and TLS connection establishment
//! - `rules` - filters, actions and the rule engine
//! - `proxy` - listener, accept loop and per-connection processing

// Core model
pub mod authority;
pub mod connection;
pub mod error;
pub mod exchange;
pub mod stream;

// Protocol handling
pub mod http;

// Upstream side
pub mod establish;
pub mod pool;

// Interception
pub mod certificate;
pub mod rules;

// Runtime & configuration
pub mod archive;
pub mod config;
pub mod proxy;
pub mod runtime;

// Metrics
pub mod proxy_metrics;

// Re-export commonly used types

/// Core model
pub use authority::Authority;
pub use connection::{Connection, HttpVersion, SslInfo};
pub use error::{ErrorSide, ExchangeError, ProxyError, RuleExecutionFailure};
pub use exchange::{
    CompletionState, Exchange, ExchangeCompletion, ExchangeContext, ExchangeMetrics,
    HeaderAlteration, PreMadeResponse,
};

/// Configuration and runtime
pub use config::ProxySettings;
pub use runtime::{ProxyRuntimeBuilder, ProxyRuntimeContext};

/// Proxy entry point
pub use proxy::Proxy;

/// Rule engine
pub use rules::{Action, Filter, FilterScope, Rule, RuleEngine};

/// Collaborator interfaces
pub use archive::{ArchiveUpdate, ArchiveWriter, ChannelArchiveWriter, NoArchiveWriter};
pub use certificate::{CertificateAuthority, CertificateProvider, LeafCertificate};
pub use establish::{DnsSolver, TcpConnectionProvider};

/// Version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
pub const NAME: &str = env!("CARGO_PKG_NAME");
