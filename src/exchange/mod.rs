//! Exchange model
//!
//! An exchange is one request/response pair flowing through the proxy, with
//! its context, metrics and completion signal.

pub mod builder;
pub mod completion;
pub mod context;
pub mod metrics;

pub use completion::{CompletionState, ExchangeCompletion};
pub use context::{
    AlpnProtocol, ClientCertificate, ExchangeContext, HeaderAlteration, PreMadeResponse,
};
pub use metrics::{ExchangeMetrics, SharedMetrics};

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use crate::authority::Authority;
use crate::connection::Connection;
use crate::error::{ExchangeErrorRecord, ProxyError};
use crate::http::body::Body;
use crate::http::header::{RequestHeader, ResponseHeader};
use crate::stream::UpgradedLink;

/// Monotonic identifier source for exchanges and connections
#[derive(Debug, Default)]
pub struct IdGenerator(AtomicU64);

impl IdGenerator {
    pub fn new() -> Self {
        Self(AtomicU64::new(0))
    }

    /// Next identifier, starting at 1
    pub fn next(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}

#[derive(Debug)]
pub struct Request {
    pub header: RequestHeader,
    pub body: Body,
}

impl Request {
    pub fn new(header: RequestHeader, body: Body) -> Self {
        Self { header, body }
    }

    /// Move the body out, leaving the empty sentinel
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

#[derive(Debug)]
pub struct Response {
    pub header: ResponseHeader,
    pub body: Body,
}

impl Response {
    pub fn take_body(&mut self) -> Body {
        std::mem::take(&mut self.body)
    }
}

pub struct Exchange {
    pub id: u64,
    /// Target of the request; rewritable by forwarding rules
    pub authority: Authority,
    pub context: ExchangeContext,
    pub request: Request,
    /// Set once the response header has been parsed
    pub response: Option<Response>,
    pub metrics: SharedMetrics,
    /// Upstream connection that carried the exchange
    pub connection: Option<Arc<Connection>>,
    pub errors: Vec<ExchangeErrorRecord>,
    pub client_errors: Vec<ExchangeErrorRecord>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    /// Exchange stands for a blind tunnel rather than a decrypted request
    pub tunneled_only: bool,
    /// Raw remote streams after a tunnel connect or WebSocket upgrade
    pub upgrade: Option<UpgradedLink>,
    completion: ExchangeCompletion,
}

impl std::fmt::Debug for Exchange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Exchange")
            .field("id", &self.id)
            .field("authority", &self.authority)
            .field("method", &self.request.header.method())
            .field("path", &self.request.header.path())
            .field("tunneled_only", &self.tunneled_only)
            .finish()
    }
}

impl Exchange {
    pub fn new(id: u64, authority: Authority, context: ExchangeContext, request: Request) -> Self {
        let metrics = SharedMetrics::new();
        metrics.stamp(|m| &mut m.received_from_proxy);
        Self {
            id,
            authority,
            context,
            request,
            response: None,
            metrics,
            connection: None,
            errors: Vec::new(),
            client_errors: Vec::new(),
            tags: Vec::new(),
            comment: None,
            tunneled_only: false,
            upgrade: None,
            completion: ExchangeCompletion::new(),
        }
    }

    /// Handle on the completion signal
    pub fn completion(&self) -> ExchangeCompletion {
        self.completion.clone()
    }

    pub fn is_websocket(&self) -> bool {
        self.request.header.is_websocket_request()
    }

    pub fn status_code(&self) -> Option<u16> {
        self.response.as_ref().map(|r| r.header.status_code())
    }

    /// Record an error on the side it belongs to and stamp the error time
    pub fn record_error(&mut self, error: &ProxyError) {
        self.metrics.stamp(|m| &mut m.error_instant);
        let record = ExchangeErrorRecord::from(error);
        if error.is_client_error() {
            self.client_errors.push(record);
        } else {
            self.errors.push(record);
        }
    }
}
