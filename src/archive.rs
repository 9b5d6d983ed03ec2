//! Archive sink for exchanges and connections
//!
//! The proxy emits snapshots at fixed points; writers must never block the
//! exchange path. [`ChannelArchiveWriter`] enqueues into a bounded channel and
//! drops events when the consumer falls behind.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::fmt;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use tokio::sync::mpsc;
use tracing::warn;

use crate::connection::{Connection, ConnectionInfo};
use crate::error::ExchangeErrorRecord;
use crate::exchange::{Exchange, ExchangeMetrics};
use crate::http::header::HeaderField;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum UpdateType {
    BeforeRequestHeader,
    AfterResponseHeader,
    AfterResponse,
}

/// Serializable view of an exchange at one point of its lifecycle
#[derive(Debug, Clone, Serialize)]
pub struct ExchangeSnapshot {
    pub id: u64,
    pub authority: String,
    pub secure: bool,
    pub method: String,
    pub path: String,
    pub request_headers: Vec<HeaderField>,
    pub status: Option<u16>,
    pub response_headers: Option<Vec<HeaderField>>,
    pub connection_id: Option<u64>,
    pub metrics: ExchangeMetrics,
    pub errors: Vec<ExchangeErrorRecord>,
    pub client_errors: Vec<ExchangeErrorRecord>,
    pub tags: Vec<String>,
    pub comment: Option<String>,
    pub tunneled_only: bool,
    pub captured_at: DateTime<Utc>,
}

impl ExchangeSnapshot {
    pub fn capture(exchange: &Exchange) -> Self {
        Self {
            id: exchange.id,
            authority: exchange.authority.to_string(),
            secure: exchange.authority.secure(),
            method: exchange.request.header.method().to_string(),
            path: exchange.request.header.path().to_string(),
            request_headers: exchange.request.header.fields().to_vec(),
            status: exchange.status_code(),
            response_headers: exchange
                .response
                .as_ref()
                .map(|r| r.header.fields().to_vec()),
            connection_id: exchange.connection.as_ref().map(|c| c.id),
            metrics: exchange.metrics.snapshot(),
            errors: exchange.errors.clone(),
            client_errors: exchange.client_errors.clone(),
            tags: exchange.tags.clone(),
            comment: exchange.comment.clone(),
            tunneled_only: exchange.tunneled_only,
            captured_at: Utc::now(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ArchiveUpdate {
    Exchange {
        update: UpdateType,
        exchange: Box<ExchangeSnapshot>,
    },
    Connection {
        connection: ConnectionInfo,
    },
}

impl ArchiveUpdate {
    pub fn exchange(update: UpdateType, exchange: &Exchange) -> Self {
        Self::Exchange {
            update,
            exchange: Box::new(ExchangeSnapshot::capture(exchange)),
        }
    }

    pub fn connection(connection: &Connection) -> Self {
        Self::Connection {
            connection: connection.info(),
        }
    }
}

pub type ExchangeLimitCallback = Box<dyn Fn() + Send + Sync>;

/// Fire-and-forget persistence sink
pub trait ArchiveWriter: Send + Sync {
    fn update(&self, update: ArchiveUpdate);

    /// Invoke `on_reached` once `max` exchanges have completed
    fn register_exchange_limit(&self, max: usize, on_reached: ExchangeLimitCallback);
}

/// Counts completed exchanges against an optional limit
#[derive(Default)]
struct ExchangeLimit {
    completed: AtomicUsize,
    limit: Mutex<Option<(usize, ExchangeLimitCallback)>>,
}

impl ExchangeLimit {
    fn register(&self, max: usize, on_reached: ExchangeLimitCallback) {
        let mut guard = self.limit.lock().unwrap_or_else(|e| e.into_inner());
        *guard = Some((max, on_reached));
    }

    fn observe(&self, update: &ArchiveUpdate) {
        if !matches!(
            update,
            ArchiveUpdate::Exchange {
                update: UpdateType::AfterResponse,
                ..
            }
        ) {
            return;
        }
        let completed = self.completed.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = self.limit.lock().unwrap_or_else(|e| e.into_inner());
        if let Some((max, on_reached)) = guard.as_ref() {
            if completed == *max {
                on_reached();
            }
        }
    }
}

/// Discards every event but still honors the exchange limit
#[derive(Default)]
pub struct NoArchiveWriter {
    limit: ExchangeLimit,
}

impl NoArchiveWriter {
    pub fn new() -> Self {
        Self::default()
    }
}

impl fmt::Debug for NoArchiveWriter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("NoArchiveWriter").finish()
    }
}

impl ArchiveWriter for NoArchiveWriter {
    fn update(&self, update: ArchiveUpdate) {
        self.limit.observe(&update);
    }

    fn register_exchange_limit(&self, max: usize, on_reached: ExchangeLimitCallback) {
        self.limit.register(max, on_reached);
    }
}

/// Bounded channel writer. The receiver is handed to whatever persists events.
pub struct ChannelArchiveWriter {
    sender: mpsc::Sender<ArchiveUpdate>,
    limit: ExchangeLimit,
}

impl ChannelArchiveWriter {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<ArchiveUpdate>) {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        (
            Self {
                sender,
                limit: ExchangeLimit::default(),
            },
            receiver,
        )
    }
}

impl ArchiveWriter for ChannelArchiveWriter {
    fn update(&self, update: ArchiveUpdate) {
        self.limit.observe(&update);
        match self.sender.try_send(update) {
            Ok(()) => {}
            Err(mpsc::error::TrySendError::Full(_)) => {
                crate::proxy_metrics::ARCHIVE_EVENTS_DROPPED.inc();
                warn!("Archive queue full, event dropped");
            }
            // Consumer gone; nothing left to persist to
            Err(mpsc::error::TrySendError::Closed(_)) => {}
        }
    }

    fn register_exchange_limit(&self, max: usize, on_reached: ExchangeLimitCallback) {
        self.limit.register(max, on_reached);
    }
}
