//! Exchange timing and byte counters

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex};

/// Timestamps are set at most once per phase; `None` means the phase never happened
#[derive(Debug, Clone, Default, Serialize)]
pub struct ExchangeMetrics {
    pub received_from_proxy: Option<DateTime<Utc>>,
    pub create_cert_start: Option<DateTime<Utc>>,
    pub create_cert_end: Option<DateTime<Utc>>,
    pub retrieving_pool: Option<DateTime<Utc>>,
    pub dns_solve_start: Option<DateTime<Utc>>,
    pub dns_solve_end: Option<DateTime<Utc>>,
    pub tcp_connection_opening: Option<DateTime<Utc>>,
    pub tcp_connection_opened: Option<DateTime<Utc>>,
    pub ssl_negotiation_start: Option<DateTime<Utc>>,
    pub ssl_negotiation_end: Option<DateTime<Utc>>,
    pub request_header_sending: Option<DateTime<Utc>>,
    pub request_header_sent: Option<DateTime<Utc>>,
    pub request_body_sent: Option<DateTime<Utc>>,
    pub response_header_start: Option<DateTime<Utc>>,
    pub response_header_end: Option<DateTime<Utc>>,
    pub response_body_start: Option<DateTime<Utc>>,
    pub response_body_end: Option<DateTime<Utc>>,
    pub remote_closed: Option<DateTime<Utc>>,
    pub error_instant: Option<DateTime<Utc>>,

    pub reused_connection: bool,
    pub total_sent: u64,
    pub total_received: u64,
    pub request_header_length: usize,
    pub response_header_length: usize,

    pub downstream_client_address: Option<SocketAddr>,
    pub downstream_local_address: Option<SocketAddr>,
}

/// Metrics shared between the exchange and the body streams that complete it
#[derive(Debug, Clone, Default)]
pub struct SharedMetrics(Arc<Mutex<ExchangeMetrics>>);

impl SharedMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn update<F: FnOnce(&mut ExchangeMetrics)>(&self, f: F) {
        let mut guard = self.0.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Stamp a timestamp field with the current time
    pub fn stamp(&self, field: fn(&mut ExchangeMetrics) -> &mut Option<DateTime<Utc>>) {
        self.update(|m| *field(m) = Some(Utc::now()));
    }

    pub fn snapshot(&self) -> ExchangeMetrics {
        self.0.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}
