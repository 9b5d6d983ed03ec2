//! Upstream connection metadata
//!
//! A [`Connection`] describes an established remote connection. It is shared
//! (`Arc`) between the pool that owns the I/O halves and every exchange that
//! travels over it.

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};

use crate::authority::Authority;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum HttpVersion {
    /// Plaintext or blind tunnel: no ALPN happened, HTTP/1.1 is assumed
    Unknown,
    Http11,
    Http2,
}

/// Negotiated TLS parameters
#[derive(Debug, Clone, Default, Serialize)]
pub struct SslInfo {
    pub protocol_version: Option<String>,
    pub cipher_suite: Option<String>,
    pub negotiated_application_protocol: Option<String>,
    pub remote_certificate_der_length: Option<usize>,
    pub client_certificate_sent: bool,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ConnectionTimings {
    pub dns_solve_start: Option<DateTime<Utc>>,
    pub dns_solve_end: Option<DateTime<Utc>>,
    pub tcp_connection_opening: Option<DateTime<Utc>>,
    pub tcp_connection_opened: Option<DateTime<Utc>>,
    pub ssl_negotiation_start: Option<DateTime<Utc>>,
    pub ssl_negotiation_end: Option<DateTime<Utc>>,
}

#[derive(Debug)]
pub struct Connection {
    pub id: u64,
    pub authority: Authority,
    pub http_version: HttpVersion,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub ssl_info: Option<SslInfo>,
    pub timings: ConnectionTimings,
    request_processed: AtomicU64,
}

/// Serializable snapshot of a [`Connection`]
#[derive(Debug, Clone, Serialize)]
pub struct ConnectionInfo {
    pub id: u64,
    pub authority: String,
    pub secure: bool,
    pub http_version: HttpVersion,
    pub local_address: Option<SocketAddr>,
    pub remote_address: Option<SocketAddr>,
    pub ssl_info: Option<SslInfo>,
    pub timings: ConnectionTimings,
    pub request_processed: u64,
}

impl Connection {
    pub fn new(id: u64, authority: Authority, http_version: HttpVersion) -> Self {
        Self {
            id,
            authority,
            http_version,
            local_address: None,
            remote_address: None,
            ssl_info: None,
            timings: ConnectionTimings::default(),
            request_processed: AtomicU64::new(0),
        }
    }

    /// Count one more exchange carried by this connection, returns the new total
    pub fn increment_requests(&self) -> u64 {
        self.request_processed.fetch_add(1, Ordering::Relaxed) + 1
    }

    pub fn request_processed(&self) -> u64 {
        self.request_processed.load(Ordering::Relaxed)
    }

    pub fn info(&self) -> ConnectionInfo {
        ConnectionInfo {
            id: self.id,
            authority: self.authority.to_string(),
            secure: self.authority.secure(),
            http_version: self.http_version,
            local_address: self.local_address,
            remote_address: self.remote_address,
            ssl_info: self.ssl_info.clone(),
            timings: self.timings.clone(),
            request_processed: self.request_processed(),
        }
    }
}
