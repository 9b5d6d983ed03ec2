//! Proxy error types
//!
//! Three families are kept apart so callers can react differently:
//! - [`ExchangeError`]: framing problems, tagged with the side that sent the bad bytes
//! - [`ProxyError`]: everything that can abort an exchange or a connection
//! - [`RuleExecutionFailure`]: rule configuration and action failures

use serde::Serialize;
use std::fmt;
use std::io;
use std::net::SocketAddr;
use thiserror::Error;

/// Result type for proxy operations
pub type Result<T> = std::result::Result<T, ProxyError>;

/// Which peer produced the offending input
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum ErrorSide {
    /// Downstream client
    Client,
    /// Upstream remote server
    Remote,
}

impl fmt::Display for ErrorSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Client => write!(f, "client"),
            Self::Remote => write!(f, "remote"),
        }
    }
}

/// HTTP framing errors
#[derive(Debug, Error)]
pub enum ExchangeError {
    /// No double CRLF within the header buffer
    #[error("{side} header block exceeds {limit} bytes")]
    HeaderTooLarge { side: ErrorSide, limit: usize },

    /// Stream ended in the middle of a header block
    #[error("{side} closed the stream inside a header block")]
    TruncatedHeader { side: ErrorSide },

    /// Request line could not be parsed
    #[error("malformed request line: {0}")]
    MalformedRequest(String),

    /// Status line could not be parsed
    #[error("malformed status line: {0}")]
    MalformedResponse(String),

    /// Header field could not be parsed or converted
    #[error("invalid {side} header: {detail}")]
    InvalidHeader { side: ErrorSide, detail: String },

    /// Several Content-Length fields disagree
    #[error("{side} sent conflicting Content-Length values")]
    ConflictingContentLength { side: ErrorSide },

    /// Content-Length together with chunked Transfer-Encoding
    #[error("{side} sent both Content-Length and chunked Transfer-Encoding")]
    AmbiguousFraming { side: ErrorSide },
}

impl ExchangeError {
    /// Side that produced the faulty input
    pub fn side(&self) -> ErrorSide {
        match self {
            Self::HeaderTooLarge { side, .. }
            | Self::TruncatedHeader { side }
            | Self::InvalidHeader { side, .. }
            | Self::ConflictingContentLength { side }
            | Self::AmbiguousFraming { side } => *side,
            Self::MalformedRequest(_) => ErrorSide::Client,
            Self::MalformedResponse(_) => ErrorSide::Remote,
        }
    }
}

/// Rule configuration or action failure
#[derive(Debug, Error)]
pub enum RuleExecutionFailure {
    #[error("invalid pattern `{pattern}`: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid forward destination `{0}`")]
    InvalidDestination(String),

    #[error("client certificate error: {0}")]
    ClientCertificate(String),

    #[error("action {action} failed: {reason}")]
    ActionFailed {
        action: &'static str,
        reason: String,
    },

    #[error("failed to read rule file: {0}")]
    Read(String),

    #[error("failed to parse rule file: {0}")]
    Parse(String),
}

impl RuleExecutionFailure {
    pub fn action(action: &'static str, reason: impl Into<String>) -> Self {
        Self::ActionFailed {
            action,
            reason: reason.into(),
        }
    }
}

/// Errors that abort an exchange, a connection or the proxy startup
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error(transparent)]
    Exchange(#[from] ExchangeError),

    #[error("remote closed the connection before sending a response header")]
    ConnectionClosed,

    #[error("DNS resolution failed for {host}: {reason}")]
    Dns { host: String, reason: String },

    #[error("TCP connection to {addr} failed: {source}")]
    Connect {
        addr: SocketAddr,
        #[source]
        source: io::Error,
    },

    #[error("TLS handshake with {host} failed: {reason}")]
    Tls { host: String, reason: String },

    /// Read or write failure on the client side
    #[error("client I/O error: {0}")]
    Downstream(#[source] io::Error),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    #[error("certificate error: {0}")]
    Certificate(String),

    #[error(transparent)]
    Rule(#[from] RuleExecutionFailure),

    #[error("HTTP/2 error: {0}")]
    Http2(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("operation cancelled")]
    Cancelled,
}

impl ProxyError {
    pub fn tls(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Tls {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    pub fn dns(host: impl Into<String>, reason: impl ToString) -> Self {
        Self::Dns {
            host: host.into(),
            reason: reason.to_string(),
        }
    }

    /// True when the fault originates from the downstream client
    pub fn is_client_error(&self) -> bool {
        match self {
            Self::Downstream(_) => true,
            Self::Exchange(e) => e.side() == ErrorSide::Client,
            _ => false,
        }
    }

    /// Cancellation is not a fault and must not be logged as one
    pub fn is_cancellation(&self) -> bool {
        matches!(self, Self::Cancelled)
    }

    /// Status code the proxy answers with when this error prevents a response.
    ///
    /// `transport_status` is the configured status for transport failures (502 or 528).
    pub fn status_code(&self, transport_status: u16) -> u16 {
        match self {
            Self::Exchange(e) if e.side() == ErrorSide::Client => 400,
            Self::Downstream(_) => 400,
            Self::Exchange(_) => 502,
            _ => transport_status,
        }
    }

    /// Short machine-readable label used in metrics and archive records
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Exchange(_) => "framing",
            Self::ConnectionClosed => "connection_closed",
            Self::Dns { .. } => "dns",
            Self::Connect { .. } => "connect",
            Self::Tls { .. } => "tls",
            Self::Downstream(_) => "downstream",
            Self::Io(_) => "io",
            Self::Certificate(_) => "certificate",
            Self::Rule(_) => "rule",
            Self::Http2(_) => "http2",
            Self::Config(_) => "config",
            Self::Cancelled => "cancelled",
        }
    }
}

impl From<h2::Error> for ProxyError {
    fn from(e: h2::Error) -> Self {
        Self::Http2(e.to_string())
    }
}

/// Error entry stored on an exchange
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ExchangeErrorRecord {
    pub kind: String,
    pub message: String,
}

impl From<&ProxyError> for ExchangeErrorRecord {
    fn from(e: &ProxyError) -> Self {
        Self {
            kind: e.kind().to_string(),
            message: e.to_string(),
        }
    }
}
