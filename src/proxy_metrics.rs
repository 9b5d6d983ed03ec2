// Proxy metrics module
// Prometheus counters for exchanges, pools and upstream connections

use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, register_int_gauge,
    Encoder, HistogramVec, IntCounter, IntCounterVec, IntGauge, TextEncoder,
};
use std::time::Duration;

lazy_static::lazy_static! {
    // Exchange counters
    pub static ref EXCHANGES_TOTAL: IntCounterVec = register_int_counter_vec!(
        "fluxgate_exchanges_total",
        "Total number of exchanges by outcome",
        &["outcome"]
    ).unwrap();

    pub static ref EXCHANGE_ERRORS: IntCounterVec = register_int_counter_vec!(
        "fluxgate_exchange_errors_total",
        "Total number of exchange errors by kind",
        &["kind"]
    ).unwrap();

    pub static ref EXCHANGE_DURATION: HistogramVec = register_histogram_vec!(
        "fluxgate_exchange_duration_seconds",
        "Exchange duration from reception to end of response",
        &["status"],
        vec![0.01, 0.05, 0.1, 0.5, 1.0, 2.0, 5.0, 10.0, 30.0]
    ).unwrap();

    // Pool metrics
    pub static ref POOLS_CREATED: IntCounterVec = register_int_counter_vec!(
        "fluxgate_pools_created_total",
        "Total number of connection pools created by kind",
        &["kind"]
    ).unwrap();

    // Upstream connection metrics
    pub static ref UPSTREAM_CONNECTIONS: IntCounterVec = register_int_counter_vec!(
        "fluxgate_upstream_connections_total",
        "Upstream connections opened, reused and discarded",
        &["event"]
    ).unwrap();

    // TLS handshake metrics
    pub static ref TLS_HANDSHAKE_DURATION: HistogramVec = register_histogram_vec!(
        "fluxgate_tls_handshake_duration_seconds",
        "Upstream TLS handshake duration in seconds",
        &["result"],
        vec![0.001, 0.005, 0.01, 0.05, 0.1, 0.5, 1.0, 5.0]
    ).unwrap();

    pub static ref CERTIFICATES_GENERATED: IntCounter = register_int_counter!(
        "fluxgate_certificates_generated_total",
        "Leaf certificates generated for interception"
    ).unwrap();

    // Client side
    pub static ref ACTIVE_CLIENT_CONNECTIONS: IntGauge = register_int_gauge!(
        "fluxgate_active_client_connections",
        "Client connections currently being served"
    ).unwrap();

    pub static ref ARCHIVE_EVENTS_DROPPED: IntCounter = register_int_counter!(
        "fluxgate_archive_events_dropped_total",
        "Archive events dropped because the queue was full"
    ).unwrap();
}

/// Record a finished exchange
pub fn record_exchange(outcome: &str, status: Option<u16>, duration: Duration) {
    EXCHANGES_TOTAL.with_label_values(&[outcome]).inc();
    let status = status.map(|s| s.to_string()).unwrap_or_else(|| "none".to_string());
    EXCHANGE_DURATION
        .with_label_values(&[&status])
        .observe(duration.as_secs_f64());
}

pub fn record_exchange_error(kind: &str) {
    EXCHANGE_ERRORS.with_label_values(&[kind]).inc();
}

pub fn record_pool_created(kind: &str) {
    POOLS_CREATED.with_label_values(&[kind]).inc();
}

/// `event` is one of opened, reused, evicted, discarded
pub fn record_upstream_connection(event: &str) {
    UPSTREAM_CONNECTIONS.with_label_values(&[event]).inc();
}

pub fn observe_tls_handshake(result: &str, duration: Duration) {
    TLS_HANDSHAKE_DURATION
        .with_label_values(&[result])
        .observe(duration.as_secs_f64());
}

/// Prometheus text exposition of every registered metric
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let mut buffer = Vec::new();
    if encoder.encode(&prometheus::gather(), &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_counters_render() {
        record_pool_created("http11");
        record_upstream_connection("opened");
        record_exchange("success", Some(200), Duration::from_millis(5));

        let text = render();
        assert!(text.contains("fluxgate_pools_created_total"));
        assert!(text.contains("fluxgate_upstream_connections_total"));
        assert!(text.contains("fluxgate_exchanges_total"));
    }
}
