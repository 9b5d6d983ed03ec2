//! Responses produced by the proxy itself

use crate::error::ProxyError;
use crate::exchange::PreMadeResponse;

/// Reply to an accepted CONNECT, written before any TLS handshake
pub const CONNECT_ESTABLISHED: &[u8] =
    b"HTTP/1.1 200 OK\r\nContent-length: 0\r\nConnection: keep-alive\r\n\r\n";

/// Response sent when `error` prevents the exchange from getting a remote response
pub fn error_response(error: &ProxyError, transport_status: u16, exchange_id: u64) -> PreMadeResponse {
    let status = error.status_code(transport_status);
    let body = format!(
        "fluxgate could not complete exchange {}: {}\r\n",
        exchange_id, error
    );
    PreMadeResponse::new(status, "text/plain; charset=utf-8", body)
        .with_header("X-Fluxgate-Error", error.kind())
        .with_header("Connection", "close")
}

/// Response to a request that could not be parsed
pub fn bad_request(error: &ProxyError) -> PreMadeResponse {
    PreMadeResponse::new(400, "text/plain; charset=utf-8", format!("{}\r\n", error))
        .with_header("Connection", "close")
}
