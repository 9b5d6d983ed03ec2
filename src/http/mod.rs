//! HTTP/1.1 wire handling
//!
//! - `header`: request/response header model and serialization
//! - `detect`: double-CRLF header block detection
//! - `body`: content-length and chunked framing, metrics-instrumented bodies
//! - `h11`: request forwarding and response framing on one HTTP/1.1 connection
//! - `responses`: canned and proxy-generated responses

pub mod body;
pub mod detect;
pub mod h11;
pub mod header;
pub mod responses;

pub use body::Body;
pub use header::{HeaderField, RequestHeader, ResponseHeader};
