//! Header model
//!
//! Request and response headers keep their fields in wire order. Pseudo-header
//! fields (`:method`, `:path`, `:authority`, `:scheme`, `:status`) are
//! synthesized at parse time so HTTP/1.1 and HTTP/2 messages share one
//! representation; they are never emitted on an HTTP/1.1 wire.

use bytes::{BufMut, BytesMut};
use serde::Serialize;

use crate::authority::{split_host_port, Authority};
use crate::error::{ErrorSide, ExchangeError};
use crate::exchange::HeaderAlteration;

/// Upper bound on header fields accepted in one block
pub const MAX_HEADERS: usize = 256;

/// Connection-scoped headers dropped when forwarding over HTTP/1.1
pub const NON_FORWARDABLE: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "proxy-authenticate",
    "te",
    "trailer",
    "upgrade",
];

/// Headers that have no meaning on an HTTP/2 stream
pub const HTTP2_FORBIDDEN: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-connection",
    "proxy-authorization",
    "transfer-encoding",
    "upgrade",
    "te",
    "host",
];

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

impl HeaderField {
    pub fn new(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn is_pseudo(&self) -> bool {
        self.name.starts_with(':')
    }

    pub fn is(&self, name: &str) -> bool {
        self.name.eq_ignore_ascii_case(name)
    }
}

fn find<'a>(fields: &'a [HeaderField], name: &str) -> Option<&'a str> {
    fields.iter().find(|f| f.is(name)).map(|f| f.value.as_str())
}

fn set_field(fields: &mut Vec<HeaderField>, name: &str, value: String) {
    match fields.iter_mut().find(|f| f.is(name)) {
        Some(field) => field.value = value,
        None => fields.push(HeaderField::new(name, value)),
    }
}

/// Tokens of a comma separated header such as `Connection`
fn has_token(fields: &[HeaderField], name: &str, token: &str) -> bool {
    fields
        .iter()
        .filter(|f| f.is(name))
        .flat_map(|f| f.value.split(','))
        .any(|t| t.trim().eq_ignore_ascii_case(token))
}

fn is_chunked(fields: &[HeaderField]) -> bool {
    fields
        .iter()
        .filter(|f| f.is("transfer-encoding"))
        .flat_map(|f| f.value.split(','))
        .last()
        .map(|t| t.trim().eq_ignore_ascii_case("chunked"))
        .unwrap_or(false)
}

/// Resolve Content-Length: identical repeats are accepted, differing values rejected
fn parse_content_length(fields: &[HeaderField], side: ErrorSide) -> Result<i64, ExchangeError> {
    let mut length: Option<i64> = None;
    for field in fields.iter().filter(|f| f.is("content-length")) {
        for part in field.value.split(',') {
            let value = part.trim().parse::<i64>().map_err(|_| ExchangeError::InvalidHeader {
                side,
                detail: format!("Content-Length `{}`", field.value),
            })?;
            if value < 0 {
                return Err(ExchangeError::InvalidHeader {
                    side,
                    detail: format!("negative Content-Length `{}`", field.value),
                });
            }
            match length {
                Some(existing) if existing != value => {
                    return Err(ExchangeError::ConflictingContentLength { side });
                }
                _ => length = Some(value),
            }
        }
    }
    Ok(length.unwrap_or(-1))
}

/// Body length of a header block; a transfer-coded body must not also carry a length
fn body_framing(fields: &[HeaderField], side: ErrorSide) -> Result<i64, ExchangeError> {
    if find(fields, "transfer-encoding").is_some() && find(fields, "content-length").is_some() {
        return Err(ExchangeError::AmbiguousFraming { side });
    }
    parse_content_length(fields, side)
}

fn convert_fields(
    raw: &[httparse::Header<'_>],
    side: ErrorSide,
) -> Result<Vec<HeaderField>, ExchangeError> {
    raw.iter()
        .map(|h| {
            let value = std::str::from_utf8(h.value).map_err(|_| ExchangeError::InvalidHeader {
                side,
                detail: format!("non UTF-8 value for {}", h.name),
            })?;
            Ok(HeaderField::new(h.name, value.trim()))
        })
        .collect()
}

/// Replay alterations over a field list
pub fn apply_alterations(
    fields: &[HeaderField],
    alterations: &[HeaderAlteration],
) -> Vec<HeaderField> {
    let mut result = fields.to_vec();
    for alteration in alterations {
        alteration.apply(&mut result);
    }
    result
}

fn write_fields(
    fields: &[HeaderField],
    skip_non_forwardable: bool,
    buf: &mut BytesMut,
) {
    for field in fields {
        if field.is_pseudo() {
            continue;
        }
        if skip_non_forwardable && NON_FORWARDABLE.iter().any(|n| field.is(n)) {
            continue;
        }
        buf.put_slice(field.name.as_bytes());
        buf.put_slice(b": ");
        buf.put_slice(field.value.as_bytes());
        buf.put_slice(b"\r\n");
    }
    buf.put_slice(b"\r\n");
}

/// Parsed request header
#[derive(Debug, Clone, Serialize)]
pub struct RequestHeader {
    fields: Vec<HeaderField>,
    version: String,
    content_length: i64,
    raw_length: usize,
}

impl RequestHeader {
    /// Parse an HTTP/1.x request header block.
    ///
    /// `secure` sets `:scheme` for origin-form targets; `default_authority` is
    /// used when the request has neither an absolute target nor a Host header.
    pub fn parse(
        block: &[u8],
        secure: bool,
        default_authority: Option<&Authority>,
    ) -> Result<Self, ExchangeError> {
        let mut raw = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut request = httparse::Request::new(&mut raw);
        match request.parse(block) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ExchangeError::TruncatedHeader {
                    side: ErrorSide::Client,
                })
            }
            Err(e) => return Err(ExchangeError::MalformedRequest(e.to_string())),
        }

        let method = request
            .method
            .ok_or_else(|| ExchangeError::MalformedRequest("missing method".into()))?
            .to_string();
        let target = request
            .path
            .ok_or_else(|| ExchangeError::MalformedRequest("missing target".into()))?
            .to_string();
        let version = match request.version {
            Some(0) => "HTTP/1.0",
            _ => "HTTP/1.1",
        }
        .to_string();
        let fields = convert_fields(request.headers, ErrorSide::Client)?;

        let (authority, scheme, path) = if method.eq_ignore_ascii_case("CONNECT") {
            (target.clone(), "https".to_string(), target.clone())
        } else if target.starts_with('/') || target == "*" {
            let authority = find(&fields, "host")
                .map(str::to_string)
                .or_else(|| default_authority.map(|a| a.host_header()))
                .unwrap_or_default();
            let scheme = if secure { "https" } else { "http" };
            (authority, scheme.to_string(), target.clone())
        } else {
            let url = url::Url::parse(&target)
                .map_err(|e| ExchangeError::MalformedRequest(format!("{}: {}", target, e)))?;
            let host = url
                .host_str()
                .ok_or_else(|| ExchangeError::MalformedRequest(format!("no host in {}", target)))?;
            let authority = match url.port() {
                Some(port) => format!("{}:{}", host, port),
                None => host.to_string(),
            };
            let mut path = url.path().to_string();
            if let Some(query) = url.query() {
                path.push('?');
                path.push_str(query);
            }
            (authority, url.scheme().to_string(), path)
        };

        let mut all = Vec::with_capacity(fields.len() + 4);
        all.push(HeaderField::new(":method", method));
        all.push(HeaderField::new(":path", path));
        all.push(HeaderField::new(":authority", authority));
        all.push(HeaderField::new(":scheme", scheme));
        all.extend(fields);

        let content_length = body_framing(&all, ErrorSide::Client)?;

        Ok(Self {
            fields: all,
            version,
            content_length,
            raw_length: block.len(),
        })
    }

    pub fn method(&self) -> &str {
        find(&self.fields, ":method").unwrap_or("GET")
    }

    pub fn path(&self) -> &str {
        find(&self.fields, ":path").unwrap_or("/")
    }

    /// Value of `:authority` (host and optional port)
    pub fn authority(&self) -> &str {
        find(&self.fields, ":authority").unwrap_or("")
    }

    pub fn scheme(&self) -> &str {
        find(&self.fields, ":scheme").unwrap_or("http")
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn set_path(&mut self, path: impl Into<String>) {
        set_field(&mut self.fields, ":path", path.into());
    }

    pub fn set_scheme(&mut self, scheme: impl Into<String>) {
        set_field(&mut self.fields, ":scheme", scheme.into());
    }

    /// Rewrite `:authority` and the Host header together
    pub fn set_authority(&mut self, authority: impl Into<String>) {
        let authority = authority.into();
        set_field(&mut self.fields, ":authority", authority.clone());
        if self.fields.iter().any(|f| f.is("host")) {
            set_field(&mut self.fields, "host", authority);
        }
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        find(&self.fields, name)
    }

    pub fn get_all<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.fields
            .iter()
            .filter(move |f| f.is(name))
            .map(|f| f.value.as_str())
    }

    pub fn is_connect(&self) -> bool {
        self.method().eq_ignore_ascii_case("CONNECT")
    }

    /// -1 when absent
    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        is_chunked(&self.fields)
    }

    pub fn has_body(&self) -> bool {
        self.is_chunked() || self.content_length > 0
    }

    /// Client asked for the connection to end after this exchange
    pub fn connection_close_request(&self) -> bool {
        if has_token(&self.fields, "connection", "close") {
            return true;
        }
        self.version == "HTTP/1.0" && !has_token(&self.fields, "connection", "keep-alive")
    }

    pub fn is_websocket_request(&self) -> bool {
        has_token(&self.fields, "upgrade", "websocket")
            && has_token(&self.fields, "connection", "upgrade")
    }

    pub fn raw_length(&self) -> usize {
        self.raw_length
    }

    /// Serialize as HTTP/1.1 after replaying `alterations`. Returns the bytes written.
    pub fn write_http11(
        &self,
        alterations: &[HeaderAlteration],
        skip_non_forwardable: bool,
        buf: &mut BytesMut,
    ) -> usize {
        let start = buf.len();
        let fields = apply_alterations(&self.fields, alterations);

        let method = find(&fields, ":method").unwrap_or("GET");
        let path = find(&fields, ":path").unwrap_or("/");
        buf.put_slice(method.as_bytes());
        buf.put_u8(b' ');
        buf.put_slice(path.as_bytes());
        buf.put_slice(b" HTTP/1.1\r\n");

        if !fields.iter().any(|f| f.is("host")) {
            if let Some(authority) = find(&fields, ":authority").filter(|a| !a.is_empty()) {
                buf.put_slice(b"Host: ");
                buf.put_slice(authority.as_bytes());
                buf.put_slice(b"\r\n");
            }
        }

        write_fields(&fields, skip_non_forwardable, buf);
        buf.len() - start
    }

    /// Header fields for an HTTP/2 request: regular fields minus connection-scoped ones
    pub fn http2_fields(&self, alterations: &[HeaderAlteration]) -> (Vec<HeaderField>, Vec<HeaderField>) {
        let fields = apply_alterations(&self.fields, alterations);
        fields.into_iter().partition(|f| f.is_pseudo())
    }
}

/// Parsed response header
#[derive(Debug, Clone, Serialize)]
pub struct ResponseHeader {
    fields: Vec<HeaderField>,
    status: u16,
    reason: String,
    version: String,
    content_length: i64,
    raw_length: usize,
}

impl ResponseHeader {
    pub fn parse(block: &[u8]) -> Result<Self, ExchangeError> {
        let mut raw = vec![httparse::EMPTY_HEADER; MAX_HEADERS];
        let mut response = httparse::Response::new(&mut raw);
        match response.parse(block) {
            Ok(httparse::Status::Complete(_)) => {}
            Ok(httparse::Status::Partial) => {
                return Err(ExchangeError::TruncatedHeader {
                    side: ErrorSide::Remote,
                })
            }
            Err(e) => return Err(ExchangeError::MalformedResponse(e.to_string())),
        }

        let status = response
            .code
            .ok_or_else(|| ExchangeError::MalformedResponse("missing status".into()))?;
        let reason = response.reason.unwrap_or("").to_string();
        let version = match response.version {
            Some(0) => "HTTP/1.0",
            _ => "HTTP/1.1",
        }
        .to_string();

        let mut fields = vec![HeaderField::new(":status", status.to_string())];
        fields.extend(convert_fields(response.headers, ErrorSide::Remote)?);
        let content_length = body_framing(&fields, ErrorSide::Remote)?;

        Ok(Self {
            fields,
            status,
            reason,
            version,
            content_length,
            raw_length: block.len(),
        })
    }

    /// Build from a status and regular fields (HTTP/2 responses, synthesized responses)
    pub fn from_parts(
        status: u16,
        version: &str,
        fields: Vec<HeaderField>,
    ) -> Result<Self, ExchangeError> {
        let mut all = vec![HeaderField::new(":status", status.to_string())];
        all.extend(fields);
        let content_length = body_framing(&all, ErrorSide::Remote)?;
        Ok(Self {
            fields: all,
            status,
            reason: reason_phrase(status).to_string(),
            version: version.to_string(),
            content_length,
            raw_length: 0,
        })
    }

    pub fn status_code(&self) -> u16 {
        self.status
    }

    pub fn reason(&self) -> &str {
        &self.reason
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    pub fn fields(&self) -> &[HeaderField] {
        &self.fields
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        find(&self.fields, name)
    }

    pub fn content_length(&self) -> i64 {
        self.content_length
    }

    pub fn is_chunked(&self) -> bool {
        is_chunked(&self.fields)
    }

    pub fn connection_close_request(&self) -> bool {
        if has_token(&self.fields, "connection", "close") {
            return true;
        }
        self.version == "HTTP/1.0" && !has_token(&self.fields, "connection", "keep-alive")
    }

    /// Whether a body follows this header for a request with `method`
    pub fn has_response_body(&self, method: &str) -> bool {
        if method.eq_ignore_ascii_case("HEAD") {
            return false;
        }
        if matches!(self.status, 204 | 205 | 304) || (100..200).contains(&self.status) {
            return false;
        }
        self.content_length != 0
    }

    /// Body is delimited by the remote closing the connection
    pub fn is_close_delimited(&self, method: &str) -> bool {
        self.has_response_body(method) && !self.is_chunked() && self.content_length < 0
    }

    pub fn raw_length(&self) -> usize {
        self.raw_length
    }

    pub fn write_http11(
        &self,
        alterations: &[HeaderAlteration],
        skip_non_forwardable: bool,
        buf: &mut BytesMut,
    ) -> usize {
        let start = buf.len();
        let fields = apply_alterations(&self.fields, alterations);
        let status = find(&fields, ":status")
            .and_then(|s| s.parse::<u16>().ok())
            .unwrap_or(self.status);
        let reason = if status == self.status && !self.reason.is_empty() {
            self.reason.as_str()
        } else {
            reason_phrase(status)
        };
        buf.put_slice(format!("HTTP/1.1 {} {}\r\n", status, reason).as_bytes());
        write_fields(&fields, skip_non_forwardable, buf);
        buf.len() - start
    }
}

/// Canonical reason phrase for common status codes
pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        202 => "Accepted",
        204 => "No Content",
        205 => "Reset Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        303 => "See Other",
        304 => "Not Modified",
        307 => "Temporary Redirect",
        308 => "Permanent Redirect",
        400 => "Bad Request",
        401 => "Unauthorized",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        413 => "Payload Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        502 => "Bad Gateway",
        503 => "Service Unavailable",
        504 => "Gateway Timeout",
        528 => "Remote Connection Failed",
        _ => "Unknown",
    }
}

/// Split the `:authority` of a request into an [`Authority`]
pub fn authority_of(header: &RequestHeader, secure: bool) -> Result<Authority, ExchangeError> {
    let default_port = if secure { 443 } else { 80 };
    let (host, port) = split_host_port(header.authority(), default_port)?;
    Ok(Authority::new(host, port, secure))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SIMPLE_GET: &[u8] =
        b"GET /index.html?q=1 HTTP/1.1\r\nHost: example.com\r\nAccept: */*\r\n\r\n";

    #[test]
    fn test_parse_origin_form() {
        let header = RequestHeader::parse(SIMPLE_GET, true, None).unwrap();
        assert_eq!(header.method(), "GET");
        assert_eq!(header.path(), "/index.html?q=1");
        assert_eq!(header.authority(), "example.com");
        assert_eq!(header.scheme(), "https");
        assert_eq!(header.content_length(), -1);
        assert!(!header.has_body());
        assert_eq!(header.raw_length(), SIMPLE_GET.len());
    }

    #[test]
    fn test_parse_absolute_form() {
        let block = b"POST http://api.example.com:8080/v1/items?x=y HTTP/1.1\r\nContent-Length: 4\r\n\r\n";
        let header = RequestHeader::parse(block, false, None).unwrap();
        assert_eq!(header.authority(), "api.example.com:8080");
        assert_eq!(header.path(), "/v1/items?x=y");
        assert_eq!(header.scheme(), "http");
        assert_eq!(header.content_length(), 4);

        let authority = authority_of(&header, false).unwrap();
        assert_eq!(authority, Authority::new("api.example.com", 8080, false));
    }

    #[test]
    fn test_parse_connect() {
        let block = b"CONNECT example.com:443 HTTP/1.1\r\nHost: example.com:443\r\n\r\n";
        let header = RequestHeader::parse(block, false, None).unwrap();
        assert!(header.is_connect());
        assert_eq!(header.authority(), "example.com:443");
    }

    #[test]
    fn test_write_round_trip() {
        let header = RequestHeader::parse(SIMPLE_GET, false, None).unwrap();
        let mut buf = BytesMut::new();
        let written = header.write_http11(&[], true, &mut buf);
        assert_eq!(written, buf.len());
        assert_eq!(&buf[..], SIMPLE_GET);
    }

    #[test]
    fn test_pseudo_headers_not_serialized() {
        let header = RequestHeader::parse(SIMPLE_GET, false, None).unwrap();
        let mut buf = BytesMut::new();
        header.write_http11(&[], false, &mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(!text.contains(":method"));
        assert!(!text.contains(":authority"));
    }

    #[test]
    fn test_non_forwardable_skipped() {
        let block = b"GET / HTTP/1.1\r\nHost: a.com\r\nConnection: keep-alive\r\nProxy-Connection: keep-alive\r\nX-Kept: 1\r\n\r\n";
        let header = RequestHeader::parse(block, false, None).unwrap();

        let mut buf = BytesMut::new();
        header.write_http11(&[], true, &mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(!text.contains("Connection"));
        assert!(text.contains("X-Kept: 1"));

        let mut buf = BytesMut::new();
        header.write_http11(&[], false, &mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.contains("Connection: keep-alive"));
    }

    #[test]
    fn test_alterations_applied_on_write() {
        let header = RequestHeader::parse(SIMPLE_GET, false, None).unwrap();
        let alterations = vec![
            HeaderAlteration::add("X-Trace", "abc"),
            HeaderAlteration::delete("accept"),
        ];
        let mut buf = BytesMut::new();
        header.write_http11(&alterations, true, &mut buf);
        let text = String::from_utf8(buf.to_vec()).unwrap();
        assert!(text.contains("X-Trace: abc\r\n"));
        assert!(!text.contains("Accept"));
        // parsed header is untouched
        assert_eq!(header.get("accept"), Some("*/*"));
    }

    #[test]
    fn test_duplicate_content_length() {
        let same = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 5\r\n\r\n";
        assert_eq!(RequestHeader::parse(same, false, None).unwrap().content_length(), 5);

        let conflicting = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 5\r\nContent-Length: 6\r\n\r\n";
        assert!(matches!(
            RequestHeader::parse(conflicting, false, None),
            Err(ExchangeError::ConflictingContentLength { side: ErrorSide::Client })
        ));
    }

    #[test]
    fn test_length_with_chunked_rejected() {
        let request = b"POST / HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\nTransfer-Encoding: chunked\r\n\r\n";
        assert!(matches!(
            RequestHeader::parse(request, false, None),
            Err(ExchangeError::AmbiguousFraming { side: ErrorSide::Client })
        ));

        let response = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\nContent-Length: 0\r\n\r\n";
        assert!(matches!(
            ResponseHeader::parse(response),
            Err(ExchangeError::AmbiguousFraming { side: ErrorSide::Remote })
        ));

        let fields = vec![
            HeaderField::new("Content-Length", "3"),
            HeaderField::new("Transfer-Encoding", "chunked"),
        ];
        assert!(ResponseHeader::from_parts(200, "HTTP/1.1", fields).is_err());
    }

    #[test]
    fn test_connection_semantics() {
        let close = b"GET / HTTP/1.1\r\nHost: a\r\nConnection: close\r\n\r\n";
        assert!(RequestHeader::parse(close, false, None).unwrap().connection_close_request());

        let http10 = b"GET / HTTP/1.0\r\nHost: a\r\n\r\n";
        assert!(RequestHeader::parse(http10, false, None).unwrap().connection_close_request());

        let ws = b"GET /chat HTTP/1.1\r\nHost: a\r\nUpgrade: websocket\r\nConnection: keep-alive, Upgrade\r\n\r\n";
        assert!(RequestHeader::parse(ws, false, None).unwrap().is_websocket_request());
    }

    #[test]
    fn test_malformed_request() {
        assert!(RequestHeader::parse(b"\x00\x01 garbage\r\n\r\n", false, None).is_err());
    }

    #[test]
    fn test_response_parse() {
        let block = b"HTTP/1.1 200 OK\r\nContent-Length: 12\r\nX-A: b\r\n\r\n";
        let header = ResponseHeader::parse(block).unwrap();
        assert_eq!(header.status_code(), 200);
        assert_eq!(header.reason(), "OK");
        assert_eq!(header.content_length(), 12);
        assert!(header.has_response_body("GET"));
        assert!(!header.has_response_body("HEAD"));

        let mut buf = BytesMut::new();
        header.write_http11(&[], false, &mut buf);
        assert_eq!(&buf[..], &block[..]);
    }

    #[test]
    fn test_bodiless_statuses() {
        for status in [204u16, 205, 304] {
            let block = format!("HTTP/1.1 {} X\r\n\r\n", status);
            let header = ResponseHeader::parse(block.as_bytes()).unwrap();
            assert!(!header.has_response_body("GET"), "status {}", status);
        }

        let empty = ResponseHeader::parse(b"HTTP/1.1 200 OK\r\nContent-Length: 0\r\n\r\n").unwrap();
        assert!(!empty.has_response_body("GET"));

        let unknown = ResponseHeader::parse(b"HTTP/1.1 200 OK\r\n\r\n").unwrap();
        assert!(unknown.is_close_delimited("GET"));
    }

    #[test]
    fn test_response_chunked_and_close() {
        let block = b"HTTP/1.1 200 OK\r\nTransfer-Encoding: gzip, chunked\r\nConnection: close\r\n\r\n";
        let header = ResponseHeader::parse(block).unwrap();
        assert!(header.is_chunked());
        assert!(header.connection_close_request());
        assert!(!header.is_close_delimited("GET"));
    }

    #[test]
    fn test_set_authority_updates_host() {
        let mut header = RequestHeader::parse(SIMPLE_GET, false, None).unwrap();
        header.set_authority("backend.local");
        header.set_path("/api/index.html");
        assert_eq!(header.authority(), "backend.local");
        assert_eq!(header.get("host"), Some("backend.local"));
        assert_eq!(header.path(), "/api/index.html");
    }
}
