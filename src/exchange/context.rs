//! Per-exchange mutable context written by rule actions

use bytes::{BufMut, Bytes, BytesMut};
use rustls::pki_types::{CertificateDer, PrivateKeyDer};
use serde::Serialize;
use std::collections::HashMap;
use std::fmt;
use std::net::IpAddr;
use std::sync::Arc;

use crate::http::header::{reason_phrase, HeaderField};

/// Token replaced by the previous value in [`HeaderAlteration::Replace`]
pub const PREVIOUS_VALUE_TOKEN: &str = "{{previous}}";

/// Deferred header edit, replayed in order at serialization time
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub enum HeaderAlteration {
    Add {
        name: String,
        value: String,
    },
    Replace {
        name: String,
        value: String,
        add_if_missing: bool,
    },
    Delete {
        name: String,
    },
}

impl HeaderAlteration {
    pub fn add(name: impl Into<String>, value: impl Into<String>) -> Self {
        Self::Add {
            name: name.into(),
            value: value.into(),
        }
    }

    pub fn replace(name: impl Into<String>, value: impl Into<String>, add_if_missing: bool) -> Self {
        Self::Replace {
            name: name.into(),
            value: value.into(),
            add_if_missing,
        }
    }

    pub fn delete(name: impl Into<String>) -> Self {
        Self::Delete { name: name.into() }
    }

    pub fn apply(&self, fields: &mut Vec<HeaderField>) {
        match self {
            Self::Add { name, value } => fields.push(HeaderField::new(name.clone(), value.clone())),
            Self::Replace {
                name,
                value,
                add_if_missing,
            } => {
                let mut found = false;
                for field in fields.iter_mut().filter(|f| f.is(name)) {
                    field.value = value.replace(PREVIOUS_VALUE_TOKEN, &field.value);
                    found = true;
                }
                if !found && *add_if_missing {
                    fields.push(HeaderField::new(
                        name.clone(),
                        value.replace(PREVIOUS_VALUE_TOKEN, ""),
                    ));
                }
            }
            Self::Delete { name } => fields.retain(|f| !f.is(name)),
        }
    }
}

/// ALPN identifiers the proxy can offer upstream
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, serde::Deserialize)]
pub enum AlpnProtocol {
    #[serde(rename = "http/1.1")]
    Http11,
    #[serde(rename = "h2")]
    Http2,
}

impl AlpnProtocol {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Self::Http11 => b"http/1.1",
            Self::Http2 => b"h2",
        }
    }
}

/// Client certificate presented to the remote during the TLS handshake
pub struct ClientCertificate {
    pub chain: Vec<CertificateDer<'static>>,
    pub key: PrivateKeyDer<'static>,
}

impl fmt::Debug for ClientCertificate {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientCertificate")
            .field("chain_len", &self.chain.len())
            .finish()
    }
}

/// Response served by the proxy itself instead of contacting the remote
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PreMadeResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: Bytes,
}

impl PreMadeResponse {
    pub fn new(status: u16, content_type: &str, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: vec![("Content-Type".to_string(), content_type.to_string())],
            body: body.into(),
        }
    }

    pub fn with_header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    /// Full HTTP/1.1 message with Content-Length set from the body
    pub fn to_http11(&self) -> Bytes {
        let mut buf = BytesMut::with_capacity(128 + self.body.len());
        buf.put_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, reason_phrase(self.status)).as_bytes(),
        );
        for (name, value) in &self.headers {
            if name.eq_ignore_ascii_case("content-length") {
                continue;
            }
            buf.put_slice(format!("{}: {}\r\n", name, value).as_bytes());
        }
        buf.put_slice(format!("Content-Length: {}\r\n\r\n", self.body.len()).as_bytes());
        buf.put_slice(&self.body);
        buf.freeze()
    }
}

/// Decisions accumulated by rule actions for one exchange (or one CONNECT authority)
#[derive(Debug, Clone, Default)]
pub struct ExchangeContext {
    /// Tunnel bytes without decryption
    pub blind_mode: bool,
    /// Overrides DNS resolution
    pub remote_host_ip: Option<IpAddr>,
    /// Overrides the remote port
    pub remote_host_port: Option<u16>,
    pub client_certificate: Option<Arc<ClientCertificate>>,
    /// Overrides the configured upstream ALPN list
    pub ssl_application_protocols: Option<Vec<AlpnProtocol>>,
    pub skip_remote_certificate_validation: bool,
    pub request_header_alterations: Vec<HeaderAlteration>,
    pub response_header_alterations: Vec<HeaderAlteration>,
    pub pre_made_response: Option<PreMadeResponse>,
    /// Request targets the proxy itself
    pub is_self: bool,
    pub variables: HashMap<String, String>,
}

impl ExchangeContext {
    pub fn new() -> Self {
        Self::default()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn fields() -> Vec<HeaderField> {
        vec![
            HeaderField::new("Host", "a.com"),
            HeaderField::new("Accept", "text/html"),
            HeaderField::new("X-Multi", "1"),
            HeaderField::new("x-multi", "2"),
        ]
    }

    #[test]
    fn test_add_keeps_existing() {
        let mut f = fields();
        HeaderAlteration::add("Accept", "*/*").apply(&mut f);
        assert_eq!(f.iter().filter(|h| h.is("accept")).count(), 2);
    }

    #[test]
    fn test_replace_with_previous_value() {
        let mut f = fields();
        HeaderAlteration::replace("accept", "{{previous}}, application/json", false).apply(&mut f);
        assert_eq!(f[1].value, "text/html, application/json");
        assert_eq!(f[1].name, "Accept");
    }

    #[test]
    fn test_replace_missing() {
        let mut f = fields();
        HeaderAlteration::replace("X-New", "v", false).apply(&mut f);
        assert!(!f.iter().any(|h| h.is("x-new")));

        HeaderAlteration::replace("X-New", "v", true).apply(&mut f);
        assert!(f.iter().any(|h| h.is("x-new") && h.value == "v"));
    }

    #[test]
    fn test_delete_all_occurrences() {
        let mut f = fields();
        HeaderAlteration::delete("X-MULTI").apply(&mut f);
        assert_eq!(f.len(), 2);
    }

    #[test]
    fn test_premade_response_bytes() {
        let response = PreMadeResponse::new(200, "text/plain", "hi").with_header("X-A", "1");
        let bytes = response.to_http11();
        assert_eq!(
            &bytes[..],
            b"HTTP/1.1 200 OK\r\nContent-Type: text/plain\r\nX-A: 1\r\nContent-Length: 2\r\n\r\nhi"
        );
    }
}
