//! Authority - (host, port, secure) triple identifying a remote endpoint

use serde::Serialize;
use std::fmt;
use std::hash::{Hash, Hasher};

use crate::error::ExchangeError;

/// Remote endpoint identity. Host name comparison is case-insensitive.
#[derive(Debug, Clone, Serialize)]
pub struct Authority {
    host_name: String,
    port: u16,
    secure: bool,
}

impl Authority {
    pub fn new(host_name: impl Into<String>, port: u16, secure: bool) -> Self {
        Self {
            host_name: host_name.into(),
            port,
            secure,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    pub fn port(&self) -> u16 {
        self.port
    }

    pub fn secure(&self) -> bool {
        self.secure
    }

    pub fn scheme(&self) -> &'static str {
        if self.secure {
            "https"
        } else {
            "http"
        }
    }

    /// Value for a Host header: the port is omitted when it is the scheme default
    pub fn host_header(&self) -> String {
        let default_port = if self.secure { 443 } else { 80 };
        let host = if self.host_name.contains(':') {
            format!("[{}]", self.host_name)
        } else {
            self.host_name.clone()
        };
        if self.port == default_port {
            host
        } else {
            format!("{}:{}", host, self.port)
        }
    }

    /// Parse `host[:port]` (IPv6 literals in brackets) using `default_port` when absent
    pub fn parse(value: &str, default_port: u16, secure: bool) -> Result<Self, ExchangeError> {
        let (host, port) = split_host_port(value, default_port)?;
        Ok(Self::new(host, port, secure))
    }
}

impl PartialEq for Authority {
    fn eq(&self, other: &Self) -> bool {
        self.port == other.port
            && self.secure == other.secure
            && self.host_name.eq_ignore_ascii_case(&other.host_name)
    }
}

impl Eq for Authority {}

impl Hash for Authority {
    fn hash<H: Hasher>(&self, state: &mut H) {
        for byte in self.host_name.bytes() {
            state.write_u8(byte.to_ascii_lowercase());
        }
        self.port.hash(state);
        self.secure.hash(state);
    }
}

impl fmt::Display for Authority {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.host_name.contains(':') {
            write!(f, "[{}]:{}", self.host_name, self.port)
        } else {
            write!(f, "{}:{}", self.host_name, self.port)
        }
    }
}

/// Split an authority string into host and port
pub fn split_host_port(value: &str, default_port: u16) -> Result<(String, u16), ExchangeError> {
    let value = value.trim();
    if value.is_empty() {
        return Err(ExchangeError::MalformedRequest("empty authority".into()));
    }

    // [::1]:8080
    if let Some(rest) = value.strip_prefix('[') {
        let end = rest
            .find(']')
            .ok_or_else(|| ExchangeError::MalformedRequest(format!("bad authority {}", value)))?;
        let host = &rest[..end];
        let port = match rest[end + 1..].strip_prefix(':') {
            Some(p) => parse_port(p, value)?,
            None => default_port,
        };
        return Ok((host.to_string(), port));
    }

    match value.rsplit_once(':') {
        Some((host, port)) if !host.contains(':') => {
            if host.is_empty() {
                return Err(ExchangeError::MalformedRequest(format!(
                    "bad authority {}",
                    value
                )));
            }
            Ok((host.to_string(), parse_port(port, value)?))
        }
        // Bare IPv6 literal without brackets
        Some(_) => Ok((value.to_string(), default_port)),
        None => Ok((value.to_string(), default_port)),
    }
}

fn parse_port(port: &str, original: &str) -> Result<u16, ExchangeError> {
    port.parse::<u16>()
        .map_err(|_| ExchangeError::MalformedRequest(format!("bad port in {}", original)))
}
