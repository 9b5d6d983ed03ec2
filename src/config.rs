//! Proxy settings
//!
//! Settings come from a YAML file (`ProxySettings::from_file`) or from
//! `FLUXGATE_*` environment variables (`ProxySettings::from_env`, `.env` aware).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::env;
use std::net::SocketAddr;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

use crate::exchange::AlpnProtocol;

/// Configuration errors
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    FileReadError(String),

    #[error("Failed to parse config: {0}")]
    ParseError(String),

    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxySettings {
    /// Listen endpoints
    #[serde(default = "default_bound_points")]
    pub bound_points: Vec<SocketAddr>,

    /// Maximum size of a request or response header block
    #[serde(default = "default_max_header_length")]
    pub max_header_length: usize,

    /// Body copy chunk size
    #[serde(default = "default_buffer_size")]
    pub buffer_size: usize,

    /// Concurrent HTTP/1.1 exchanges per authority
    #[serde(default = "default_connection_per_host")]
    pub connection_per_host: usize,

    /// Idle upstream connections older than this are discarded
    #[serde(default = "default_idle_timeout")]
    pub time_out_seconds_unused_connection: u64,

    /// Tunnel every CONNECT without decryption
    #[serde(default)]
    pub skip_global_ssl_decryption: bool,

    /// Accept any remote certificate
    #[serde(default)]
    pub skip_remote_certificate_validation: bool,

    /// ALPN protocols offered to remotes
    #[serde(default = "default_alpn_protocols")]
    pub alpn_protocols: Vec<AlpnProtocol>,

    /// Status returned when the remote cannot be reached (502 or 528)
    #[serde(default = "default_error_status_code")]
    pub error_status_code: u16,

    /// Stop the proxy after this many completed exchanges
    #[serde(default)]
    pub max_exchange_count: Option<usize>,

    /// YAML rule file
    #[serde(default)]
    pub rules_file: Option<PathBuf>,

    /// PEM CA certificate used to sign leaf certificates
    #[serde(default)]
    pub ca_certificate_path: Option<PathBuf>,

    /// PEM private key of the CA
    #[serde(default)]
    pub ca_private_key_path: Option<PathBuf>,

    #[serde(default = "default_certificate_cache_size")]
    pub certificate_cache_size: usize,

    #[serde(default = "default_dns_cache_size")]
    pub dns_cache_size: usize,

    #[serde(default = "default_dns_cache_ttl")]
    pub dns_cache_ttl_seconds: u64,

    #[serde(default = "default_dns_timeout")]
    pub dns_timeout_seconds: u64,

    #[serde(default = "default_connect_timeout")]
    pub connect_timeout_seconds: u64,

    /// Drain polls before in-flight connections are aborted on shutdown
    #[serde(default = "default_shutdown_retry_budget")]
    pub shutdown_retry_budget: u32,

    #[serde(default = "default_shutdown_poll_interval")]
    pub shutdown_poll_interval_ms: u64,
}

fn default_bound_points() -> Vec<SocketAddr> {
    vec![SocketAddr::from(([127, 0, 0, 1], 44344))]
}

fn default_max_header_length() -> usize {
    16 * 1024
}

fn default_buffer_size() -> usize {
    16 * 1024
}

fn default_connection_per_host() -> usize {
    16
}

fn default_idle_timeout() -> u64 {
    4
}

fn default_alpn_protocols() -> Vec<AlpnProtocol> {
    vec![AlpnProtocol::Http11, AlpnProtocol::Http2]
}

fn default_error_status_code() -> u16 {
    502
}

fn default_certificate_cache_size() -> usize {
    1000
}

fn default_dns_cache_size() -> usize {
    5000
}

fn default_dns_cache_ttl() -> u64 {
    60
}

fn default_dns_timeout() -> u64 {
    5
}

fn default_connect_timeout() -> u64 {
    10
}

fn default_shutdown_retry_budget() -> u32 {
    50
}

fn default_shutdown_poll_interval() -> u64 {
    100
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self {
            bound_points: default_bound_points(),
            max_header_length: default_max_header_length(),
            buffer_size: default_buffer_size(),
            connection_per_host: default_connection_per_host(),
            time_out_seconds_unused_connection: default_idle_timeout(),
            skip_global_ssl_decryption: false,
            skip_remote_certificate_validation: false,
            alpn_protocols: default_alpn_protocols(),
            error_status_code: default_error_status_code(),
            max_exchange_count: None,
            rules_file: None,
            ca_certificate_path: None,
            ca_private_key_path: None,
            certificate_cache_size: default_certificate_cache_size(),
            dns_cache_size: default_dns_cache_size(),
            dns_cache_ttl_seconds: default_dns_cache_ttl(),
            dns_timeout_seconds: default_dns_timeout(),
            connect_timeout_seconds: default_connect_timeout(),
            shutdown_retry_budget: default_shutdown_retry_budget(),
            shutdown_poll_interval_ms: default_shutdown_poll_interval(),
        }
    }
}

impl ProxySettings {
    /// Load settings from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content =
            std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError(e.to_string()))?;
        Self::from_yaml(&content)
    }

    pub fn from_yaml(content: &str) -> Result<Self, ConfigError> {
        let settings: Self =
            serde_yaml::from_str(content).map_err(|e| ConfigError::ParseError(e.to_string()))?;
        settings.validate()?;
        Ok(settings)
    }

    /// Load settings from `FLUXGATE_*` environment variables
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let mut settings = Self::default();

        if let Ok(points) = env::var("FLUXGATE_BOUND_POINTS") {
            settings.bound_points = points
                .split(',')
                .map(|p| p.trim().parse::<SocketAddr>())
                .collect::<std::result::Result<_, _>>()
                .context("Invalid FLUXGATE_BOUND_POINTS")?;
        }
        if let Ok(v) = env::var("FLUXGATE_MAX_HEADER_LENGTH") {
            settings.max_header_length = v.parse().context("Invalid FLUXGATE_MAX_HEADER_LENGTH")?;
        }
        if let Ok(v) = env::var("FLUXGATE_BUFFER_SIZE") {
            settings.buffer_size = v.parse().context("Invalid FLUXGATE_BUFFER_SIZE")?;
        }
        if let Ok(v) = env::var("FLUXGATE_CONNECTION_PER_HOST") {
            settings.connection_per_host =
                v.parse().context("Invalid FLUXGATE_CONNECTION_PER_HOST")?;
        }
        if let Ok(v) = env::var("FLUXGATE_IDLE_TIMEOUT_SECONDS") {
            settings.time_out_seconds_unused_connection =
                v.parse().context("Invalid FLUXGATE_IDLE_TIMEOUT_SECONDS")?;
        }
        if let Ok(v) = env::var("FLUXGATE_SKIP_SSL_DECRYPTION") {
            settings.skip_global_ssl_decryption =
                v.parse().context("Invalid FLUXGATE_SKIP_SSL_DECRYPTION")?;
        }
        if let Ok(v) = env::var("FLUXGATE_INSECURE") {
            settings.skip_remote_certificate_validation =
                v.parse().context("Invalid FLUXGATE_INSECURE")?;
        }
        if let Ok(v) = env::var("FLUXGATE_ERROR_STATUS_CODE") {
            settings.error_status_code = v.parse().context("Invalid FLUXGATE_ERROR_STATUS_CODE")?;
        }
        if let Ok(v) = env::var("FLUXGATE_MAX_EXCHANGE_COUNT") {
            settings.max_exchange_count =
                Some(v.parse().context("Invalid FLUXGATE_MAX_EXCHANGE_COUNT")?);
        }
        if let Ok(v) = env::var("FLUXGATE_RULES_FILE") {
            settings.rules_file = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("FLUXGATE_CA_CERT") {
            settings.ca_certificate_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("FLUXGATE_CA_KEY") {
            settings.ca_private_key_path = Some(PathBuf::from(v));
        }
        if let Ok(v) = env::var("FLUXGATE_DNS_CACHE_SIZE") {
            settings.dns_cache_size = v.parse().context("Invalid FLUXGATE_DNS_CACHE_SIZE")?;
        }
        if let Ok(v) = env::var("FLUXGATE_DNS_CACHE_TTL_SECONDS") {
            settings.dns_cache_ttl_seconds =
                v.parse().context("Invalid FLUXGATE_DNS_CACHE_TTL_SECONDS")?;
        }
        if let Ok(v) = env::var("FLUXGATE_CONNECT_TIMEOUT_SECONDS") {
            settings.connect_timeout_seconds =
                v.parse().context("Invalid FLUXGATE_CONNECT_TIMEOUT_SECONDS")?;
        }

        settings.validate()?;
        Ok(settings)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.bound_points.is_empty() {
            return Err(ConfigError::ValidationError(
                "at least one bound point is required".into(),
            ));
        }
        if self.connection_per_host == 0 {
            return Err(ConfigError::ValidationError(
                "connection_per_host must be greater than 0".into(),
            ));
        }
        if self.max_header_length == 0 {
            return Err(ConfigError::ValidationError(
                "max_header_length must be greater than 0".into(),
            ));
        }
        if self.buffer_size == 0 {
            return Err(ConfigError::ValidationError(
                "buffer_size must be greater than 0".into(),
            ));
        }
        if !(400..=599).contains(&self.error_status_code) {
            return Err(ConfigError::ValidationError(format!(
                "error_status_code {} is not an error status",
                self.error_status_code
            )));
        }
        if self.ca_certificate_path.is_some() != self.ca_private_key_path.is_some() {
            return Err(ConfigError::ValidationError(
                "ca_certificate_path and ca_private_key_path must be set together".into(),
            ));
        }
        if self.alpn_protocols.is_empty() {
            return Err(ConfigError::ValidationError(
                "alpn_protocols cannot be empty".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.time_out_seconds_unused_connection)
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout_seconds)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let settings = ProxySettings::default();
        assert_eq!(settings.bound_points.len(), 1);
        assert_eq!(settings.bound_points[0].port(), 44344);
        assert_eq!(settings.max_header_length, 16384);
        assert_eq!(settings.connection_per_host, 16);
        assert_eq!(settings.time_out_seconds_unused_connection, 4);
        assert_eq!(settings.error_status_code, 502);
        assert!(settings.validate().is_ok());
    }

    #[test]
    fn test_yaml_partial() {
        let yaml = r#"
bound_points: ["127.0.0.1:0"]
connection_per_host: 2
skip_global_ssl_decryption: true
alpn_protocols: ["http/1.1"]
error_status_code: 528
"#;
        let settings = ProxySettings::from_yaml(yaml).unwrap();
        assert_eq!(settings.connection_per_host, 2);
        assert!(settings.skip_global_ssl_decryption);
        assert_eq!(settings.alpn_protocols, vec![AlpnProtocol::Http11]);
        assert_eq!(settings.error_status_code, 528);
        assert_eq!(settings.max_header_length, 16384);
    }

    #[test]
    fn test_validation_failures() {
        let mut settings = ProxySettings::default();
        settings.connection_per_host = 0;
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.bound_points.clear();
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.ca_certificate_path = Some(PathBuf::from("ca.pem"));
        assert!(settings.validate().is_err());

        let mut settings = ProxySettings::default();
        settings.error_status_code = 200;
        assert!(settings.validate().is_err());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("fluxgate.yaml");
        std::fs::write(&path, "max_header_length: 8192\n").unwrap();
        let settings = ProxySettings::from_file(&path).unwrap();
        assert_eq!(settings.max_header_length, 8192);

        assert!(matches!(
            ProxySettings::from_file(dir.path().join("missing.yaml")),
            Err(ConfigError::FileReadError(_))
        ));
    }
}
