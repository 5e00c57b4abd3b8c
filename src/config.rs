//! Server limits and tuning knobs.
//!
//! [`ServerConfig`] can be built in code (`ServerConfig::default()` plus field
//! updates) or deserialized from a JSON document. Missing fields take their
//! defaults.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::Deserialize;
use thiserror::Error;

/// Errors produced while loading a configuration document.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: String,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("invalid value for `{field}`: {reason}")]
    Invalid {
        field: &'static str,
        reason: &'static str,
    },
}

/// Per-connection limits and server-wide worker settings.
///
/// # Examples
///
/// ```
/// use pipehttp::config::ServerConfig;
///
/// let config = ServerConfig::from_json_str(r#"{ "max_headers": 16 }"#).unwrap();
/// assert_eq!(config.max_headers, 16);
/// assert_eq!(config.max_header_size, 8192);
/// ```
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Maximum bytes in a single header line (request line included).
    pub max_header_size: usize,
    /// Maximum header fields per request.
    pub max_headers: usize,
    /// Maximum `Content-Length` body, and maximum inflated gzip output.
    pub max_content_length: u64,
    /// Maximum total payload of a chunked body.
    pub max_chunked_length: u64,
    /// Largest piece read or written in one step.
    pub max_chunk_size: usize,
    pub idle_timeout_ms: u64,
    /// Upper bound on a single handler invocation.
    pub handler_timeout_ms: u64,
    /// Bodies larger than this are spooled to `temp_dir`.
    pub spool_threshold: usize,
    pub temp_dir: PathBuf,
    pub max_concurrent_handlers: usize,
    /// Reserved maximum request id. The request that takes the last id closes
    /// the connection after its response.
    pub max_requests_per_connection: u64,
    /// Include handler error text in 500 response bodies.
    pub expose_error_details: bool,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            max_header_size: 8 * 1024,
            max_headers: 100,
            max_content_length: 10 * 1024 * 1024,
            max_chunked_length: 10 * 1024 * 1024,
            max_chunk_size: 16 * 1024,
            idle_timeout_ms: 30_000,
            handler_timeout_ms: 60_000,
            spool_threshold: 1024 * 1024,
            temp_dir: std::env::temp_dir(),
            max_concurrent_handlers: 256,
            max_requests_per_connection: u64::MAX,
            expose_error_details: false,
        }
    }
}

impl ServerConfig {
    /// Parses and validates a JSON configuration document.
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    /// Reads, parses and validates a JSON configuration file.
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.display().to_string(),
            source,
        })?;
        Self::from_json_str(&raw)
    }

    /// Rejects configurations that would make every request fail.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let zero_checks: [(&'static str, bool); 6] = [
            ("max_header_size", self.max_header_size == 0),
            ("max_headers", self.max_headers == 0),
            ("max_chunk_size", self.max_chunk_size == 0),
            ("spool_threshold", self.spool_threshold == 0),
            ("max_concurrent_handlers", self.max_concurrent_handlers == 0),
            ("max_requests_per_connection", self.max_requests_per_connection == 0),
        ];
        if let Some(&(field, _)) = zero_checks.iter().find(|(_, zero)| *zero) {
            return Err(ConfigError::Invalid {
                field,
                reason: "must be greater than zero",
            });
        }
        if self.max_chunk_size as u64 > self.max_chunked_length {
            return Err(ConfigError::Invalid {
                field: "max_chunk_size",
                reason: "must not exceed max_chunked_length",
            });
        }
        Ok(())
    }

    pub fn idle_timeout(&self) -> Duration {
        Duration::from_millis(self.idle_timeout_ms)
    }

    pub fn handler_timeout(&self) -> Duration {
        Duration::from_millis(self.handler_timeout_ms)
    }
}
