use crate::codec::DecoderLimits;
use crate::socket::TlsConfig;
use serde::Deserialize;
use std::fs;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to read config file: {source}")]
    Io {
        #[from]
        source: io::Error,
    },

    #[error("failed to parse config: {source}")]
    Parse {
        #[from]
        source: serde_json::Error,
    },

    #[error("invalid config: {reason}")]
    Invalid { reason: String },
}

impl ConfigError {
    pub fn invalid<S: ToString>(str: S) -> Self {
        Self::Invalid { reason: str.to_string() }
    }
}

/// Settings of the engine. Every field has a default, so `{}` is a valid config.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    pub host: String,
    /// `0` binds an ephemeral port.
    pub port: u16,
    pub min_workers: usize,
    pub max_workers: usize,
    pub worker_keep_alive_ms: u64,
    /// How many bytes a connection asks the socket for per read.
    pub read_buffer_size: usize,
    pub line_buffer_size: usize,
    pub body_buffer_size: usize,
    pub max_line_size: usize,
    pub max_body_size: usize,
    pub select_timeout_ms: u64,
    pub handshake_timeout_ms: u64,
    pub tls: Option<TlsConfig>,
}

impl Default for ServerConfig {
    fn default() -> Self {
        let limits = DecoderLimits::default();
        Self {
            host: "127.0.0.1".into(),
            port: 4000,
            min_workers: 4,
            max_workers: 64,
            worker_keep_alive_ms: 60_000,
            read_buffer_size: 16 * 1024,
            line_buffer_size: limits.line_buffer_size,
            body_buffer_size: limits.body_buffer_size,
            max_line_size: limits.max_line_size,
            max_body_size: limits.max_body_size,
            select_timeout_ms: 1000,
            handshake_timeout_ms: 10_000,
            tls: None,
        }
    }
}

impl ServerConfig {
    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)?;
        Self::from_json_str(&content)
    }

    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_workers == 0 {
            return Err(ConfigError::invalid("max_workers must be greater than 0"));
        }
        if self.min_workers > self.max_workers {
            return Err(ConfigError::invalid(format!(
                "min_workers {} is greater than max_workers {}",
                self.min_workers, self.max_workers
            )));
        }
        if self.read_buffer_size == 0 || self.line_buffer_size == 0 {
            return Err(ConfigError::invalid("buffer sizes must be greater than 0"));
        }
        if self.line_buffer_size > self.max_line_size {
            return Err(ConfigError::invalid("line_buffer_size is greater than max_line_size"));
        }
        Ok(())
    }

    /// Resolves `host:port`.
    pub fn socket_addr(&self) -> Result<SocketAddr, ConfigError> {
        (self.host.as_str(), self.port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| ConfigError::invalid(format!("host {} did not resolve", self.host)))
    }

    pub fn decoder_limits(&self) -> DecoderLimits {
        DecoderLimits {
            line_buffer_size: self.line_buffer_size,
            max_line_size: self.max_line_size,
            body_buffer_size: self.body_buffer_size,
            max_body_size: self.max_body_size,
        }
    }

    pub fn worker_keep_alive(&self) -> Duration {
        Duration::from_millis(self.worker_keep_alive_ms)
    }

    pub fn select_timeout(&self) -> Duration {
        Duration::from_millis(self.select_timeout_ms)
    }

    pub fn handshake_timeout(&self) -> Duration {
        Duration::from_millis(self.handshake_timeout_ms)
    }
}
