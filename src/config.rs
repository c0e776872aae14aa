//! Gateway configuration
//!
//! Loaded from TOML. Every field has a default, so an empty or missing
//! file yields [`GatewayConfig::default`].

use crate::error::{GatewayError, Result};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;

/// Tunables for the orchestrator, façade and transport
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GatewayConfig {
    /// Period of the active-provider health check (default: 30)
    #[serde(default = "default_health_check_interval_secs")]
    pub health_check_interval_secs: u64,

    /// Failed connects before a provider is skipped in a connect pass (default: 3)
    #[serde(default = "default_max_connect_attempts")]
    pub max_connect_attempts: u32,

    /// Façade timeout for one-shot calls (default: 30)
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    /// Façade per-stream queue capacity; oldest events are dropped past it (default: 1024)
    #[serde(default = "default_stream_buffer_size")]
    pub stream_buffer_size: usize,

    /// Largest accepted frame payload on framed links (default: 16 MiB)
    #[serde(default = "default_max_frame_size")]
    pub max_frame_size: u32,
}

fn default_health_check_interval_secs() -> u64 {
    30
}

fn default_max_connect_attempts() -> u32 {
    3
}

fn default_request_timeout_secs() -> u64 {
    30
}

fn default_stream_buffer_size() -> usize {
    1024
}

fn default_max_frame_size() -> u32 {
    16 * 1024 * 1024
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            health_check_interval_secs: default_health_check_interval_secs(),
            max_connect_attempts: default_max_connect_attempts(),
            request_timeout_secs: default_request_timeout_secs(),
            stream_buffer_size: default_stream_buffer_size(),
            max_frame_size: default_max_frame_size(),
        }
    }
}

impl GatewayConfig {
    /// Load configuration from a TOML file.
    /// Returns the default config if the file does not exist.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| {
            GatewayError::Config(format!(
                "Failed to read config file {}: {}",
                path.display(),
                e
            ))
        })?;
        let config = Self::from_toml_str(&content)?;

        tracing::debug!(path = %path.display(), "Gateway config loaded");
        Ok(config)
    }

    /// Parse and validate a TOML document
    pub fn from_toml_str(content: &str) -> Result<Self> {
        let config: GatewayConfig = toml::from_str(content)
            .map_err(|e| GatewayError::Config(format!("Failed to parse config: {}", e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Reject values that would disable health checks, timeouts or retries
    pub fn validate(&self) -> Result<()> {
        if self.health_check_interval_secs == 0 {
            return Err(GatewayError::Config(
                "healthCheckIntervalSecs must be >= 1".to_string(),
            ));
        }
        if self.max_connect_attempts == 0 {
            return Err(GatewayError::Config(
                "maxConnectAttempts must be >= 1".to_string(),
            ));
        }
        if self.request_timeout_secs == 0 {
            return Err(GatewayError::Config(
                "requestTimeoutSecs must be >= 1".to_string(),
            ));
        }
        if self.stream_buffer_size == 0 {
            return Err(GatewayError::Config(
                "streamBufferSize must be >= 1".to_string(),
            ));
        }
        if self.max_frame_size == 0 {
            return Err(GatewayError::Config(
                "maxFrameSize must be >= 1".to_string(),
            ));
        }
        Ok(())
    }

    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = GatewayConfig::default();
        assert_eq!(config.health_check_interval_secs, 30);
        assert_eq!(config.max_connect_attempts, 3);
        assert_eq!(config.request_timeout(), Duration::from_secs(30));
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = GatewayConfig::from_toml_str("maxConnectAttempts = 5\n").unwrap();
        assert_eq!(config.max_connect_attempts, 5);
        assert_eq!(config.health_check_interval_secs, 30);
    }

    #[test]
    fn test_zero_values_rejected() {
        let err = GatewayConfig::from_toml_str("requestTimeoutSecs = 0\n").unwrap_err();
        assert!(matches!(err, GatewayError::Config(_)));
    }

    #[test]
    fn test_from_file_missing_returns_default() {
        let dir = tempfile::tempdir().unwrap();
        let config = GatewayConfig::from_file(dir.path().join("gateway.toml")).unwrap();
        assert_eq!(config, GatewayConfig::default());
    }

    #[test]
    fn test_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("gateway.toml");
        std::fs::write(&path, "healthCheckIntervalSecs = 5\nstreamBufferSize = 8\n").unwrap();

        let config = GatewayConfig::from_file(&path).unwrap();
        assert_eq!(config.health_check_interval(), Duration::from_secs(5));
        assert_eq!(config.stream_buffer_size, 8);
    }
}
