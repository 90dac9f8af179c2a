//! Relay configuration
//!
//! Loads relay settings from a TOML file such as:
//!
//! ```toml
//! [server]
//! bind = "0.0.0.0"
//! port = 3001
//! send_timeout_ms = 5000
//!
//! [client]
//! url = "ws://localhost:3001"
//! max_attempts = 5
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

use crate::client::ReconnectPolicy;
use crate::server::{ServerConfig, DEFAULT_MAX_CONTENT_LENGTH};

/// Default listening address (all interfaces)
pub const DEFAULT_BIND: &str = "0.0.0.0";

/// Default listening port
pub const DEFAULT_PORT: u16 = 3001;

/// Errors that can occur during config operations
#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Read(#[from] std::io::Error),
    #[error("Failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),
    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// `[server]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServerSection {
    /// Address to bind to
    pub bind: String,
    /// Port to listen on
    pub port: u16,
    /// Upper bound on a single socket write
    pub send_timeout_ms: u64,
    /// Per-connection outbound queue capacity
    pub outbound_queue: usize,
    /// Maximum accepted message content length in bytes
    pub max_message_bytes: usize,
}

impl Default for ServerSection {
    fn default() -> Self {
        Self {
            bind: DEFAULT_BIND.to_string(),
            port: DEFAULT_PORT,
            send_timeout_ms: 5_000,
            outbound_queue: 256,
            max_message_bytes: DEFAULT_MAX_CONTENT_LENGTH,
        }
    }
}

/// `[client]` section
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ClientSection {
    /// Relay endpoint, without the room query parameter
    pub url: String,
    /// Delay before the first reconnect, doubled per attempt
    pub base_delay_ms: u64,
    /// Upper bound on a single reconnect delay
    pub max_delay_ms: u64,
    /// Abnormal closures tolerated before giving up
    pub max_attempts: u32,
}

impl Default for ClientSection {
    fn default() -> Self {
        Self {
            url: format!("ws://localhost:{}", DEFAULT_PORT),
            base_delay_ms: 1_000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        }
    }
}

/// Root relay configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct RelayConfig {
    #[serde(default)]
    pub server: ServerSection,
    #[serde(default)]
    pub client: ClientSection,
}

impl RelayConfig {
    /// Load configuration from a TOML file
    ///
    /// A missing file yields the defaults.
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path)?;
        let config: RelayConfig = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Check values that would make the relay unusable
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.server.outbound_queue == 0 {
            return Err(ConfigError::Invalid(
                "server.outbound_queue must be at least 1".to_string(),
            ));
        }
        if self.server.send_timeout_ms == 0 {
            return Err(ConfigError::Invalid(
                "server.send_timeout_ms must be at least 1".to_string(),
            ));
        }
        if self.client.base_delay_ms > self.client.max_delay_ms {
            return Err(ConfigError::Invalid(format!(
                "client.base_delay_ms ({}) exceeds client.max_delay_ms ({})",
                self.client.base_delay_ms, self.client.max_delay_ms
            )));
        }
        Ok(())
    }

    /// Runtime settings for the relay server
    pub fn server_config(&self) -> ServerConfig {
        ServerConfig::new(self.server.bind.clone(), self.server.port)
            .with_send_timeout(Duration::from_millis(self.server.send_timeout_ms))
            .with_outbound_queue(self.server.outbound_queue)
            .with_max_message_bytes(self.server.max_message_bytes)
    }

    /// Reconnect policy for the relay client
    pub fn reconnect_policy(&self) -> ReconnectPolicy {
        ReconnectPolicy::new(
            Duration::from_millis(self.client.base_delay_ms),
            Duration::from_millis(self.client.max_delay_ms),
            self.client.max_attempts,
        )
    }
}
