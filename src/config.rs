//! Configuration loading and defaults.
//!
//! Configuration is resolved in order of precedence (highest wins):
//!
//! 1. **Environment variables** — `CMDRELAY_LISTEN`, `CMDRELAY_URL`,
//!    `CMDRELAY_LOG`
//! 2. **Config file** — path via `--config <path>`, or `cmdrelay.toml` in CWD
//! 3. **Compiled defaults** — see each field's default value below
//!
//! The TOML file mirrors the struct hierarchy:
//!
//! ```toml
//! [server]
//! listen = "127.0.0.1:3055"       # loopback only
//! command_timeout_ms = 30000       # worker-bound command window
//! outbound_queue = 256             # per-connection frame queue
//!
//! [client]
//! url = "ws://127.0.0.1:3055"
//! command_timeout_ms = 10000
//! admin_timeout_ms = 10000         # register, create_channel, get_channels
//! status_timeout_ms = 5000         # check_figma_connection
//! reconnect_attempts = 3
//! reconnect_base_delay_ms = 1000   # doubles each attempt
//!
//! [logging]
//! level = "info"
//!
//! [events]
//! enabled = ["client_connected", "command_received", "command_result"]
//! server_id = "server_1"           # omit to auto-generate
//! ```

use std::net::SocketAddr;
use std::path::Path;
use std::time::Duration;

use serde::Deserialize;

use crate::error::ConfigError;
use crate::events::{default_trigger_kinds, TriggerKind};

/// Default config file looked up in the working directory.
pub const DEFAULT_CONFIG_FILE: &str = "cmdrelay.toml";

/// Top-level configuration, deserialized from TOML.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub logging: LoggingConfig,
    #[serde(default)]
    pub events: EventsConfig,
}

/// Broker settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Socket address to bind (default `127.0.0.1:3055`). Must be loopback.
    #[serde(default = "default_listen")]
    pub listen: String,
    /// How long a forwarded command may wait for its worker (default 30 000 ms).
    #[serde(default = "default_command_timeout_ms")]
    pub command_timeout_ms: u64,
    /// Outbound frames buffered per connection before drops (default 256).
    #[serde(default = "default_outbound_queue")]
    pub outbound_queue: usize,
}

/// Remote relay client settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ClientConfig {
    /// Broker URL (default `ws://127.0.0.1:3055`).
    #[serde(default = "default_url")]
    pub url: String,
    #[serde(default = "default_client_command_timeout_ms")]
    pub command_timeout_ms: u64,
    #[serde(default = "default_admin_timeout_ms")]
    pub admin_timeout_ms: u64,
    #[serde(default = "default_status_timeout_ms")]
    pub status_timeout_ms: u64,
    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,
    #[serde(default = "default_reconnect_base_delay_ms")]
    pub reconnect_base_delay_ms: u64,
}

/// Logging configuration.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// tracing filter level (default `info`). Overridden by `RUST_LOG`.
    #[serde(default = "default_log_level")]
    pub level: String,
}

/// Workflow-trigger feed printed by `cmdrelay serve --events`.
#[derive(Debug, Clone, Deserialize)]
pub struct EventsConfig {
    #[serde(default = "default_trigger_kinds")]
    pub enabled: Vec<TriggerKind>,
    pub server_id: Option<String>,
}

fn default_listen() -> String {
    "127.0.0.1:3055".to_string()
}
fn default_command_timeout_ms() -> u64 {
    30_000
}
fn default_client_command_timeout_ms() -> u64 {
    10_000
}
fn default_outbound_queue() -> usize {
    256
}
fn default_url() -> String {
    "ws://127.0.0.1:3055".to_string()
}
fn default_admin_timeout_ms() -> u64 {
    10_000
}
fn default_status_timeout_ms() -> u64 {
    5_000
}
fn default_reconnect_attempts() -> u32 {
    3
}
fn default_reconnect_base_delay_ms() -> u64 {
    1_000
}
fn default_log_level() -> String {
    "info".to_string()
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            listen: default_listen(),
            command_timeout_ms: default_command_timeout_ms(),
            outbound_queue: default_outbound_queue(),
        }
    }
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            url: default_url(),
            command_timeout_ms: default_client_command_timeout_ms(),
            admin_timeout_ms: default_admin_timeout_ms(),
            status_timeout_ms: default_status_timeout_ms(),
            reconnect_attempts: default_reconnect_attempts(),
            reconnect_base_delay_ms: default_reconnect_base_delay_ms(),
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

impl Default for EventsConfig {
    fn default() -> Self {
        Self {
            enabled: default_trigger_kinds(),
            server_id: None,
        }
    }
}

impl ServerConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    /// Parse `listen` and enforce the loopback-only policy.
    pub fn listen_addr(&self) -> Result<SocketAddr, ConfigError> {
        let addr: SocketAddr = self
            .listen
            .parse()
            .map_err(|_| ConfigError::InvalidListen(self.listen.clone()))?;
        if !addr.ip().is_loopback() {
            return Err(ConfigError::NotLoopback(self.listen.clone()));
        }
        Ok(addr)
    }
}

impl ClientConfig {
    #[must_use]
    pub fn command_timeout(&self) -> Duration {
        Duration::from_millis(self.command_timeout_ms)
    }

    #[must_use]
    pub fn admin_timeout(&self) -> Duration {
        Duration::from_millis(self.admin_timeout_ms)
    }

    #[must_use]
    pub fn status_timeout(&self) -> Duration {
        Duration::from_millis(self.status_timeout_ms)
    }

    /// Delay before reconnect attempt `attempt` (1-based): base × 2^(n-1).
    #[must_use]
    pub fn reconnect_delay(&self, attempt: u32) -> Duration {
        let factor = 1u64 << attempt.saturating_sub(1).min(16);
        Duration::from_millis(self.reconnect_base_delay_ms.saturating_mul(factor))
    }
}

impl Config {
    /// Load configuration with the precedence chain: env vars > file > defaults.
    ///
    /// If `path` is `Some`, that file must exist and parse. Otherwise looks for
    /// `cmdrelay.toml` in the current directory, falling back to defaults.
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        let mut config = match path {
            Some(p) => Self::from_file(p)?,
            None if Path::new(DEFAULT_CONFIG_FILE).exists() => Self::from_file(DEFAULT_CONFIG_FILE)?,
            None => Self::default(),
        };

        // Env var overrides
        if let Ok(listen) = std::env::var("CMDRELAY_LISTEN") {
            config.server.listen = listen;
        }
        if let Ok(url) = std::env::var("CMDRELAY_URL") {
            config.client.url = url;
        }
        if let Ok(level) = std::env::var("CMDRELAY_LOG") {
            config.logging.level = level;
        }

        Ok(config)
    }

    fn from_file(path: &str) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_string(),
            source,
        })?;
        Self::parse(&content).map_err(|source| ConfigError::Parse {
            path: path.to_string(),
            source,
        })
    }

    /// Parse TOML text.
    pub fn parse(content: &str) -> Result<Self, toml::de::Error> {
        toml::from_str(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_documented_values() {
        let config = Config::default();
        assert_eq!(config.server.listen, "127.0.0.1:3055");
        assert_eq!(config.server.command_timeout(), Duration::from_secs(30));
        assert_eq!(config.client.command_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.admin_timeout(), Duration::from_secs(10));
        assert_eq!(config.client.status_timeout(), Duration::from_secs(5));
        assert_eq!(config.client.reconnect_attempts, 3);
        assert_eq!(config.events.enabled, default_trigger_kinds());
    }

    #[test]
    fn partial_file_keeps_other_defaults() {
        let config = Config::parse(
            r#"
            [server]
            command_timeout_ms = 500

            [events]
            enabled = ["worker_event"]
            "#,
        )
        .unwrap();
        assert_eq!(config.server.command_timeout_ms, 500);
        assert_eq!(config.server.listen, "127.0.0.1:3055");
        assert_eq!(config.client.url, "ws://127.0.0.1:3055");
        assert_eq!(config.events.enabled, vec![TriggerKind::WorkerEvent]);
    }

    #[test]
    fn non_loopback_listen_refused() {
        let server = ServerConfig {
            listen: "0.0.0.0:3055".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(
            server.listen_addr(),
            Err(ConfigError::NotLoopback(_))
        ));
        let bad = ServerConfig {
            listen: "localhost".into(),
            ..ServerConfig::default()
        };
        assert!(matches!(bad.listen_addr(), Err(ConfigError::InvalidListen(_))));
        assert!(ServerConfig::default().listen_addr().is_ok());
    }

    #[test]
    fn reconnect_delay_doubles() {
        let client = ClientConfig::default();
        assert_eq!(client.reconnect_delay(1), Duration::from_secs(1));
        assert_eq!(client.reconnect_delay(2), Duration::from_secs(2));
        assert_eq!(client.reconnect_delay(3), Duration::from_secs(4));
    }
}
