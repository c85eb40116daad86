//! Configuration loading and validation

use anyhow::{Context, Result};
use serde::Deserialize;
use std::path::Path;

/// Main configuration structure
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub host: HostConfig,
    #[serde(default)]
    pub session: SessionConfig,
    #[serde(default)]
    pub watcher: WatcherConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub store: StoreConfig,
}

/// Which extension host implementation backs the extension signer
#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum HostMode {
    /// In-process simulated host (demo, tests)
    Simulated,

    /// WebSocket bridge to a companion signer process
    Websocket,
}

/// Extension host connection settings
#[derive(Debug, Clone, Deserialize)]
pub struct HostConfig {
    #[serde(default = "default_host_mode")]
    pub mode: HostMode,
    #[serde(default = "default_host_ws_url")]
    pub ws_url: String,
    #[serde(default = "default_reconnect_delay_ms")]
    pub reconnect_delay_ms: u64,
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_ping_interval_secs")]
    pub ping_interval_secs: u64,
    /// How long to wait for the signer to answer one request
    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            mode: default_host_mode(),
            ws_url: default_host_ws_url(),
            reconnect_delay_ms: default_reconnect_delay_ms(),
            max_reconnect_attempts: default_max_reconnect_attempts(),
            ping_interval_secs: default_ping_interval_secs(),
            request_timeout_secs: default_request_timeout_secs(),
        }
    }
}

/// Session coordination timeouts
#[derive(Debug, Clone, Deserialize)]
pub struct SessionConfig {
    /// Upper bound on one connect attempt, in seconds. 0 disables the bound
    /// and a hung signer keeps the session in connecting until it answers.
    #[serde(default = "default_connect_timeout_secs")]
    pub connect_timeout_secs: u64,

    /// Upper bound on each adapter disconnect, in milliseconds
    #[serde(default = "default_disconnect_timeout_ms")]
    pub disconnect_timeout_ms: u64,

    /// Background balance refresh period while a session is active, in
    /// seconds. 0 disables periodic refresh
    #[serde(default = "default_balance_refresh_secs")]
    pub balance_refresh_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            connect_timeout_secs: default_connect_timeout_secs(),
            disconnect_timeout_ms: default_disconnect_timeout_ms(),
            balance_refresh_secs: default_balance_refresh_secs(),
        }
    }
}

/// Reconciliation watcher settings
#[derive(Debug, Clone, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            poll_interval_ms: default_poll_interval_ms(),
        }
    }
}

/// Balance RPC settings
#[derive(Debug, Clone, Deserialize)]
pub struct RpcConfig {
    #[serde(default = "default_rpc_endpoint")]
    pub endpoint: String,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            endpoint: default_rpc_endpoint(),
            timeout_ms: default_timeout_ms(),
            max_retries: default_max_retries(),
        }
    }
}

/// Credential store settings
#[derive(Debug, Clone, Deserialize)]
pub struct StoreConfig {
    /// Path to the passkey credentials file
    #[serde(default = "default_store_path")]
    pub path: String,

    /// Device fingerprint override; empty means derive from the environment
    #[serde(default)]
    pub device_fingerprint: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            path: default_store_path(),
            device_fingerprint: String::new(),
        }
    }
}

// Default value functions
fn default_host_mode() -> HostMode {
    HostMode::Simulated
}

fn default_host_ws_url() -> String {
    "ws://127.0.0.1:9272/signer".into()
}

fn default_reconnect_delay_ms() -> u64 {
    1000
}

fn default_max_reconnect_attempts() -> u32 {
    10
}

fn default_ping_interval_secs() -> u64 {
    30
}

fn default_request_timeout_secs() -> u64 {
    120
}

fn default_connect_timeout_secs() -> u64 {
    90
}

fn default_disconnect_timeout_ms() -> u64 {
    2000
}

fn default_balance_refresh_secs() -> u64 {
    30
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_rpc_endpoint() -> String {
    std::env::var("RPC_ENDPOINT").unwrap_or_else(|_| "https://api.mainnet-beta.solana.com".into())
}

fn default_timeout_ms() -> u64 {
    30000
}

fn default_max_retries() -> u32 {
    3
}

fn default_store_path() -> String {
    "credentials/credentials.json".to_string()
}

fn default_true() -> bool {
    true
}

impl Config {
    /// Load configuration from file and environment variables
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();

        let settings = config::Config::builder()
            // Start with defaults
            .set_default("rpc.endpoint", default_rpc_endpoint())?
            .set_default("rpc.timeout_ms", default_timeout_ms() as i64)?
            .set_default("rpc.max_retries", default_max_retries() as i64)?
            // Load from file if exists
            .add_source(config::File::from(path).required(false))
            // Override with environment variables (prefix WSM_)
            .add_source(
                config::Environment::with_prefix("WSM")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()
            .context("Failed to build configuration")?;

        let config: Config = settings
            .try_deserialize()
            .context("Failed to deserialize configuration")?;

        // Validate configuration
        config.validate()?;

        Ok(config)
    }

    /// Validate configuration values
    fn validate(&self) -> Result<()> {
        if self.session.disconnect_timeout_ms == 0 {
            anyhow::bail!("disconnect_timeout_ms must be positive");
        }

        if self.watcher.poll_interval_ms == 0 {
            anyhow::bail!("poll_interval_ms must be positive");
        }

        if self.host.mode == HostMode::Websocket {
            url::Url::parse(&self.host.ws_url)
                .with_context(|| format!("Invalid host ws_url: {}", self.host.ws_url))?;

            if self.host.max_reconnect_attempts == 0 {
                anyhow::bail!("max_reconnect_attempts must be at least 1");
            }
        }

        if self.rpc.endpoint.is_empty() {
            anyhow::bail!("rpc.endpoint must not be empty");
        }

        if self.store.path.is_empty() {
            anyhow::bail!("store.path must not be empty");
        }

        Ok(())
    }

    /// Get masked configuration for display (hide secrets)
    pub fn masked_display(&self) -> String {
        format!(
            r#"Configuration:
  Host:
    mode: {}
    ws_url: {}
    reconnect: {} attempts, {}ms delay
    request_timeout: {}s
  Session:
    connect_timeout: {}
    disconnect_timeout: {}ms
    balance_refresh: {}s
  Watcher:
    enabled: {}
    poll_interval: {}ms
  RPC:
    endpoint: {}
    timeout: {}ms
  Store:
    path: {}
"#,
            match self.host.mode {
                HostMode::Simulated => "simulated",
                HostMode::Websocket => "websocket",
            },
            mask_url(&self.host.ws_url),
            self.host.max_reconnect_attempts,
            self.host.reconnect_delay_ms,
            self.host.request_timeout_secs,
            if self.session.connect_timeout_secs == 0 {
                "unbounded".to_string()
            } else {
                format!("{}s", self.session.connect_timeout_secs)
            },
            self.session.disconnect_timeout_ms,
            self.session.balance_refresh_secs,
            self.watcher.enabled,
            self.watcher.poll_interval_ms,
            mask_url(&self.rpc.endpoint),
            self.rpc.timeout_ms,
            self.store.path,
        )
    }
}

/// Mask URL for display (hide API keys in query params)
fn mask_url(url: &str) -> String {
    if let Some(idx) = url.find('?') {
        format!("{}?***", &url[..idx])
    } else {
        url.to_string()
    }
}

impl Default for Config {
    fn default() -> Self {
        Self {
            host: HostConfig::default(),
            session: SessionConfig::default(),
            watcher: WatcherConfig::default(),
            rpc: RpcConfig::default(),
            store: StoreConfig::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = Config::default();
        assert_eq!(config.host.mode, HostMode::Simulated);
        assert_eq!(config.session.connect_timeout_secs, 90);
        assert_eq!(config.session.disconnect_timeout_ms, 2000);
        assert!(config.watcher.enabled);
    }

    #[test]
    fn test_host_mode_deserialize() {
        let json = r#""websocket""#;
        let mode: HostMode = serde_json::from_str(json).unwrap();
        assert_eq!(mode, HostMode::Websocket);
    }

    #[test]
    fn test_validate_rejects_zero_disconnect_timeout() {
        let mut config = Config::default();
        config.session.disconnect_timeout_ms = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_rejects_bad_ws_url() {
        let mut config = Config::default();
        config.host.mode = HostMode::Websocket;
        config.host.ws_url = "not a url".into();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_mask_url() {
        assert_eq!(
            mask_url("https://api.example.com?key=secret"),
            "https://api.example.com?***"
        );
        assert_eq!(
            mask_url("https://api.example.com"),
            "https://api.example.com"
        );
    }
}
