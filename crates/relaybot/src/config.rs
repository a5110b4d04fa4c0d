use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::time::Duration;

use tokio::fs;

use serde::Deserialize;
use thiserror::Error;

// ============================================================================
// Config (root)
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct Config {
    pub account: AccountConfig,
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub reply: ReplyConfig,
    #[serde(default)]
    pub stream: StreamConfig,
    #[serde(default = "default_store_dir")]
    pub store_dir: PathBuf,
}

impl Config {
    /// Load the config from a YAML file.
    ///
    /// Unlike the tuning sections, a missing file is an error here: the
    /// account credentials have no usable default.
    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let contents = match fs::read_to_string(path).await {
            Ok(c) => c,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                return Err(ConfigError::NotFound(path.to_path_buf()));
            }
            Err(e) => return Err(ConfigError::Io(e)),
        };
        Ok(serde_saphyr::from_str(&contents)?)
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from(".relaybot/sessions")
}

// ============================================================================
// AccountConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct AccountConfig {
    /// The bot account id this process connects on behalf of.
    pub app_id: String,
    pub client_secret: String,
    #[serde(default = "default_api_base")]
    pub api_base: String,
}

fn default_api_base() -> String {
    "https://api.relay.example".to_string()
}

// ============================================================================
// GatewayConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_max_reconnect_attempts")]
    pub max_reconnect_attempts: u32,
    #[serde(default = "default_hello_timeout")]
    pub hello_timeout_seconds: u64,
    /// Minimum spacing between sequence-number persistence writes.
    #[serde(default = "default_seq_persist_interval")]
    pub seq_persist_interval_seconds: u64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            max_reconnect_attempts: default_max_reconnect_attempts(),
            hello_timeout_seconds: default_hello_timeout(),
            seq_persist_interval_seconds: default_seq_persist_interval(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

impl GatewayConfig {
    pub fn hello_timeout(&self) -> Duration {
        Duration::from_secs(self.hello_timeout_seconds)
    }

    pub fn seq_persist_interval(&self) -> Duration {
        Duration::from_secs(self.seq_persist_interval_seconds)
    }
}

fn default_max_reconnect_attempts() -> u32 {
    30
}

fn default_hello_timeout() -> u64 {
    30
}

fn default_seq_persist_interval() -> u64 {
    30
}

fn default_queue_capacity() -> usize {
    256
}

// ============================================================================
// ReplyConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct ReplyConfig {
    /// Passive replies allowed per inbound message id.
    #[serde(default = "default_max_passive_replies")]
    pub max_passive_replies: u32,
    /// Window (from the first reply) in which passive replies stay valid.
    #[serde(default = "default_passive_window")]
    pub passive_window_seconds: u64,
    /// How long the dispatch engine may take before a degraded notice.
    #[serde(default = "default_generation_timeout")]
    pub generation_timeout_seconds: u64,
}

impl Default for ReplyConfig {
    fn default() -> Self {
        Self {
            max_passive_replies: default_max_passive_replies(),
            passive_window_seconds: default_passive_window(),
            generation_timeout_seconds: default_generation_timeout(),
        }
    }
}

impl ReplyConfig {
    pub fn passive_window(&self) -> Duration {
        Duration::from_secs(self.passive_window_seconds)
    }

    pub fn generation_timeout(&self) -> Duration {
        Duration::from_secs(self.generation_timeout_seconds)
    }
}

fn default_max_passive_replies() -> u32 {
    5
}

fn default_passive_window() -> u64 {
    300
}

fn default_generation_timeout() -> u64 {
    60
}

// ============================================================================
// StreamConfig
// ============================================================================

#[derive(Debug, Deserialize)]
pub struct StreamConfig {
    /// Minimum spacing between content chunk sends.
    #[serde(default = "default_min_send_interval_ms")]
    pub min_send_interval_ms: u64,
    /// Silence after the last content chunk before the first keepalive.
    #[serde(default = "default_keepalive_initial_ms")]
    pub keepalive_initial_ms: u64,
    /// Gap between consecutive keepalives.
    #[serde(default = "default_keepalive_gap_ms")]
    pub keepalive_gap_ms: u64,
    /// Consecutive keepalives allowed since the last content chunk.
    #[serde(default = "default_max_keepalives")]
    pub max_keepalives: u32,
    /// Hard cap on the lifetime of one streamed turn.
    #[serde(default = "default_max_stream_seconds")]
    pub max_stream_seconds: u64,
}

impl Default for StreamConfig {
    fn default() -> Self {
        Self {
            min_send_interval_ms: default_min_send_interval_ms(),
            keepalive_initial_ms: default_keepalive_initial_ms(),
            keepalive_gap_ms: default_keepalive_gap_ms(),
            max_keepalives: default_max_keepalives(),
            max_stream_seconds: default_max_stream_seconds(),
        }
    }
}

impl StreamConfig {
    pub fn min_send_interval(&self) -> Duration {
        Duration::from_millis(self.min_send_interval_ms)
    }

    pub fn keepalive_initial(&self) -> Duration {
        Duration::from_millis(self.keepalive_initial_ms)
    }

    pub fn keepalive_gap(&self) -> Duration {
        Duration::from_millis(self.keepalive_gap_ms)
    }

    pub fn max_stream_duration(&self) -> Duration {
        Duration::from_secs(self.max_stream_seconds)
    }
}

fn default_min_send_interval_ms() -> u64 {
    1000
}

fn default_keepalive_initial_ms() -> u64 {
    4000
}

fn default_keepalive_gap_ms() -> u64 {
    8000
}

fn default_max_keepalives() -> u32 {
    5
}

fn default_max_stream_seconds() -> u64 {
    90
}

// ============================================================================
// ConfigError
// ============================================================================

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("config file not found: {0}")]
    NotFound(PathBuf),

    #[error("failed to read config file: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to parse config file: {0}")]
    Yaml(#[from] serde_saphyr::Error),
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::{NamedTempFile, TempDir};

    #[tokio::test]
    async fn load_missing_file_is_error() {
        let tmp_dir = TempDir::new().unwrap();
        let missing = tmp_dir.path().join("missing.yaml");
        let result = Config::load(&missing).await;
        assert!(matches!(result, Err(ConfigError::NotFound(_))));
    }

    #[tokio::test]
    async fn load_minimal_yaml_uses_defaults() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
account:
  app_id: "10001"
  client_secret: "shh"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.account.app_id, "10001");
        assert_eq!(config.account.api_base, "https://api.relay.example");
        assert_eq!(config.gateway.max_reconnect_attempts, 30);
        assert_eq!(config.gateway.queue_capacity, 256);
        assert_eq!(config.reply.max_passive_replies, 5);
        assert_eq!(config.reply.passive_window_seconds, 300);
        assert_eq!(config.stream.min_send_interval_ms, 1000);
        assert_eq!(config.stream.max_keepalives, 5);
        assert_eq!(config.store_dir, PathBuf::from(".relaybot/sessions"));
    }

    #[tokio::test]
    async fn load_overrides_tuning_sections() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(
            file,
            r#"
account:
  app_id: "10001"
  client_secret: "shh"
gateway:
  max_reconnect_attempts: 5
  seq_persist_interval_seconds: 10
reply:
  max_passive_replies: 2
stream:
  max_stream_seconds: 30
store_dir: "/tmp/relay-sessions"
"#
        )
        .unwrap();

        let config = Config::load(file.path()).await.unwrap();
        assert_eq!(config.gateway.max_reconnect_attempts, 5);
        assert_eq!(
            config.gateway.seq_persist_interval(),
            Duration::from_secs(10)
        );
        assert_eq!(config.reply.max_passive_replies, 2);
        assert_eq!(
            config.stream.max_stream_duration(),
            Duration::from_secs(30)
        );
        assert_eq!(config.store_dir, PathBuf::from("/tmp/relay-sessions"));
    }

    #[tokio::test]
    async fn load_invalid_yaml() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "account: [not: a: mapping").unwrap();

        assert!(Config::load(file.path()).await.is_err());
    }
}
