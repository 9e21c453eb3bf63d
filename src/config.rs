use anyhow::{anyhow, Result};
use log::info;
use serde::{Deserialize, Serialize};
use std::fs::{self, File};
use std::io::Read;
use std::path::{Path, PathBuf};
use std::time::Duration;

/// Timing and size knobs of the sync engine
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SyncConfig {
    /// Longest accepted message, in characters
    pub max_message_length: usize,
    /// How long a transmitted message may wait for its ack
    pub ack_timeout_ms: u64,
    /// How long a receipt for an unknown message is held back
    pub receipt_grace_ms: u64,
    /// Coalescing window of the read-receipt batcher
    pub read_batch_window_ms: u64,
    /// Quiet period after the last keystroke before typing stops
    pub typing_debounce_ms: u64,
    /// Hard limit on how long a remote typing indicator stays up
    pub typing_timeout_ms: u64,
    /// Freshness of cached presence
    pub presence_ttl_ms: u64,
    pub backoff: BackoffConfig,
}

/// Reconnect backoff
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackoffConfig {
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub jitter_ms: u64,
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            max_message_length: 4096,
            ack_timeout_ms: 10_000,
            receipt_grace_ms: 5_000,
            read_batch_window_ms: 500,
            typing_debounce_ms: 3_000,
            typing_timeout_ms: 10_000,
            presence_ttl_ms: 60_000,
            backoff: BackoffConfig::default(),
        }
    }
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            jitter_ms: 250,
        }
    }
}

impl SyncConfig {
    pub fn ack_timeout(&self) -> Duration {
        Duration::from_millis(self.ack_timeout_ms)
    }

    pub fn receipt_grace(&self) -> Duration {
        Duration::from_millis(self.receipt_grace_ms)
    }

    pub fn read_batch_window(&self) -> Duration {
        Duration::from_millis(self.read_batch_window_ms)
    }

    pub fn typing_debounce(&self) -> Duration {
        Duration::from_millis(self.typing_debounce_ms)
    }

    pub fn typing_timeout(&self) -> Duration {
        Duration::from_millis(self.typing_timeout_ms)
    }

    pub fn presence_ttl(&self) -> Duration {
        Duration::from_millis(self.presence_ttl_ms)
    }

    pub fn load(path: &Path) -> Result<Self> {
        let mut file = File::open(path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;
        let config: SyncConfig = serde_json::from_str(&contents)?;
        info!("Loaded sync configuration from {}", path.display());
        Ok(config)
    }

    /// Config from `path`, else `<config dir>/chatsync/config.json`, else defaults.
    pub fn load_or_default(path: Option<&Path>) -> Result<Self> {
        if let Some(path) = path {
            return Self::load(path);
        }
        let default_path = get_config_dir()?.join("config.json");
        if default_path.exists() {
            Self::load(&default_path)
        } else {
            Ok(Self::default())
        }
    }
}

impl BackoffConfig {
    /// Delay before reconnect attempt `attempt` (1-based), without jitter.
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(20);
        let delay = self.initial_delay_ms.saturating_mul(1u64 << exponent);
        Duration::from_millis(delay.min(self.max_delay_ms))
    }
}

pub fn get_config_dir() -> Result<PathBuf> {
    let config_dir = dirs::config_dir()
        .ok_or_else(|| anyhow!("Could not determine config directory"))?
        .join("chatsync");

    if !config_dir.exists() {
        fs::create_dir_all(&config_dir)?;
    }

    Ok(config_dir)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_backoff_is_capped() {
        let backoff = BackoffConfig {
            initial_delay_ms: 100,
            max_delay_ms: 1_000,
            jitter_ms: 0,
        };
        assert_eq!(backoff.delay_for(1), Duration::from_millis(100));
        assert_eq!(backoff.delay_for(2), Duration::from_millis(200));
        assert_eq!(backoff.delay_for(4), Duration::from_millis(800));
        assert_eq!(backoff.delay_for(5), Duration::from_millis(1_000));
        assert_eq!(backoff.delay_for(500), Duration::from_millis(1_000));
    }

    #[test]
    fn test_partial_config_uses_defaults() {
        let config: SyncConfig =
            serde_json::from_str(r#"{"ack_timeout_ms": 50, "backoff": {"jitter_ms": 0}}"#).unwrap();
        assert_eq!(config.ack_timeout(), Duration::from_millis(50));
        assert_eq!(config.max_message_length, 4096);
        assert_eq!(config.backoff.jitter_ms, 0);
        assert_eq!(config.backoff.initial_delay_ms, 500);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("config.json");
        std::fs::write(&path, r#"{"presence_ttl_ms": 1234}"#).unwrap();
        let config = SyncConfig::load_or_default(Some(&path)).unwrap();
        assert_eq!(config.presence_ttl_ms, 1234);
    }
}
