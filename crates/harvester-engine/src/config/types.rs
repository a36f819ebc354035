use std::time::Duration;

use serde::{Deserialize, Serialize};

use harvester_types::connection::Connection;
use harvester_types::job::JobDescription;

use crate::channel::DEFAULT_CHANNEL_CAPACITY;

/// Top-level engine configuration file.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EngineConfig {
    #[serde(default)]
    pub state: StateConfig,
    #[serde(default)]
    pub engine: EngineSettings,
    /// Saved (created or replaced) at startup.
    #[serde(default)]
    pub connections: Vec<Connection>,
    /// Created at startup unless a job of the same name exists.
    #[serde(default)]
    pub jobs: Vec<JobDescription>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateConfig {
    /// `sqlite` or `postgres`.
    #[serde(default = "default_backend")]
    pub backend: String,
    /// SQLite file path, or PostgreSQL connection string.
    pub connection: Option<String>,
}

pub const DEFAULT_SQLITE_PATH: &str = "harvester.db";

fn default_backend() -> String {
    "sqlite".to_string()
}

impl Default for StateConfig {
    fn default() -> Self {
        Self {
            backend: default_backend(),
            connection: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct EngineSettings {
    #[serde(default = "default_workers")]
    pub workers: usize,
    #[serde(default = "default_claim_batch_size")]
    pub claim_batch_size: usize,
    /// Transient retries per document before it is marked Error.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
    #[serde(default = "default_seeding_batch_size")]
    pub seeding_batch_size: usize,
    #[serde(default = "default_deletion_batch_size")]
    pub deletion_batch_size: usize,
    #[serde(default = "default_channel_capacity")]
    pub channel_capacity: usize,
    /// Coordinator and idle-worker polling interval.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    #[serde(default = "default_janitor_interval_ms")]
    pub janitor_interval_ms: u64,
    #[serde(default = "default_idle_timeout_secs")]
    pub idle_timeout_secs: u64,
}

fn default_workers() -> usize {
    4
}
fn default_claim_batch_size() -> usize {
    16
}
fn default_max_retries() -> u32 {
    5
}
fn default_seeding_batch_size() -> usize {
    100
}
fn default_deletion_batch_size() -> usize {
    100
}
fn default_channel_capacity() -> usize {
    DEFAULT_CHANNEL_CAPACITY
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_janitor_interval_ms() -> u64 {
    5_000
}
fn default_idle_timeout_secs() -> u64 {
    300
}

impl Default for EngineSettings {
    fn default() -> Self {
        Self {
            workers: default_workers(),
            claim_batch_size: default_claim_batch_size(),
            max_retries: default_max_retries(),
            seeding_batch_size: default_seeding_batch_size(),
            deletion_batch_size: default_deletion_batch_size(),
            channel_capacity: default_channel_capacity(),
            poll_interval_ms: default_poll_interval_ms(),
            janitor_interval_ms: default_janitor_interval_ms(),
            idle_timeout_secs: default_idle_timeout_secs(),
        }
    }
}

impl EngineSettings {
    #[must_use]
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    #[must_use]
    pub fn janitor_interval(&self) -> Duration {
        Duration::from_millis(self.janitor_interval_ms)
    }

    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_document_uses_defaults() {
        let config: EngineConfig = serde_yaml::from_str("{}").unwrap();
        assert_eq!(config.state.backend, "sqlite");
        assert_eq!(config.engine, EngineSettings::default());
        assert_eq!(config.engine.janitor_interval(), Duration::from_secs(5));
        assert!(config.connections.is_empty());
    }

    #[test]
    fn partial_settings_keep_other_defaults() {
        let config: EngineConfig =
            serde_yaml::from_str("engine:\n  workers: 9\n  max_retries: 2\n").unwrap();
        assert_eq!(config.engine.workers, 9);
        assert_eq!(config.engine.max_retries, 2);
        assert_eq!(config.engine.claim_batch_size, 16);
    }
}
