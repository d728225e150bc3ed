//! Configuration types for s2s-agent.
//! Parsed from ~/.s2s/agent.toml.

use s2s_client::ClientConfig;
use s2s_queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub queue: QueueSection,
    #[serde(default)]
    pub agent: AgentSection,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueSection {
    #[serde(default = "default_database")]
    pub database: String,
    #[serde(flatten)]
    pub limits: QueueConfig,
}

impl Default for QueueSection {
    fn default() -> Self {
        Self {
            database: default_database(),
            limits: QueueConfig::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentSection {
    #[serde(default = "default_process_interval")]
    pub process_interval_secs: u64,
    #[serde(default = "default_cleanup_interval")]
    pub cleanup_interval_secs: u64,
    /// Attribute carrying an integer priority; higher drains first.
    #[serde(default = "default_priority_attribute")]
    pub priority_attribute: String,
    /// Attribute carrying a TTL in milliseconds; negative never expires.
    #[serde(default = "default_ttl_attribute")]
    pub ttl_attribute: String,
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            process_interval_secs: default_process_interval(),
            cleanup_interval_secs: default_cleanup_interval(),
            priority_attribute: default_priority_attribute(),
            ttl_attribute: default_ttl_attribute(),
        }
    }
}

fn default_database() -> String {
    "~/.s2s/queue.db".into()
}
fn default_process_interval() -> u64 {
    10
}
fn default_cleanup_interval() -> u64 {
    300
}
fn default_priority_attribute() -> String {
    "s2s.priority".into()
}
fn default_ttl_attribute() -> String {
    "s2s.ttl".into()
}

impl AgentConfig {
    /// Load config from file, or fall back to defaults if missing.
    pub fn load_or_default(path: &Path) -> anyhow::Result<Self> {
        if path.exists() {
            let content = std::fs::read_to_string(path)?;
            let config: AgentConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }
}
