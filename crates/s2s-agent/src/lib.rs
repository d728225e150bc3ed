//! s2s-agent -- library half of the agent binary.
//!
//! Exposes config loading, queue construction and the drain loop so they can
//! be exercised without going through the CLI.

pub mod config;
pub mod drain_task;

use std::path::{Path, PathBuf};
use std::sync::Arc;

use s2s_client::{DataPacket, PersistentQueue, SiteToSiteClient};
use s2s_queue::{AttributePrioritizer, SqliteQueue};

use crate::config::AgentConfig;

pub fn expand_tilde(path: &str) -> PathBuf {
    if let Some(stripped) = path.strip_prefix("~/") {
        if let Some(home) = dirs_or_home() {
            return home.join(stripped);
        }
    }
    PathBuf::from(path)
}

pub fn dirs_or_home() -> Option<PathBuf> {
    std::env::var_os("HOME").map(PathBuf::from)
}

/// Build the client from `[client]`, expanding `~` in the cache path.
pub fn build_client(cfg: &AgentConfig) -> anyhow::Result<SiteToSiteClient> {
    let mut client_cfg = cfg.client.clone();
    if let Some(path) = client_cfg.peer_cache_path.take() {
        client_cfg.peer_cache_path = Some(expand_tilde(&path).to_string_lossy().into_owned());
    }
    Ok(SiteToSiteClient::new(client_cfg)?)
}

/// Open the queue database only; no client is needed for local operations.
pub fn open_store(cfg: &AgentConfig) -> anyhow::Result<SqliteQueue> {
    let db_path = expand_tilde(&cfg.queue.database);
    let prioritizer =
        AttributePrioritizer::new(&cfg.agent.priority_attribute, &cfg.agent.ttl_attribute);
    let store = SqliteQueue::open(&db_path, cfg.queue.limits.clone(), Box::new(prioritizer))?;
    tracing::debug!(db = %db_path.display(), "queue opened");
    Ok(store)
}

pub fn open_queue(cfg: &AgentConfig) -> anyhow::Result<PersistentQueue> {
    let store = open_store(cfg)?;
    let client = build_client(cfg)?;
    Ok(PersistentQueue::new(store, Arc::new(client)))
}

/// Read a file into a packet carrying `filename`, `path` and enqueue time.
pub fn packet_from_file(path: &Path) -> anyhow::Result<DataPacket> {
    let content = std::fs::read(path)?;
    let filename = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .ok_or_else(|| anyhow::anyhow!("not a file path: {}", path.display()))?;
    let dir = path
        .parent()
        .map(|p| p.to_string_lossy().into_owned())
        .unwrap_or_default();

    Ok(DataPacket::from_pairs(
        [
            ("filename", filename),
            ("path", dir),
            ("s2s.enqueued_at", chrono::Utc::now().to_rfc3339()),
        ],
        content,
    ))
}
