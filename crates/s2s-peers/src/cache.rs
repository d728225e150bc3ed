//! On-disk peer-status cache (JSON).
//!
//! Stores addresses, load figures and the wall-clock refresh time. Failure
//! marks are monotonic instants and stay in memory only.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};

use crate::{Peer, PeerAddress, PeerStatus, Result};

#[derive(Debug, Serialize, Deserialize)]
struct CachedPeer {
    address: PeerAddress,
    flow_file_count: i32,
}

#[derive(Debug, Serialize, Deserialize)]
struct CachedStatus {
    last_update: DateTime<Utc>,
    peers: Vec<CachedPeer>,
}

pub struct PeerStatusCache {
    path: PathBuf,
}

impl PeerStatusCache {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the cached status, if any. The refresh instant is rebuilt from
    /// the stored wall-clock age so staleness checks keep working.
    pub fn load(&self) -> Result<Option<PeerStatus>> {
        if !self.path.exists() {
            return Ok(None);
        }
        let content = std::fs::read_to_string(&self.path)?;
        let cached: CachedStatus = serde_json::from_str(&content)?;

        let now = Instant::now();
        let age = (Utc::now() - cached.last_update)
            .to_std()
            .unwrap_or(Duration::ZERO);
        let last_update = now.checked_sub(age).unwrap_or(now);

        let peers = cached
            .peers
            .into_iter()
            .map(|p| Peer::new(p.address, p.flow_file_count))
            .collect();
        let mut status = PeerStatus::new(peers, now);
        status.last_update = last_update;

        tracing::debug!(
            path = %self.path.display(),
            peers = status.peers().len(),
            age_secs = age.as_secs(),
            "peers: loaded cached status"
        );
        Ok(Some(status))
    }

    pub fn save(&self, status: &PeerStatus) -> Result<()> {
        let age = Instant::now().saturating_duration_since(status.last_update());
        let last_update = Utc::now()
            - chrono::Duration::from_std(age).unwrap_or_else(|_| chrono::Duration::zero());
        let cached = CachedStatus {
            last_update,
            peers: status
                .peers()
                .iter()
                .map(|p| CachedPeer {
                    address: p.address().clone(),
                    flow_file_count: p.flow_file_count,
                })
                .collect(),
        };

        if let Some(parent) = self.path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        let tmp = self.path.with_extension("tmp");
        std::fs::write(&tmp, serde_json::to_vec_pretty(&cached)?)?;
        std::fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
