//! PeerTracker -- picks peers in order and fails over between them.
//!
//! Holds the current `PeerStatus` snapshot. Refreshes are single-flight:
//! while one caller fetches a new peer list, others keep working from the
//! current snapshot instead of waiting.

use s2s_peers::{Peer, PeerAddress, PeerStatus, PeerStatusCache};
use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::connector::{Connector, ConnectorFactory};
use crate::error::{ClientError, Result};

pub struct PeerTracker {
    status: Mutex<PeerStatus>,
    seeds: Vec<PeerAddress>,
    factory: ConnectorFactory,
    cache: Option<PeerStatusCache>,
    update_interval: Duration,
    refresh_lock: tokio::sync::Mutex<()>,
    /// Set until the first successful refresh when starting from bare seeds.
    needs_refresh: AtomicBool,
    /// Start of the latest refresh attempt, successful or not.
    last_refresh_attempt: Mutex<Option<Instant>>,
}

impl PeerTracker {
    pub fn new(config: &ClientConfig, factory: ConnectorFactory) -> Result<Self> {
        let seeds = config.seed_addresses()?;
        let cache = config.peer_cache_path.as_deref().map(PeerStatusCache::new);

        let cached = match cache.as_ref().map(PeerStatusCache::load) {
            Some(Ok(Some(status))) if !status.is_empty() => Some(status),
            Some(Err(e)) => {
                tracing::warn!(error = %e, "tracker: ignoring unreadable peer cache");
                None
            }
            _ => None,
        };

        let (status, needs_refresh) = match cached {
            Some(mut status) => {
                let added = status.include_seeds(&seeds);
                tracing::info!(
                    peers = status.peers().len(),
                    seeds_added = added,
                    "tracker: loaded cached peers"
                );
                (status, false)
            }
            None => (PeerStatus::from_seeds(&seeds, Instant::now()), true),
        };

        Ok(Self {
            status: Mutex::new(status),
            seeds,
            factory,
            cache,
            update_interval: config.peer_update_interval(),
            refresh_lock: tokio::sync::Mutex::new(()),
            needs_refresh: AtomicBool::new(needs_refresh),
            last_refresh_attempt: Mutex::new(None),
        })
    }

    fn lock_status(&self) -> MutexGuard<'_, PeerStatus> {
        self.status.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Current peers, in preference order.
    pub fn peers(&self) -> Vec<Peer> {
        self.lock_status().peers().to_vec()
    }

    pub fn seeds(&self) -> &[PeerAddress] {
        &self.seeds
    }

    pub fn factory(&self) -> &ConnectorFactory {
        &self.factory
    }

    /// A refresh is due when starting from seeds or when the snapshot is
    /// stale, but at most once per update interval.
    fn refresh_due(&self) -> bool {
        let now = Instant::now();
        let attempted = *self
            .last_refresh_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if attempted.is_some_and(|t| now.saturating_duration_since(t) < self.update_interval) {
            return false;
        }
        self.needs_refresh.load(Ordering::Acquire)
            || self.lock_status().is_stale(self.update_interval, now)
    }

    /// Run `op` against peers in order until one succeeds.
    ///
    /// Peers that do not serve the configured transport are skipped. A peer
    /// whose attempt fails with a network or protocol error is marked failed
    /// and the next one is tried. Other errors are returned at once.
    pub async fn perform_operation<T, F, Fut>(&self, op: F) -> Result<T>
    where
        F: FnMut(Peer, Connector) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        if self.refresh_due() {
            if let Err(e) = self.update_peers().await {
                tracing::warn!(error = %e, "tracker: peer refresh failed, using current peers");
            }
        }
        self.try_peers(op).await
    }

    async fn try_peers<T, F, Fut>(&self, mut op: F) -> Result<T>
    where
        F: FnMut(Peer, Connector) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let candidates = self.peers();
        let mut last_error = None;
        let mut any_failed = false;

        for peer in candidates {
            let address = peer.address().clone();
            let Some(connector) = self.factory.connector_for(&address) else {
                tracing::debug!(peer = %address, "tracker: peer does not serve transport, skipping");
                continue;
            };

            match op(peer, connector).await {
                Ok(value) => {
                    if any_failed {
                        self.lock_status().resort();
                    }
                    return Ok(value);
                }
                Err(e) if e.is_peer_failure() => {
                    tracing::warn!(peer = %address, error = %e, "tracker: peer failed");
                    self.lock_status().mark_failure(&address, Instant::now());
                    any_failed = true;
                    last_error = Some(e);
                }
                Err(e) => return Err(e),
            }
        }

        if any_failed {
            self.lock_status().resort();
        }
        Err(ClientError::PeerExhausted {
            last: last_error.map(Box::new),
        })
    }

    /// Fetch a fresh peer list and merge it into the snapshot.
    ///
    /// Returns without doing anything when another refresh is in flight.
    pub async fn update_peers(&self) -> Result<()> {
        let Ok(_guard) = self.refresh_lock.try_lock() else {
            tracing::debug!("tracker: refresh already in progress");
            return Ok(());
        };
        *self
            .last_refresh_attempt
            .lock()
            .unwrap_or_else(PoisonError::into_inner) = Some(Instant::now());

        let fetched = self
            .try_peers(|_peer, connector| async move { connector.fetch_peers().await })
            .await?;

        let merged = {
            let mut status = self.lock_status();
            let merged = status.merge(fetched, &self.seeds, Instant::now());
            *status = merged.clone();
            merged
        };
        self.needs_refresh.store(false, Ordering::Release);

        tracing::info!(peers = merged.peers().len(), "tracker: refreshed peers");

        if let Some(cache) = &self.cache {
            if let Err(e) = cache.save(&merged) {
                tracing::warn!(path = %cache.path().display(), error = %e, "tracker: failed to save peer cache");
            }
        }
        Ok(())
    }
}
