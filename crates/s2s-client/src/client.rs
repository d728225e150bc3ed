use s2s_peers::Peer;
use std::sync::Arc;

use crate::config::ClientConfig;
use crate::connector::ConnectorFactory;
use crate::error::Result;
use crate::tracker::PeerTracker;
use crate::transaction::Transaction;

/// Entry point: hands out transactions against the best available peer.
pub struct SiteToSiteClient {
    config: Arc<ClientConfig>,
    tracker: PeerTracker,
}

impl SiteToSiteClient {
    pub fn new(config: ClientConfig) -> Result<Self> {
        Self::build(config, None)
    }

    /// Client whose HTTPS requests and secure raw sockets use the given
    /// rustls configuration.
    pub fn with_tls(config: ClientConfig, tls: Arc<rustls::ClientConfig>) -> Result<Self> {
        Self::build(config, Some(tls))
    }

    fn build(config: ClientConfig, tls: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        config.validate()?;
        let config = Arc::new(config);
        let factory = ConnectorFactory::new(config.clone(), tls)?;
        let tracker = PeerTracker::new(&config, factory)?;

        tracing::info!(
            transport = %config.transport,
            seeds = tracker.seeds().len(),
            port = config.port_identifier.as_deref().unwrap_or("(none)"),
            "client: created"
        );
        Ok(Self { config, tracker })
    }

    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    pub fn tracker(&self) -> &PeerTracker {
        &self.tracker
    }

    /// Begin a transaction on the first peer that accepts one.
    pub async fn create_transaction(&self) -> Result<Transaction> {
        self.tracker
            .perform_operation(|_peer, connector| async move { connector.begin_transaction().await })
            .await
    }

    /// Peer list as reported by the first reachable peer.
    pub async fn get_peers(&self) -> Result<Vec<Peer>> {
        self.tracker
            .perform_operation(|_peer, connector| async move { connector.fetch_peers().await })
            .await
    }
}
