//! Transport connectors. The transport is picked once from configuration;
//! the factory then builds a connector for each candidate peer.

pub mod http;
pub mod socket;

use s2s_peers::{Peer, PeerAddress};
use std::sync::Arc;

use crate::config::{ClientConfig, TransportProtocol};
use crate::error::Result;
use crate::transaction::Transaction;

pub use http::{HttpConnector, HttpContext};
pub use socket::SocketConnector;

/// A connector bound to one peer.
pub enum Connector {
    Http(HttpConnector),
    Socket(SocketConnector),
}

impl Connector {
    pub fn address(&self) -> &PeerAddress {
        match self {
            Connector::Http(c) => c.address(),
            Connector::Socket(c) => c.address(),
        }
    }

    pub async fn fetch_peers(&self) -> Result<Vec<Peer>> {
        match self {
            Connector::Http(c) => c.fetch_peers().await,
            Connector::Socket(c) => c.fetch_peers().await,
        }
    }

    pub async fn begin_transaction(&self) -> Result<Transaction> {
        let transaction = match self {
            Connector::Http(c) => Transaction::http(c.address().clone(), c.begin_transaction().await?),
            Connector::Socket(c) => {
                Transaction::socket(c.address().clone(), c.begin_transaction().await?)
            }
        };
        tracing::info!(peer = %self.address(), "transaction: started");
        Ok(transaction)
    }
}

/// Builds connectors for the configured transport.
#[derive(Clone)]
pub struct ConnectorFactory {
    transport: TransportProtocol,
    config: Arc<ClientConfig>,
    http: Arc<HttpContext>,
    tls: Option<tokio_rustls::TlsConnector>,
}

impl ConnectorFactory {
    pub fn new(config: Arc<ClientConfig>, tls: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        let raw_tls = tls.clone().map(tokio_rustls::TlsConnector::from);
        let http = Arc::new(HttpContext::new(config.clone(), tls)?);
        Ok(Self {
            transport: config.transport,
            config,
            http,
            tls: raw_tls,
        })
    }

    pub fn transport(&self) -> TransportProtocol {
        self.transport
    }

    /// `None` when the peer does not serve the configured transport.
    pub fn connector_for(&self, address: &PeerAddress) -> Option<Connector> {
        match self.transport {
            TransportProtocol::Http => {
                HttpConnector::new(self.http.clone(), address.clone()).map(Connector::Http)
            }
            TransportProtocol::Raw => {
                SocketConnector::new(address.clone(), self.config.clone(), self.tls.clone())
                    .map(Connector::Socket)
            }
        }
    }
}
