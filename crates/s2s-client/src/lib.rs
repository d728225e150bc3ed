//! NiFi Site-to-Site client.
//!
//! `SiteToSiteClient` hands out `Transaction`s on the best available peer,
//! failing over through `PeerTracker`. `PersistentQueue` adds a durable
//! SQLite buffer in front of the same send path.

pub mod client;
pub mod config;
pub mod connector;
pub mod error;
pub mod queue;
pub mod tracker;
pub mod transaction;

pub use client::SiteToSiteClient;
pub use config::{ClientConfig, ProxyConfig, TransportProtocol};
pub use error::{ClientError, Result};
pub use queue::{PersistentQueue, ProcessStats};
pub use tracker::PeerTracker;
pub use transaction::{Transaction, TransactionResult, TransactionState};

pub use s2s_peers::{Peer, PeerAddress};
pub use s2s_protocol::{DataPacket, ResponseCode};
