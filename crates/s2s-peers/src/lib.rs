//! Site-to-Site peers -- candidate endpoints, their ordering, and the
//! peer-status snapshot a tracker works from.
//!
//! Ordering prefers peers that have not failed recently, then the least
//! loaded, then the lexicographically smaller address. Failure marks use the
//! monotonic clock and are never persisted.

pub mod cache;

use s2s_protocol::PeerDto;
use std::cmp::Ordering;
use std::collections::HashSet;
use std::fmt;
use std::time::{Duration, Instant};

pub use cache::PeerStatusCache;

#[derive(Debug, thiserror::Error)]
pub enum PeerError {
    #[error("invalid seed url {url}: {reason}")]
    InvalidSeed { url: String, reason: String },
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

pub type Result<T> = std::result::Result<T, PeerError>;

/// Which port a transport connects to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PortKind {
    Http,
    Raw,
}

/// Network identity of a peer. Immutable once created.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, serde::Serialize, serde::Deserialize)]
pub struct PeerAddress {
    pub host: String,
    pub http_port: Option<u16>,
    pub raw_port: Option<u16>,
    pub secure: bool,
}

impl PeerAddress {
    pub fn new(host: impl Into<String>, http_port: Option<u16>, raw_port: Option<u16>, secure: bool) -> Self {
        Self {
            host: host.into(),
            http_port,
            raw_port,
            secure,
        }
    }

    /// Parse a configured seed such as `https://nifi.example.com:8443/nifi`.
    /// The scheme decides `secure` and the default HTTP port.
    pub fn from_seed_url(seed: &str, raw_port: Option<u16>) -> Result<Self> {
        let invalid = |reason: &str| PeerError::InvalidSeed {
            url: seed.to_string(),
            reason: reason.to_string(),
        };
        let parsed = url::Url::parse(seed).map_err(|e| invalid(&e.to_string()))?;
        let secure = match parsed.scheme() {
            "http" => false,
            "https" => true,
            _ => return Err(invalid("scheme must be http or https")),
        };
        let host = parsed.host_str().ok_or_else(|| invalid("missing host"))?;
        let http_port = parsed.port_or_known_default();
        Ok(Self::new(host, http_port, raw_port, secure))
    }

    /// Build an address from a peer-list entry fetched over `kind`.
    pub fn from_dto(dto: &PeerDto, kind: PortKind) -> Self {
        let port = port_from_i32(dto.port);
        match kind {
            PortKind::Http => Self::new(&dto.hostname, port, None, dto.secure),
            PortKind::Raw => Self::new(&dto.hostname, None, port, dto.secure),
        }
    }

    /// Same host and no conflicting port. A port known on only one side
    /// does not count as a conflict.
    pub fn same_endpoint(&self, other: &PeerAddress) -> bool {
        fn compatible(a: Option<u16>, b: Option<u16>) -> bool {
            match (a, b) {
                (Some(a), Some(b)) => a == b,
                _ => true,
            }
        }
        self.host == other.host
            && compatible(self.http_port, other.http_port)
            && compatible(self.raw_port, other.raw_port)
    }

    pub fn port(&self, kind: PortKind) -> Option<u16> {
        match kind {
            PortKind::Http => self.http_port,
            PortKind::Raw => self.raw_port,
        }
    }

    /// Base URL of the REST API, if this peer has an HTTP port.
    pub fn api_url(&self) -> Option<String> {
        let port = self.http_port?;
        let scheme = if self.secure { "https" } else { "http" };
        Some(format!(
            "{scheme}://{}:{port}{}",
            self.host,
            s2s_protocol::API_BASE_PATH
        ))
    }

    /// URI sent in the raw socket handshake.
    pub fn raw_uri(&self) -> Option<String> {
        let port = self.raw_port?;
        let scheme = if self.secure { "nifis" } else { "nifi" };
        Some(format!("{scheme}://{}:{port}", self.host))
    }
}

impl fmt::Display for PeerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.host)?;
        if let Some(p) = self.http_port {
            write!(f, " http={p}")?;
        }
        if let Some(p) = self.raw_port {
            write!(f, " raw={p}")?;
        }
        if self.secure {
            write!(f, " (secure)")?;
        }
        Ok(())
    }
}

/// Ports outside 1..=65535 mean "not served by this peer".
pub fn port_from_i32(port: i32) -> Option<u16> {
    u16::try_from(port).ok().filter(|p| *p > 0)
}

/// One candidate endpoint with its load and failure bookkeeping.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Peer {
    address: PeerAddress,
    pub flow_file_count: i32,
    pub last_failure: Option<Instant>,
}

impl Peer {
    pub fn new(address: PeerAddress, flow_file_count: i32) -> Self {
        Self {
            address,
            flow_file_count,
            last_failure: None,
        }
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn mark_failure(&mut self, at: Instant) {
        self.last_failure = Some(at);
    }

    pub fn has_failed(&self) -> bool {
        self.last_failure.is_some()
    }
}

impl Ord for Peer {
    fn cmp(&self, other: &Self) -> Ordering {
        // None < Some(_): peers that never failed sort first.
        self.last_failure
            .cmp(&other.last_failure)
            .then(self.flow_file_count.cmp(&other.flow_file_count))
            .then_with(|| self.address.cmp(&other.address))
    }
}

impl PartialOrd for Peer {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

/// Sorted peer list plus the instant it was last refreshed.
#[derive(Debug, Clone)]
pub struct PeerStatus {
    peers: Vec<Peer>,
    last_update: Instant,
}

impl PeerStatus {
    /// Build a fresh status. Failure marks recorded before `now` are cleared.
    pub fn new(mut peers: Vec<Peer>, now: Instant) -> Self {
        for peer in &mut peers {
            if peer.last_failure.is_some_and(|t| t < now) {
                peer.last_failure = None;
            }
        }
        let mut seen = HashSet::new();
        peers.retain(|p| seen.insert(p.address.clone()));
        peers.sort();
        Self {
            peers,
            last_update: now,
        }
    }

    /// Initial status from configured seed addresses.
    pub fn from_seeds(seeds: &[PeerAddress], now: Instant) -> Self {
        let peers = seeds.iter().cloned().map(|a| Peer::new(a, 0)).collect();
        Self::new(peers, now)
    }

    pub fn peers(&self) -> &[Peer] {
        &self.peers
    }

    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn is_stale(&self, max_age: Duration, now: Instant) -> bool {
        now.saturating_duration_since(self.last_update) >= max_age
    }

    /// Record a failure on the peer with `address`. Returns false if unknown.
    pub fn mark_failure(&mut self, address: &PeerAddress, at: Instant) -> bool {
        match self.peers.iter_mut().find(|p| &p.address == address) {
            Some(peer) => {
                peer.mark_failure(at);
                true
            }
            None => false,
        }
    }

    /// Append seeds that no known peer covers, with zero load. Returns how
    /// many were added.
    pub fn include_seeds(&mut self, seeds: &[PeerAddress]) -> usize {
        let mut added = 0;
        for seed in seeds {
            if self.peers.iter().any(|p| p.address.same_endpoint(seed)) {
                continue;
            }
            self.peers.push(Peer::new(seed.clone(), 0));
            added += 1;
        }
        if added > 0 {
            self.peers.sort();
        }
        added
    }

    /// Restore the ordering after failure marks changed.
    pub fn resort(&mut self) {
        self.peers.sort();
    }

    /// Merge a freshly fetched peer list into this status.
    ///
    /// Fetched peers carry the reported load; ports a transport did not
    /// report are filled from the known entry for the same host. Known peers
    /// missing from the fetch are dropped unless they are seeds.
    pub fn merge(&self, fetched: Vec<Peer>, seeds: &[PeerAddress], now: Instant) -> PeerStatus {
        let mut merged: Vec<Peer> = fetched
            .into_iter()
            .map(|mut peer| {
                if let Some(known) = self.peers.iter().find(|k| k.address.same_endpoint(&peer.address)) {
                    let addr = &mut peer.address;
                    addr.http_port = addr.http_port.or(known.address.http_port);
                    addr.raw_port = addr.raw_port.or(known.address.raw_port);
                }
                peer
            })
            .collect();

        for seed in seeds {
            if merged.iter().any(|p| p.address.same_endpoint(seed)) {
                continue;
            }
            let kept = self
                .peers
                .iter()
                .find(|p| &p.address == seed)
                .cloned()
                .unwrap_or_else(|| Peer::new(seed.clone(), 0));
            tracing::debug!(seed = %seed, "peers: keeping seed absent from fetched list");
            merged.push(kept);
        }

        PeerStatus::new(merged, now)
    }
}
