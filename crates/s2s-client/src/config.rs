//! Client configuration.
//!
//! TLS material is not part of this struct; hand a ready
//! `rustls::ClientConfig` to `SiteToSiteClient::with_tls`.

use s2s_peers::{PeerAddress, PortKind};
use s2s_protocol::HandshakeProperties;
use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{ClientError, Result};

/// Transport used for transactions and peer-list fetches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TransportProtocol {
    #[default]
    Http,
    Raw,
}

impl TransportProtocol {
    pub fn port_kind(self) -> PortKind {
        match self {
            TransportProtocol::Http => PortKind::Http,
            TransportProtocol::Raw => PortKind::Raw,
        }
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TransportProtocol::Http => "http",
            TransportProtocol::Raw => "raw",
        }
    }
}

impl std::fmt::Display for TransportProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProxyConfig {
    pub url: String,
    pub username: Option<String>,
    pub password: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// Seed URLs, e.g. `https://nifi-1.example.com:8443/nifi`.
    #[serde(default)]
    pub urls: Vec<String>,
    #[serde(default)]
    pub transport: TransportProtocol,
    /// Target input port id. Required for sends, not for peer listing.
    pub port_identifier: Option<String>,
    #[serde(default = "default_timeout_ms")]
    pub timeout_ms: u64,
    #[serde(default = "default_idle_expiration_ms")]
    pub idle_expiration_ms: u64,
    #[serde(default = "default_request_expiration_ms")]
    pub request_expiration_ms: u64,
    #[serde(default)]
    pub use_compression: bool,
    #[serde(default)]
    pub batch_count: u64,
    #[serde(default)]
    pub batch_size: u64,
    #[serde(default)]
    pub batch_duration_ms: u64,
    #[serde(default = "default_peer_update_interval_secs")]
    pub peer_update_interval_secs: u64,
    /// JSON peer-status cache, reloaded at startup.
    pub peer_cache_path: Option<String>,
    /// Raw socket port assumed for seed peers until a refresh reports one.
    pub raw_port: Option<u16>,
    pub proxy: Option<ProxyConfig>,
    pub username: Option<String>,
    pub password: Option<String>,
    /// Pre-issued bearer token; takes precedence over username/password.
    pub bearer_token: Option<String>,
}

fn default_timeout_ms() -> u64 {
    30_000
}
fn default_idle_expiration_ms() -> u64 {
    30_000
}
fn default_request_expiration_ms() -> u64 {
    30_000
}
fn default_peer_update_interval_secs() -> u64 {
    60
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            transport: TransportProtocol::default(),
            port_identifier: None,
            timeout_ms: default_timeout_ms(),
            idle_expiration_ms: default_idle_expiration_ms(),
            request_expiration_ms: default_request_expiration_ms(),
            use_compression: false,
            batch_count: 0,
            batch_size: 0,
            batch_duration_ms: 0,
            peer_update_interval_secs: default_peer_update_interval_secs(),
            peer_cache_path: None,
            raw_port: None,
            proxy: None,
            username: None,
            password: None,
            bearer_token: None,
        }
    }
}

impl ClientConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn idle_expiration(&self) -> Duration {
        Duration::from_millis(self.idle_expiration_ms)
    }

    pub fn peer_update_interval(&self) -> Duration {
        Duration::from_secs(self.peer_update_interval_secs)
    }

    pub fn handshake_properties(&self) -> HandshakeProperties {
        HandshakeProperties {
            use_compression: self.use_compression,
            request_expiration_ms: self.request_expiration_ms,
            batch_count: self.batch_count,
            batch_size: self.batch_size,
            batch_duration_ms: self.batch_duration_ms,
        }
    }

    pub fn port_identifier(&self) -> Result<&str> {
        self.port_identifier
            .as_deref()
            .filter(|p| !p.is_empty())
            .ok_or_else(|| ClientError::Config("port_identifier is not set".into()))
    }

    pub fn seed_addresses(&self) -> Result<Vec<PeerAddress>> {
        self.urls
            .iter()
            .map(|u| PeerAddress::from_seed_url(u.trim(), self.raw_port).map_err(ClientError::from))
            .collect()
    }

    /// Username/password pair, when both are configured.
    pub fn credentials(&self) -> Option<(&str, &str)> {
        match (&self.username, &self.password) {
            (Some(u), Some(p)) => Some((u.as_str(), p.as_str())),
            _ => None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.urls.is_empty() {
            return Err(ClientError::Config("at least one seed url is required".into()));
        }
        self.seed_addresses()?;
        if self.timeout_ms == 0 {
            return Err(ClientError::Config("timeout_ms must be positive".into()));
        }
        if self.peer_update_interval_secs == 0 {
            return Err(ClientError::Config(
                "peer_update_interval_secs must be positive".into(),
            ));
        }
        if self.username.is_some() != self.password.is_some() {
            return Err(ClientError::Config(
                "username and password must be set together".into(),
            ));
        }
        Ok(())
    }
}
