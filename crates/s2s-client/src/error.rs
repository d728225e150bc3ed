use s2s_protocol::ProtocolError;

#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),
    #[error("invalid server transaction ttl {0:?}")]
    InvalidTtl(String),
    #[error("checksum mismatch: local {local}, remote {remote}")]
    ChecksumMismatch { local: u64, remote: u64 },
    #[error("storage error: {0}")]
    Storage(#[from] s2s_queue::StorageError),
    #[error("network error: {0}")]
    Network(#[from] std::io::Error),
    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),
    #[error("no peer completed the operation{}", last_error(.last))]
    PeerExhausted { last: Option<Box<ClientError>> },
    #[error("illegal transaction state: {0}")]
    IllegalState(String),
    #[error("config error: {0}")]
    Config(String),
    #[error("peer error: {0}")]
    Peers(#[from] s2s_peers::PeerError),
}

fn last_error(last: &Option<Box<ClientError>>) -> String {
    match last {
        Some(e) => format!("; last error: {e}"),
        None => "; no applicable peer".to_string(),
    }
}

impl ClientError {
    /// Errors that say something about the peer rather than the caller:
    /// the tracker marks the peer failed and moves on to the next one.
    pub fn is_peer_failure(&self) -> bool {
        matches!(
            self,
            ClientError::Protocol(_)
                | ClientError::InvalidTtl(_)
                | ClientError::Network(_)
                | ClientError::Http(_)
        )
    }

    pub(crate) fn timed_out(what: &str) -> Self {
        ClientError::Network(std::io::Error::new(
            std::io::ErrorKind::TimedOut,
            format!("{what} timed out"),
        ))
    }
}

pub type Result<T> = std::result::Result<T, ClientError>;
