//! Transaction state machine.
//!
//! `Open -> Sending -> Confirmed -> {Completed | Cancelled}`. `confirm` may
//! follow `Open` directly (an empty transfer). Out-of-order calls fail with
//! `IllegalState` without touching the connection.

use s2s_peers::PeerAddress;
use s2s_protocol::{DataPacket, ResponseCode, TransactionResultEntity};
use std::fmt;

use crate::connector::http::HttpSession;
use crate::connector::socket::SocketTransaction;
use crate::error::{ClientError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    Open,
    Sending,
    Confirmed,
    Completed,
    Cancelled,
}

/// Outcome reported by the server when a transaction ends.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransactionResult {
    pub flow_files_sent: i64,
    pub response_code: ResponseCode,
    pub message: Option<String>,
}

impl TransactionResult {
    pub(crate) fn from_entity(entity: TransactionResultEntity) -> Result<Self> {
        Ok(Self {
            flow_files_sent: entity.flow_file_sent,
            response_code: ResponseCode::from_code(entity.response_code)?,
            message: entity.message,
        })
    }

    pub fn destination_full(&self) -> bool {
        self.response_code == ResponseCode::TransactionFinishedButDestinationFull
    }
}

enum Session {
    Http(HttpSession),
    Socket(SocketTransaction),
}

pub struct Transaction {
    peer: PeerAddress,
    state: TransactionState,
    session: Session,
}

impl Transaction {
    pub(crate) fn http(peer: PeerAddress, session: HttpSession) -> Self {
        Self {
            peer,
            state: TransactionState::Open,
            session: Session::Http(session),
        }
    }

    pub(crate) fn socket(peer: PeerAddress, session: SocketTransaction) -> Self {
        Self {
            peer,
            state: TransactionState::Open,
            session: Session::Socket(session),
        }
    }

    pub fn peer(&self) -> &PeerAddress {
        &self.peer
    }

    pub fn state(&self) -> TransactionState {
        self.state
    }

    pub fn packets_sent(&self) -> u64 {
        match &self.session {
            Session::Http(s) => s.packets_sent(),
            Session::Socket(s) => s.packets_sent(),
        }
    }

    /// CRC-32 over every packet frame sent so far.
    pub fn checksum(&self) -> u32 {
        match &self.session {
            Session::Http(s) => s.checksum(),
            Session::Socket(s) => s.checksum(),
        }
    }

    fn illegal(&self, op: &str) -> ClientError {
        ClientError::IllegalState(format!("{op} not allowed in state {:?}", self.state))
    }

    pub async fn send(&mut self, packet: &DataPacket) -> Result<()> {
        if !matches!(self.state, TransactionState::Open | TransactionState::Sending) {
            return Err(self.illegal("send"));
        }
        self.state = TransactionState::Sending;
        match &mut self.session {
            Session::Http(s) => s.send(packet).await,
            Session::Socket(s) => s.send(packet).await,
        }
    }

    /// Close the data stream and verify the server's checksum. On mismatch
    /// the server is told BAD_CHECKSUM and the transaction is dead.
    pub async fn confirm(&mut self) -> Result<()> {
        if !matches!(self.state, TransactionState::Open | TransactionState::Sending) {
            return Err(self.illegal("confirm"));
        }
        let result = match &mut self.session {
            Session::Http(s) => s.confirm().await,
            Session::Socket(s) => s.confirm().await,
        };
        match result {
            Ok(()) => {
                self.state = TransactionState::Confirmed;
                Ok(())
            }
            Err(e) => {
                if matches!(e, ClientError::ChecksumMismatch { .. }) {
                    self.state = TransactionState::Cancelled;
                }
                Err(e)
            }
        }
    }

    pub async fn complete(&mut self) -> Result<TransactionResult> {
        if self.state != TransactionState::Confirmed {
            return Err(self.illegal("complete"));
        }
        self.state = TransactionState::Completed;
        let result = match &mut self.session {
            Session::Http(s) => s.complete().await?,
            Session::Socket(s) => s.complete().await?,
        };

        if result.destination_full() {
            tracing::warn!(
                peer = %self.peer,
                sent = result.flow_files_sent,
                "transaction: completed, destination is full"
            );
        } else {
            tracing::info!(
                peer = %self.peer,
                sent = result.flow_files_sent,
                code = %result.response_code,
                "transaction: completed"
            );
        }
        Ok(result)
    }

    pub async fn cancel(&mut self, reason: &str) -> Result<TransactionResult> {
        if self.state != TransactionState::Confirmed {
            return Err(self.illegal("cancel"));
        }
        self.state = TransactionState::Cancelled;
        let result = match &mut self.session {
            Session::Http(s) => s.cancel().await?,
            Session::Socket(s) => s.cancel(reason).await?,
        };
        tracing::info!(peer = %self.peer, reason, "transaction: cancelled");
        Ok(result)
    }
}

impl fmt::Debug for Transaction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transaction")
            .field("peer", &self.peer)
            .field("state", &self.state)
            .finish_non_exhaustive()
    }
}

impl Drop for Transaction {
    fn drop(&mut self) {
        if matches!(
            self.state,
            TransactionState::Open | TransactionState::Sending | TransactionState::Confirmed
        ) {
            tracing::debug!(
                peer = %self.peer,
                state = ?self.state,
                "transaction: dropped before completion"
            );
        }
    }
}
