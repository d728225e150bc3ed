//! Raw socket transport -- one TCP connection per transaction.
//!
//! Connection setup: magic bytes, resource negotiation, then the property
//! handshake. Status replies during a transaction are `RC` frames. Secure
//! peers get the same exchange inside a TLS session.

use bytes::{Buf, BufMut, BytesMut};
use s2s_peers::{Peer, PeerAddress, PortKind};
use s2s_protocol::codec::put_utf;
use s2s_protocol::{
    Compressor, DataPacket, PacketStream, PeerDto, ProtocolError, RequestType, Response,
    ResponseCode, ResponseCodec, ABORT, CODEC_RESOURCE, CODEC_VERSIONS,
    DIFFERENT_RESOURCE_VERSION, MAGIC_BYTES, RESOURCE_OK, SOCKET_PROTOCOL_RESOURCE,
    SOCKET_PROTOCOL_VERSIONS,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_rustls::TlsConnector;
use tokio_util::codec::{Decoder, Encoder};

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transaction::TransactionResult;

/// Upper bound on entries accepted from a raw peer-list reply.
pub const MAX_PEER_LIST: i32 = 10_000;

/// Byte stream under a raw session: plain TCP or TLS over TCP.
trait RawStream: AsyncRead + AsyncWrite + Send + Sync + Unpin {}

impl<T: AsyncRead + AsyncWrite + Send + Sync + Unpin> RawStream for T {}

/// Connector for one peer's raw socket port.
#[derive(Clone)]
pub struct SocketConnector {
    address: PeerAddress,
    port: u16,
    config: Arc<ClientConfig>,
    tls: Option<TlsConnector>,
}

impl SocketConnector {
    /// `None` when the peer has no raw port.
    pub fn new(
        address: PeerAddress,
        config: Arc<ClientConfig>,
        tls: Option<TlsConnector>,
    ) -> Option<Self> {
        let port = address.raw_port?;
        Some(Self {
            address,
            port,
            config,
            tls,
        })
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    async fn connect(&self, port_identifier: Option<&str>) -> Result<SocketSession> {
        let timeout = self.config.timeout();
        let stream = tokio::time::timeout(
            timeout,
            TcpStream::connect((self.address.host.as_str(), self.port)),
        )
        .await
        .map_err(|_| ClientError::timed_out("connect"))??;
        stream.set_nodelay(true)?;
        let stream = self.secure(stream).await?;

        let mut session = SocketSession {
            stream,
            read_buf: BytesMut::with_capacity(4096),
            timeout,
            protocol_version: 0,
            address: self.address.clone(),
        };
        session.write(&MAGIC_BYTES).await?;
        session.protocol_version = session
            .negotiate_resource(SOCKET_PROTOCOL_RESOURCE, SOCKET_PROTOCOL_VERSIONS)
            .await?;
        session.handshake(&self.config, port_identifier).await?;

        tracing::debug!(
            peer = %self.address,
            version = session.protocol_version,
            "socket: handshake complete"
        );
        Ok(session)
    }

    /// Wrap the connection in TLS when the peer is secure.
    async fn secure(&self, stream: TcpStream) -> Result<Box<dyn RawStream>> {
        if !self.address.secure {
            return Ok(Box::new(stream));
        }
        let Some(tls) = &self.tls else {
            return Err(ClientError::Config(format!(
                "peer {} requires TLS but no TLS configuration was supplied",
                self.address
            )));
        };
        let server_name = rustls::pki_types::ServerName::try_from(self.address.host.clone())
            .map_err(|e| {
                ClientError::Config(format!("invalid TLS server name {}: {e}", self.address.host))
            })?;
        let stream = tokio::time::timeout(self.config.timeout(), tls.connect(server_name, stream))
            .await
            .map_err(|_| ClientError::timed_out("tls handshake"))??;
        tracing::debug!(peer = %self.address, "socket: tls established");
        Ok(Box::new(stream))
    }

    pub async fn fetch_peers(&self) -> Result<Vec<Peer>> {
        let mut session = self.connect(None).await?;
        session.write_request(RequestType::RequestPeerList).await?;

        let count = session.read_i32().await?;
        if count < 0 {
            return Err(ProtocolError::NegativeLength(i64::from(count)).into());
        }
        if count > MAX_PEER_LIST {
            return Err(ProtocolError::UnexpectedResponse(format!(
                "peer list of {count} entries exceeds {MAX_PEER_LIST}"
            ))
            .into());
        }
        let mut peers = Vec::with_capacity(count.min(64) as usize);
        for _ in 0..count {
            let dto = PeerDto {
                hostname: session.read_utf().await?,
                port: session.read_i32().await?,
                secure: session.read_u8().await? != 0,
                flow_file_count: session.read_i32().await?,
            };
            peers.push(Peer::new(
                PeerAddress::from_dto(&dto, PortKind::Raw),
                dto.flow_file_count,
            ));
        }
        session.shutdown().await;

        tracing::debug!(peer = %self.address, count = peers.len(), "socket: fetched peer list");
        Ok(peers)
    }

    pub async fn begin_transaction(&self) -> Result<SocketTransaction> {
        let port = self.config.port_identifier()?;
        let mut session = self.connect(Some(port)).await?;

        session.write_request(RequestType::NegotiateFlowFileCodec).await?;
        let codec_version = session
            .negotiate_resource(CODEC_RESOURCE, CODEC_VERSIONS)
            .await?;
        session.write_request(RequestType::SendFlowFiles).await?;

        tracing::debug!(peer = %self.address, codec_version, "socket: transaction started");
        Ok(SocketTransaction::new(session, self.config.use_compression))
    }
}

/// An open raw socket connection.
pub struct SocketSession {
    stream: Box<dyn RawStream>,
    read_buf: BytesMut,
    timeout: Duration,
    protocol_version: i32,
    address: PeerAddress,
}

impl SocketSession {
    pub fn protocol_version(&self) -> i32 {
        self.protocol_version
    }

    async fn write(&mut self, bytes: &[u8]) -> Result<()> {
        let timeout = self.timeout;
        let stream = &mut self.stream;
        let io = async move {
            stream.write_all(bytes).await?;
            stream.flush().await
        };
        match tokio::time::timeout(timeout, io).await {
            Ok(r) => Ok(r?),
            Err(_) => Err(ClientError::timed_out("write")),
        }
    }

    /// Ensure at least `n` buffered bytes.
    async fn fill(&mut self, n: usize) -> Result<()> {
        while self.read_buf.len() < n {
            self.read_buf.reserve(n - self.read_buf.len());
            let timeout = self.timeout;
            let read = match tokio::time::timeout(timeout, self.stream.read_buf(&mut self.read_buf)).await {
                Ok(r) => r?,
                Err(_) => return Err(ClientError::timed_out("read")),
            };
            if read == 0 {
                return Err(ClientError::Network(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    format!("peer {} closed the connection", self.address),
                )));
            }
        }
        Ok(())
    }

    async fn read_u8(&mut self) -> Result<u8> {
        self.fill(1).await?;
        Ok(self.read_buf.get_u8())
    }

    async fn read_i32(&mut self) -> Result<i32> {
        self.fill(4).await?;
        Ok(self.read_buf.get_i32())
    }

    async fn read_utf(&mut self) -> Result<String> {
        self.fill(2).await?;
        let len = self.read_buf.get_u16() as usize;
        self.fill(len).await?;
        let raw = self.read_buf.split_to(len);
        String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("utf string").into())
    }

    async fn read_response(&mut self) -> Result<Response> {
        loop {
            if let Some(resp) = ResponseCodec.decode(&mut self.read_buf)? {
                return Ok(resp);
            }
            let want = self.read_buf.len() + 1;
            self.fill(want).await?;
        }
    }

    async fn write_response(&mut self, resp: Response) -> Result<()> {
        let mut buf = BytesMut::new();
        ResponseCodec.encode(resp, &mut buf)?;
        self.write(&buf).await
    }

    async fn write_request(&mut self, request: RequestType) -> Result<()> {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, request.as_str())?;
        self.write(&buf).await
    }

    /// Propose versions in preference order until the server accepts one.
    async fn negotiate_resource(&mut self, name: &str, versions: &[i32]) -> Result<i32> {
        let mut candidates = versions.iter().copied();
        let mut version = candidates
            .next()
            .ok_or_else(|| ProtocolError::Negotiation(format!("no versions for {name}")))?;

        loop {
            let mut buf = BytesMut::new();
            put_utf(&mut buf, name)?;
            buf.put_i32(version);
            self.write(&buf).await?;

            match self.read_u8().await? {
                RESOURCE_OK => return Ok(version),
                DIFFERENT_RESOURCE_VERSION => {
                    let max = self.read_i32().await?;
                    tracing::debug!(resource = name, proposed = version, max, "socket: server wants another version");
                    version = candidates.find(|v| *v <= max).ok_or_else(|| {
                        ProtocolError::Negotiation(format!(
                            "{name}: no common version (server max {max})"
                        ))
                    })?;
                }
                ABORT => {
                    let message = self.read_utf().await?;
                    return Err(ProtocolError::Negotiation(format!("{name} aborted: {message}")).into());
                }
                other => {
                    return Err(ProtocolError::Negotiation(format!(
                        "{name}: unexpected status byte {other}"
                    ))
                    .into())
                }
            }
        }
    }

    async fn handshake(&mut self, config: &ClientConfig, port_identifier: Option<&str>) -> Result<()> {
        let mut buf = BytesMut::new();
        put_utf(&mut buf, &uuid::Uuid::new_v4().to_string())?;
        if self.protocol_version >= 3 {
            put_utf(&mut buf, &self.address.raw_uri().unwrap_or_default())?;
        }
        let properties = config
            .handshake_properties()
            .socket_properties(port_identifier, self.protocol_version);
        buf.put_i32(properties.len() as i32);
        for (key, value) in &properties {
            put_utf(&mut buf, key)?;
            put_utf(&mut buf, value)?;
        }
        self.write(&buf).await?;

        let resp = self.read_response().await?;
        match resp.code {
            ResponseCode::PropertiesOk => Ok(()),
            code => Err(ProtocolError::UnexpectedResponse(format!(
                "handshake rejected with {code}: {}",
                resp.message.unwrap_or_default()
            ))
            .into()),
        }
    }

    /// Best-effort orderly close.
    async fn shutdown(mut self) {
        if let Err(e) = self.write_request(RequestType::Shutdown).await {
            tracing::debug!(peer = %self.address, error = %e, "socket: shutdown request failed");
        }
        let _ = tokio::time::timeout(self.timeout, self.stream.shutdown()).await;
    }
}

// ============================================================================
// Transaction session
// ============================================================================

/// Send side of a raw socket transaction.
///
/// Packets after the first are preceded by CONTINUE_TRANSACTION. With
/// compression enabled each packet frame is its own compressed stream; the
/// checksum always covers the uncompressed frames.
pub struct SocketTransaction {
    session: Option<SocketSession>,
    stream: PacketStream,
    use_compression: bool,
}

impl SocketTransaction {
    fn new(session: SocketSession, use_compression: bool) -> Self {
        Self {
            session: Some(session),
            stream: PacketStream::new(false),
            use_compression,
        }
    }

    pub fn packets_sent(&self) -> u64 {
        self.stream.packets_written()
    }

    pub fn checksum(&self) -> u32 {
        self.stream.checksum()
    }

    fn session(&mut self) -> Result<&mut SocketSession> {
        self.session
            .as_mut()
            .ok_or_else(|| ClientError::IllegalState("connection already closed".into()))
    }

    pub async fn send(&mut self, packet: &DataPacket) -> Result<()> {
        let first = self.stream.packets_written() == 0;
        let frame = self.stream.write_packet(packet)?;
        let wire = if self.use_compression {
            let mut c = Compressor::new();
            let mut out = BytesMut::from(&c.write(&frame)?[..]);
            out.extend_from_slice(&c.finish()?);
            out.freeze()
        } else {
            frame
        };

        let session = self.session()?;
        if !first {
            session
                .write_response(Response::new(ResponseCode::ContinueTransaction))
                .await?;
        }
        session.write(&wire).await
    }

    pub async fn confirm(&mut self) -> Result<()> {
        let local = u64::from(self.stream.checksum());
        let session = self.session()?;
        session
            .write_response(Response::new(ResponseCode::FinishTransaction))
            .await?;

        let resp = session.read_response().await?;
        if resp.code != ResponseCode::ConfirmTransaction {
            return Err(ProtocolError::UnexpectedResponse(format!(
                "expected {} after finish, got {}",
                ResponseCode::ConfirmTransaction,
                resp.code
            ))
            .into());
        }
        let text = resp.message.unwrap_or_default();
        let remote: u64 = text.trim().parse().map_err(|_| {
            ProtocolError::UnexpectedResponse(format!("checksum message {text:?}"))
        })?;

        if remote != local {
            tracing::warn!(peer = %session.address, local, remote, "socket: checksum mismatch, rejecting transaction");
            if let Err(e) = session
                .write_response(Response::new(ResponseCode::BadChecksum))
                .await
            {
                tracing::debug!(error = %e, "socket: bad-checksum notification failed");
            }
            self.session = None;
            return Err(ClientError::ChecksumMismatch { local, remote });
        }

        session
            .write_response(Response::with_message(ResponseCode::ConfirmTransaction, ""))
            .await
    }

    pub async fn complete(&mut self) -> Result<TransactionResult> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ClientError::IllegalState("connection already closed".into()))?;
        let resp = session.read_response().await?;
        match resp.code {
            ResponseCode::TransactionFinished
            | ResponseCode::TransactionFinishedButDestinationFull => {}
            other => {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "expected {} after confirm, got {other}",
                    ResponseCode::TransactionFinished
                ))
                .into())
            }
        }
        session.shutdown().await;

        Ok(TransactionResult {
            flow_files_sent: self.stream.packets_written() as i64,
            response_code: resp.code,
            message: resp.message,
        })
    }

    pub async fn cancel(&mut self, reason: &str) -> Result<TransactionResult> {
        let mut session = self
            .session
            .take()
            .ok_or_else(|| ClientError::IllegalState("connection already closed".into()))?;
        session
            .write_response(Response::with_message(ResponseCode::CancelTransaction, reason))
            .await?;
        session.shutdown().await;

        Ok(TransactionResult {
            flow_files_sent: 0,
            response_code: ResponseCode::CancelTransaction,
            message: Some(reason.to_string()),
        })
    }
}
