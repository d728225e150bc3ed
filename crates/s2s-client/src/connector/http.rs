//! HTTP transport -- REST endpoints under `/nifi-api`.
//!
//! A transaction is created with a POST to the input port, the packet stream
//! is uploaded as one chunked `flow-files` request body, and the transaction
//! is ended with a DELETE carrying the response code.

use bytes::Bytes;
use reqwest::header::{HeaderMap, ACCEPT, CONTENT_TYPE, LOCATION};
use reqwest::{RequestBuilder, Response, StatusCode};
use s2s_peers::{Peer, PeerAddress, PortKind};
use s2s_protocol::{
    headers, DataPacket, PacketStream, PeersEntity, ProtocolError, ResponseCode,
    TransactionResultEntity, API_BASE_PATH, HTTP_PROTOCOL_VERSION,
};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_stream::wrappers::ReceiverStream;

use crate::config::ClientConfig;
use crate::error::{ClientError, Result};
use crate::transaction::TransactionResult;

type UploadChunk = std::result::Result<Bytes, std::io::Error>;

/// Shared HTTP state: one connection pool and one token cache per client.
pub struct HttpContext {
    client: reqwest::Client,
    config: Arc<ClientConfig>,
    token: tokio::sync::Mutex<Option<String>>,
}

impl HttpContext {
    pub fn new(config: Arc<ClientConfig>, tls: Option<Arc<rustls::ClientConfig>>) -> Result<Self> {
        let mut builder = reqwest::Client::builder()
            .connect_timeout(config.timeout())
            .pool_idle_timeout(config.idle_expiration());

        if let Some(tls) = tls {
            builder = builder.use_preconfigured_tls((*tls).clone());
        }

        if let Some(proxy) = &config.proxy {
            let mut p = reqwest::Proxy::all(&proxy.url)
                .map_err(|e| ClientError::Config(format!("invalid proxy url {}: {e}", proxy.url)))?;
            if let Some(user) = &proxy.username {
                p = p.basic_auth(user, proxy.password.as_deref().unwrap_or(""));
            }
            builder = builder.proxy(p);
        }

        Ok(Self {
            client: builder.build()?,
            config,
            token: tokio::sync::Mutex::new(None),
        })
    }

    /// Bearer token for requests to `base_url`, fetching one from
    /// `/access/token` on first use when credentials are configured.
    async fn bearer_token(&self, base_url: &str) -> Result<Option<String>> {
        if let Some(token) = &self.config.bearer_token {
            return Ok(Some(token.clone()));
        }
        let Some((username, password)) = self.config.credentials() else {
            return Ok(None);
        };

        let mut cached = self.token.lock().await;
        if let Some(token) = cached.as_ref() {
            return Ok(Some(token.clone()));
        }

        let url = format!("{base_url}/access/token");
        let resp = self
            .client
            .post(&url)
            .timeout(self.config.timeout())
            .form(&[("username", username), ("password", password)])
            .send()
            .await?;
        let resp = require_success(resp, &url).await?;
        let token = resp.text().await?.trim().to_string();
        if token.is_empty() {
            return Err(ProtocolError::UnexpectedResponse(format!("empty token from {url}")).into());
        }
        tracing::debug!(url = %url, "http: obtained access token");
        *cached = Some(token.clone());
        Ok(Some(token))
    }
}

/// Connector for one peer's REST API.
#[derive(Clone)]
pub struct HttpConnector {
    ctx: Arc<HttpContext>,
    address: PeerAddress,
    base_url: String,
}

impl HttpConnector {
    /// `None` when the peer has no HTTP port.
    pub fn new(ctx: Arc<HttpContext>, address: PeerAddress) -> Option<Self> {
        let base_url = address.api_url()?;
        Some(Self {
            ctx,
            address,
            base_url,
        })
    }

    pub fn address(&self) -> &PeerAddress {
        &self.address
    }

    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    async fn authorize(&self, rb: RequestBuilder) -> Result<RequestBuilder> {
        let rb = rb.header(headers::PROTOCOL_VERSION, HTTP_PROTOCOL_VERSION.to_string());
        Ok(match self.ctx.bearer_token(&self.base_url).await? {
            Some(token) => rb.bearer_auth(token),
            None => rb,
        })
    }

    pub async fn fetch_peers(&self) -> Result<Vec<Peer>> {
        let url = format!("{}/site-to-site/peers", self.base_url);
        let rb = self
            .ctx
            .client
            .get(&url)
            .timeout(self.ctx.config.timeout())
            .header(ACCEPT, "application/json");
        let resp = self.authorize(rb).await?.send().await?;
        let resp = require_success(resp, &url).await?;
        let entity: PeersEntity = resp.json().await?;

        tracing::debug!(peer = %self.address, count = entity.peers.len(), "http: fetched peer list");
        Ok(entity
            .peers
            .iter()
            .map(|dto| Peer::new(PeerAddress::from_dto(dto, PortKind::Http), dto.flow_file_count))
            .collect())
    }

    /// Create a transaction on the configured input port and open its
    /// upload stream.
    pub async fn begin_transaction(&self) -> Result<HttpSession> {
        let config = &self.ctx.config;
        let port = config.port_identifier()?;
        let url = format!(
            "{}/data-transfer/input-ports/{port}/transactions",
            self.base_url
        );

        let mut rb = self.ctx.client.post(&url).timeout(config.timeout());
        for (name, value) in config.handshake_properties().http_headers() {
            rb = rb.header(name, value);
        }
        let resp = self.authorize(rb).await?.send().await?;
        let resp = require_success(resp, &url).await?;
        let hdrs = resp.headers();

        match header_value(hdrs, headers::LOCATION_URI_INTENT) {
            Some(intent) if intent == headers::LOCATION_URI_INTENT_TRANSACTION_URL => {}
            Some(other) => {
                return Err(ProtocolError::UnexpectedResponse(format!(
                    "{} is {other:?}, expected {:?}",
                    headers::LOCATION_URI_INTENT,
                    headers::LOCATION_URI_INTENT_TRANSACTION_URL
                ))
                .into())
            }
            None => return Err(ProtocolError::MissingHeader(headers::LOCATION_URI_INTENT).into()),
        }

        let ttl = parse_ttl(header_value(hdrs, headers::SERVER_TRANSACTION_TTL))?;
        let location = header_value(hdrs, LOCATION.as_str())
            .ok_or(ProtocolError::MissingHeader("location"))?;
        let path = transaction_path(location)?;
        let transaction_url = format!("{}{path}", self.base_url);

        tracing::debug!(
            peer = %self.address,
            transaction = %transaction_url,
            ttl_secs = ttl.as_secs(),
            "http: transaction created"
        );
        HttpSession::open(self.clone(), transaction_url, ttl, config.use_compression).await
    }

    async fn extend_ttl(&self, transaction_url: &str) -> Result<()> {
        let rb = self
            .ctx
            .client
            .put(transaction_url)
            .timeout(self.ctx.config.timeout());
        let resp = self.authorize(rb).await?.send().await?;
        require_success(resp, transaction_url).await?;
        Ok(())
    }

    async fn end_transaction(
        &self,
        transaction_url: &str,
        code: ResponseCode,
    ) -> Result<TransactionResultEntity> {
        let rb = self
            .ctx
            .client
            .delete(transaction_url)
            .timeout(self.ctx.config.timeout())
            .query(&[("responseCode", code.code())])
            .header(ACCEPT, "application/json");
        let resp = self.authorize(rb).await?.send().await?;
        let resp = require_success(resp, transaction_url).await?;
        Ok(resp.json().await?)
    }
}

fn header_value<'a>(hdrs: &'a HeaderMap, name: &str) -> Option<&'a str> {
    hdrs.get(name)
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|v| !v.is_empty())
}

fn parse_ttl(raw: Option<&str>) -> Result<Duration> {
    let raw = raw.ok_or(ProtocolError::MissingHeader(headers::SERVER_TRANSACTION_TTL))?;
    match raw.parse::<u64>() {
        Ok(secs) if secs > 0 => Ok(Duration::from_secs(secs)),
        _ => Err(ClientError::InvalidTtl(raw.to_string())),
    }
}

/// Path of the transaction relative to the API base, from the absolute
/// `Location` the server returned.
fn transaction_path(location: &str) -> Result<String> {
    let path = match url::Url::parse(location) {
        Ok(parsed) => parsed.path().to_string(),
        Err(url::ParseError::RelativeUrlWithoutBase) if location.starts_with('/') => {
            location.to_string()
        }
        Err(e) => {
            return Err(
                ProtocolError::UnexpectedResponse(format!("bad location {location:?}: {e}")).into(),
            )
        }
    };
    let relative = path.strip_prefix(API_BASE_PATH).unwrap_or(&path);
    Ok(relative.trim_end_matches('/').to_string())
}

async fn require_success(resp: Response, context: &str) -> Result<Response> {
    if resp.status().is_success() {
        return Ok(resp);
    }
    let status = resp.status().as_u16();
    let body = resp.text().await.unwrap_or_default();
    tracing::debug!(status, context, body = %body, "http: request failed");
    Err(ProtocolError::UnexpectedStatus {
        status,
        context: context.to_string(),
    }
    .into())
}

// ============================================================================
// Transaction session
// ============================================================================

/// Open HTTP transaction: upload stream, running checksum and keep-alive.
pub struct HttpSession {
    connector: HttpConnector,
    transaction_url: String,
    stream: PacketStream,
    body: Option<mpsc::Sender<UploadChunk>>,
    upload: Option<JoinHandle<reqwest::Result<Response>>>,
    keep_alive: Option<JoinHandle<()>>,
}

impl HttpSession {
    async fn open(
        connector: HttpConnector,
        transaction_url: String,
        ttl: Duration,
        use_compression: bool,
    ) -> Result<Self> {
        let (tx, rx) = mpsc::channel::<UploadChunk>(16);
        let url = format!("{transaction_url}/flow-files");
        let mut rb = connector
            .ctx
            .client
            .post(&url)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header(ACCEPT, "text/plain")
            .body(reqwest::Body::wrap_stream(ReceiverStream::new(rx)));
        if use_compression {
            rb = rb.header(headers::USE_COMPRESSION, "true");
        }
        let rb = connector.authorize(rb).await?;
        let upload = tokio::spawn(rb.send());

        let keep_alive = spawn_keep_alive(connector.clone(), transaction_url.clone(), ttl);

        Ok(Self {
            connector,
            transaction_url,
            stream: PacketStream::new(use_compression),
            body: Some(tx),
            upload: Some(upload),
            keep_alive: Some(keep_alive),
        })
    }

    pub fn transaction_url(&self) -> &str {
        &self.transaction_url
    }

    pub fn packets_sent(&self) -> u64 {
        self.stream.packets_written()
    }

    pub fn checksum(&self) -> u32 {
        self.stream.checksum()
    }

    async fn push(&mut self, chunk: Bytes) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let Some(body) = self.body.as_ref() else {
            return Err(ClientError::IllegalState("upload stream already closed".into()));
        };
        if body.send(Ok(chunk)).await.is_err() {
            // The request task ended early; surface its error.
            self.body = None;
            return Err(self.finish_upload().await.err().unwrap_or_else(|| {
                ProtocolError::UnexpectedResponse("server closed the upload early".into()).into()
            }));
        }
        Ok(())
    }

    async fn finish_upload(&mut self) -> Result<Response> {
        let upload = self
            .upload
            .take()
            .ok_or_else(|| ClientError::IllegalState("upload already finished".into()))?;
        match upload.await {
            Ok(resp) => Ok(resp?),
            Err(e) => Err(ClientError::Network(std::io::Error::other(e))),
        }
    }

    pub async fn send(&mut self, packet: &DataPacket) -> Result<()> {
        let chunk = self.stream.write_packet(packet)?;
        self.push(chunk).await
    }

    /// Close the upload and verify the server's checksum.
    pub async fn confirm(&mut self) -> Result<()> {
        let tail = self.stream.finish()?;
        self.push(tail).await?;
        self.body = None;

        let url = format!("{}/flow-files", self.transaction_url);
        let resp = self.finish_upload().await?;
        let status = resp.status();
        if status != StatusCode::OK && status != StatusCode::ACCEPTED {
            return Err(ProtocolError::UnexpectedStatus {
                status: status.as_u16(),
                context: url,
            }
            .into());
        }

        let text = resp.text().await?;
        let remote: u64 = text.trim().parse().map_err(|_| {
            ProtocolError::UnexpectedResponse(format!("checksum body {:?}", text.trim()))
        })?;
        let local = u64::from(self.stream.checksum());

        if remote != local {
            tracing::warn!(
                transaction = %self.transaction_url,
                local,
                remote,
                "http: checksum mismatch, rejecting transaction"
            );
            if let Err(e) = self
                .connector
                .end_transaction(&self.transaction_url, ResponseCode::BadChecksum)
                .await
            {
                tracing::debug!(error = %e, "http: bad-checksum notification failed");
            }
            self.stop_keep_alive().await;
            return Err(ClientError::ChecksumMismatch { local, remote });
        }

        tracing::debug!(
            transaction = %self.transaction_url,
            packets = self.stream.packets_written(),
            checksum = local,
            "http: transfer confirmed"
        );
        Ok(())
    }

    pub async fn complete(&mut self) -> Result<TransactionResult> {
        self.end(ResponseCode::ConfirmTransaction).await
    }

    pub async fn cancel(&mut self) -> Result<TransactionResult> {
        self.end(ResponseCode::CancelTransaction).await
    }

    async fn end(&mut self, code: ResponseCode) -> Result<TransactionResult> {
        self.stop_keep_alive().await;
        let entity = self
            .connector
            .end_transaction(&self.transaction_url, code)
            .await?;
        TransactionResult::from_entity(entity)
    }

    async fn stop_keep_alive(&mut self) {
        let Some(handle) = self.keep_alive.take() else {
            return;
        };
        handle.abort();
        match handle.await {
            Ok(()) => {}
            Err(e) if e.is_cancelled() => {}
            Err(e) => tracing::warn!(error = %e, "http: keep-alive task panicked"),
        }
    }
}

impl Drop for HttpSession {
    fn drop(&mut self) {
        if let Some(handle) = self.keep_alive.take() {
            handle.abort();
        }
        if let Some(handle) = self.upload.take() {
            handle.abort();
        }
    }
}

/// Extend the server-side TTL every `ttl / 2` until aborted. Failures are
/// logged and the loop keeps going.
fn spawn_keep_alive(connector: HttpConnector, transaction_url: String, ttl: Duration) -> JoinHandle<()> {
    let period = ttl / 2;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        loop {
            ticker.tick().await;
            match connector.extend_ttl(&transaction_url).await {
                Ok(()) => tracing::debug!(transaction = %transaction_url, "http: keep-alive sent"),
                Err(e) => tracing::warn!(
                    transaction = %transaction_url,
                    error = %e,
                    "http: keep-alive failed"
                ),
            }
        }
    })
}
