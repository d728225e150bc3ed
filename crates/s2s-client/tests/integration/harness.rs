//! Test harness for in-process Site-to-Site integration tests.
//!
//! Provides MockNifi (axum server speaking the HTTP transaction API) and
//! MockRawServer (tokio listener speaking the raw socket protocol). Both
//! decode what they receive and record it for assertions.

use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{header, HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post, put};
use axum::{Json, Router};
use bytes::{Buf, BufMut, BytesMut};
use s2s_client::{ClientConfig, DataPacket};
use s2s_protocol::{decode_packet, decompress, ResponseCode};
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpListener;

pub const PORT_ID: &str = "input-port-1";

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "s2s_client=debug".into()),
        )
        .with_test_writer()
        .try_init();
}

pub fn packet(i: usize) -> DataPacket {
    DataPacket::from_pairs(
        [("id", format!("testId{i}")), ("filename", format!("file-{i}.txt"))],
        format!("content of packet {i}").into_bytes(),
    )
}

pub fn http_config(urls: Vec<String>) -> ClientConfig {
    ClientConfig {
        urls,
        port_identifier: Some(PORT_ID.to_string()),
        timeout_ms: 5_000,
        ..ClientConfig::default()
    }
}

/// A local port nothing listens on.
pub async fn dead_port() -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    listener.local_addr().unwrap().port()
}

/// A URL nothing listens on.
pub async fn dead_url() -> String {
    format!("http://127.0.0.1:{}/nifi", dead_port().await)
}

// ============================================================================
// HTTP mock
// ============================================================================

#[derive(Debug, Clone)]
pub struct MockBehavior {
    pub ttl_secs: u64,
    pub omit_ttl: bool,
    pub corrupt_checksum: bool,
    pub reject_begin: bool,
    pub reject_peers: bool,
    pub omit_intent: bool,
    pub destination_full: bool,
    /// Status for the flow-files upload instead of 202.
    pub flow_files_status: Option<u16>,
    pub flow_file_count: i32,
}

impl Default for MockBehavior {
    fn default() -> Self {
        Self {
            ttl_secs: 30,
            omit_ttl: false,
            corrupt_checksum: false,
            reject_begin: false,
            reject_peers: false,
            omit_intent: false,
            destination_full: false,
            flow_files_status: None,
            flow_file_count: 0,
        }
    }
}

pub struct MockState {
    pub port: u16,
    pub behavior: Mutex<MockBehavior>,
    pub begun: AtomicUsize,
    pub peer_requests: AtomicUsize,
    pub keep_alives: AtomicUsize,
    pub end_codes: Mutex<Vec<u8>>,
    pub received: Mutex<Vec<DataPacket>>,
    pub begin_headers: Mutex<Option<HeaderMap>>,
    pending: Mutex<HashMap<String, Vec<DataPacket>>>,
    next_tx: AtomicUsize,
}

#[allow(dead_code)]
impl MockState {
    fn behavior(&self) -> MockBehavior {
        self.behavior.lock().unwrap().clone()
    }

    pub fn set_behavior(&self, f: impl FnOnce(&mut MockBehavior)) {
        f(&mut self.behavior.lock().unwrap());
    }

    pub fn received(&self) -> Vec<DataPacket> {
        self.received.lock().unwrap().clone()
    }

    pub fn end_codes(&self) -> Vec<u8> {
        self.end_codes.lock().unwrap().clone()
    }

    pub fn begun(&self) -> usize {
        self.begun.load(Ordering::SeqCst)
    }

    pub fn keep_alives(&self) -> usize {
        self.keep_alives.load(Ordering::SeqCst)
    }

    pub fn peer_requests(&self) -> usize {
        self.peer_requests.load(Ordering::SeqCst)
    }
}

pub struct MockNifi {
    pub port: u16,
    pub state: Arc<MockState>,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl MockNifi {
    pub async fn start(behavior: MockBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let state = Arc::new(MockState {
            port,
            behavior: Mutex::new(behavior),
            begun: AtomicUsize::new(0),
            peer_requests: AtomicUsize::new(0),
            keep_alives: AtomicUsize::new(0),
            end_codes: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            begin_headers: Mutex::new(None),
            pending: Mutex::new(HashMap::new()),
            next_tx: AtomicUsize::new(1),
        });

        const TRANSACTIONS: &str = "/nifi-api/data-transfer/input-ports/:port_id/transactions";
        let app = Router::new()
            .route("/nifi-api/site-to-site/peers", get(peers))
            .route(TRANSACTIONS, post(begin))
            .route(
                &format!("{TRANSACTIONS}/:tx_id"),
                put(keep_alive).delete(end),
            )
            .route(&format!("{TRANSACTIONS}/:tx_id/flow-files"), post(flow_files))
            .with_state(state.clone());

        let handle = tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self {
            port,
            state,
            handle,
        }
    }

    pub fn url(&self) -> String {
        format!("http://127.0.0.1:{}/nifi", self.port)
    }
}

impl Drop for MockNifi {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

async fn peers(State(s): State<Arc<MockState>>) -> Response {
    s.peer_requests.fetch_add(1, Ordering::SeqCst);
    let behavior = s.behavior();
    if behavior.reject_peers {
        return (StatusCode::SERVICE_UNAVAILABLE, "cluster is restarting").into_response();
    }
    Json(serde_json::json!({
        "peers": [
            {
                "hostname": "127.0.0.1",
                "port": s.port,
                "secure": false,
                "flowFileCount": behavior.flow_file_count
            }
        ]
    }))
    .into_response()
}

async fn begin(
    State(s): State<Arc<MockState>>,
    Path(port_id): Path<String>,
    headers: HeaderMap,
) -> Response {
    s.begun.fetch_add(1, Ordering::SeqCst);
    let behavior = s.behavior();
    if behavior.reject_begin {
        return (StatusCode::SERVICE_UNAVAILABLE, "port is not running").into_response();
    }
    *s.begin_headers.lock().unwrap() = Some(headers);

    let tx_id = format!("tx-{}", s.next_tx.fetch_add(1, Ordering::SeqCst));
    s.pending.lock().unwrap().insert(tx_id.clone(), Vec::new());
    // Internal host name on purpose: the client must only use the path.
    let location = format!(
        "http://nifi-internal:{}/nifi-api/data-transfer/input-ports/{port_id}/transactions/{tx_id}",
        s.port
    );

    let mut resp = StatusCode::CREATED.into_response();
    let h = resp.headers_mut();
    h.insert(header::LOCATION, HeaderValue::from_str(&location).unwrap());
    if !behavior.omit_intent {
        h.insert("x-location-uri-intent", HeaderValue::from_static("transaction-url"));
    }
    if !behavior.omit_ttl {
        h.insert(
            "x-nifi-site-to-site-server-transaction-ttl",
            HeaderValue::from(behavior.ttl_secs),
        );
    }
    resp
}

async fn flow_files(
    State(s): State<Arc<MockState>>,
    Path((_port_id, tx_id)): Path<(String, String)>,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    let compressed = headers
        .get("x-nifi-site-to-site-use-compression")
        .is_some_and(|v| v.as_bytes() == b"true");
    let frames = if compressed {
        decompress(&body).unwrap()
    } else {
        body.to_vec()
    };

    let behavior = s.behavior();
    if let Some(status) = behavior.flow_files_status {
        let status = StatusCode::from_u16(status).unwrap();
        return (status, "flow files rejected").into_response();
    }
    let mut checksum = u64::from(crc32fast::hash(&frames));
    if behavior.corrupt_checksum {
        checksum += 1;
    }

    let mut buf = Bytes::from(frames);
    let mut packets = Vec::new();
    while buf.has_remaining() {
        packets.push(decode_packet(&mut buf).unwrap());
    }
    s.pending.lock().unwrap().insert(tx_id, packets);

    (StatusCode::ACCEPTED, checksum.to_string()).into_response()
}

async fn keep_alive(
    State(s): State<Arc<MockState>>,
    Path((_port_id, tx_id)): Path<(String, String)>,
) -> StatusCode {
    if !s.pending.lock().unwrap().contains_key(&tx_id) {
        return StatusCode::NOT_FOUND;
    }
    s.keep_alives.fetch_add(1, Ordering::SeqCst);
    StatusCode::OK
}

#[derive(Deserialize)]
struct EndQuery {
    #[serde(rename = "responseCode")]
    response_code: u8,
}

async fn end(
    State(s): State<Arc<MockState>>,
    Path((_port_id, tx_id)): Path<(String, String)>,
    Query(q): Query<EndQuery>,
) -> Json<serde_json::Value> {
    s.end_codes.lock().unwrap().push(q.response_code);
    let packets = s.pending.lock().unwrap().remove(&tx_id).unwrap_or_default();
    let sent = packets.len();

    let code = if q.response_code == ResponseCode::ConfirmTransaction.code() {
        s.received.lock().unwrap().extend(packets);
        if s.behavior().destination_full {
            ResponseCode::TransactionFinishedButDestinationFull.code()
        } else {
            ResponseCode::TransactionFinished.code()
        }
    } else {
        q.response_code
    };

    Json(serde_json::json!({ "flowFileSent": sent, "responseCode": code, "message": null }))
}

// ============================================================================
// Raw socket mock
// ============================================================================

#[derive(Clone)]
pub struct RawBehavior {
    pub max_protocol_version: i32,
    pub corrupt_checksum: bool,
    /// Abort the protocol negotiation with this message.
    pub abort_negotiation: Option<String>,
    /// Announce this many peer-list entries, sending none.
    pub peer_count_override: Option<i32>,
    /// Serve over TLS and report the peer as `localhost`, secure.
    pub tls: Option<Arc<rustls::ServerConfig>>,
}

impl Default for RawBehavior {
    fn default() -> Self {
        Self {
            max_protocol_version: 6,
            corrupt_checksum: false,
            abort_negotiation: None,
            peer_count_override: None,
            tls: None,
        }
    }
}

pub struct RawState {
    pub port: u16,
    pub behavior: RawBehavior,
    pub negotiated: Mutex<Vec<i32>>,
    pub handshakes: Mutex<Vec<Vec<(String, String)>>>,
    pub requests: Mutex<Vec<String>>,
    pub received: Mutex<Vec<DataPacket>>,
    pub bad_checksums: AtomicUsize,
}

pub struct MockRawServer {
    pub port: u16,
    pub state: Arc<RawState>,
    handle: tokio::task::JoinHandle<()>,
}

#[allow(dead_code)]
impl MockRawServer {
    pub async fn start(behavior: RawBehavior) -> Self {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let port = listener.local_addr().unwrap().port();
        let acceptor = behavior.tls.clone().map(tokio_rustls::TlsAcceptor::from);
        let state = Arc::new(RawState {
            port,
            behavior,
            negotiated: Mutex::new(Vec::new()),
            handshakes: Mutex::new(Vec::new()),
            requests: Mutex::new(Vec::new()),
            received: Mutex::new(Vec::new()),
            bad_checksums: AtomicUsize::new(0),
        });

        let accept_state = state.clone();
        let handle = tokio::spawn(async move {
            while let Ok((sock, _)) = listener.accept().await {
                let state = accept_state.clone();
                let acceptor = acceptor.clone();
                tokio::spawn(async move {
                    let result = match acceptor {
                        Some(acceptor) => match acceptor.accept(sock).await {
                            Ok(tls) => handle_raw(tls, state).await,
                            Err(e) => Err(e),
                        },
                        None => handle_raw(sock, state).await,
                    };
                    if let Err(e) = result {
                        tracing::debug!(error = %e, "mock raw: connection ended");
                    }
                });
            }
        });
        Self {
            port,
            state,
            handle,
        }
    }

    /// Client config for this server. The seed's HTTP port is never dialled.
    pub fn config(&self) -> ClientConfig {
        let seed = if self.state.behavior.tls.is_some() {
            "https://localhost:1/nifi"
        } else {
            "http://127.0.0.1:1/nifi"
        };
        ClientConfig {
            transport: s2s_client::TransportProtocol::Raw,
            raw_port: Some(self.port),
            ..http_config(vec![seed.to_string()])
        }
    }

    pub fn received(&self) -> Vec<DataPacket> {
        self.state.received.lock().unwrap().clone()
    }
}

impl Drop for MockRawServer {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Self-signed `localhost` certificate as matching server and client configs.
pub struct TestTls {
    pub server: Arc<rustls::ServerConfig>,
    pub client: Arc<rustls::ClientConfig>,
}

#[allow(dead_code)]
pub fn test_tls() -> TestTls {
    use rustls::pki_types::{PrivateKeyDer, PrivatePkcs8KeyDer};

    let rcgen::CertifiedKey { cert, key_pair } =
        rcgen::generate_simple_self_signed(vec!["localhost".to_string()]).unwrap();
    let cert_der = cert.der().clone();
    let key = PrivateKeyDer::Pkcs8(PrivatePkcs8KeyDer::from(key_pair.serialize_der()));
    let provider = Arc::new(rustls::crypto::ring::default_provider());

    let server = rustls::ServerConfig::builder_with_provider(provider.clone())
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_no_client_auth()
        .with_single_cert(vec![cert_der.clone()], key)
        .unwrap();

    let mut roots = rustls::RootCertStore::empty();
    roots.add(cert_der).unwrap();
    let client = rustls::ClientConfig::builder_with_provider(provider)
        .with_safe_default_protocol_versions()
        .unwrap()
        .with_root_certificates(roots)
        .with_no_client_auth();

    TestTls {
        server: Arc::new(server),
        client: Arc::new(client),
    }
}

async fn send<S: AsyncWrite + Unpin>(sock: &mut S, buf: &[u8]) -> std::io::Result<()> {
    sock.write_all(buf).await?;
    sock.flush().await
}

async fn read_utf<S: AsyncRead + Unpin>(sock: &mut S) -> std::io::Result<String> {
    let len = sock.read_u16().await? as usize;
    let mut buf = vec![0u8; len];
    sock.read_exact(&mut buf).await?;
    Ok(String::from_utf8(buf).expect("utf-8"))
}

fn put_utf(buf: &mut BytesMut, s: &str) {
    buf.put_u16(s.len() as u16);
    buf.extend_from_slice(s.as_bytes());
}

async fn write_rc<S: AsyncWrite + Unpin>(
    sock: &mut S,
    code: ResponseCode,
    message: Option<&str>,
) -> std::io::Result<()> {
    let mut buf = BytesMut::new();
    buf.extend_from_slice(b"RC");
    buf.put_u8(code.code());
    if code.has_message() {
        put_utf(&mut buf, message.unwrap_or(""));
    }
    send(sock, &buf).await
}

async fn read_rc<S: AsyncRead + Unpin>(
    sock: &mut S,
) -> std::io::Result<(ResponseCode, Option<String>)> {
    let mut header = [0u8; 3];
    sock.read_exact(&mut header).await?;
    assert_eq!(&header[..2], b"RC");
    let code = ResponseCode::from_code(header[2]).expect("known response code");
    let message = if code.has_message() {
        Some(read_utf(sock).await?)
    } else {
        None
    };
    Ok((code, message))
}

/// Returns the agreed version, or `None` after aborting.
async fn negotiate<S: AsyncRead + AsyncWrite + Unpin>(
    sock: &mut S,
    server_max: i32,
    abort: Option<&str>,
) -> std::io::Result<Option<i32>> {
    loop {
        let _resource = read_utf(sock).await?;
        let version = sock.read_i32().await?;
        let mut buf = BytesMut::new();
        if let Some(message) = abort {
            buf.put_u8(s2s_protocol::ABORT);
            put_utf(&mut buf, message);
            send(sock, &buf).await?;
            return Ok(None);
        }
        if version > server_max {
            buf.put_u8(s2s_protocol::DIFFERENT_RESOURCE_VERSION);
            buf.put_i32(server_max);
            send(sock, &buf).await?;
            continue;
        }
        buf.put_u8(s2s_protocol::RESOURCE_OK);
        send(sock, &buf).await?;
        return Ok(Some(version));
    }
}

/// Read one packet frame, returning its raw bytes.
async fn read_frame<S: AsyncRead + Unpin>(sock: &mut S) -> std::io::Result<Vec<u8>> {
    let mut frame = Vec::new();
    let count = sock.read_i32().await?;
    frame.extend_from_slice(&count.to_be_bytes());
    for _ in 0..count * 2 {
        let len = sock.read_i32().await?;
        frame.extend_from_slice(&len.to_be_bytes());
        let mut s = vec![0u8; len as usize];
        sock.read_exact(&mut s).await?;
        frame.extend_from_slice(&s);
    }
    let len = sock.read_i64().await?;
    frame.extend_from_slice(&len.to_be_bytes());
    let mut content = vec![0u8; len as usize];
    sock.read_exact(&mut content).await?;
    frame.extend_from_slice(&content);
    Ok(frame)
}

/// Read one compressed packet stream and inflate it.
async fn read_compressed_frame<S: AsyncRead + Unpin>(sock: &mut S) -> std::io::Result<Vec<u8>> {
    let mut stream = Vec::new();
    loop {
        let mut header = [0u8; 12];
        sock.read_exact(&mut header).await?;
        assert_eq!(&header[..4], b"SYNC");
        let compressed_len = i32::from_be_bytes(header[8..12].try_into().unwrap());
        let mut data = vec![0u8; compressed_len as usize];
        sock.read_exact(&mut data).await?;
        stream.extend_from_slice(&header);
        stream.extend_from_slice(&data);

        let more = sock.read_u8().await?;
        stream.push(more);
        if more == 0 {
            break;
        }
    }
    Ok(decompress(&stream).unwrap())
}

async fn handle_raw<S: AsyncRead + AsyncWrite + Unpin>(
    mut sock: S,
    state: Arc<RawState>,
) -> std::io::Result<()> {
    let behavior = &state.behavior;
    let mut magic = [0u8; 4];
    sock.read_exact(&mut magic).await?;
    assert_eq!(&magic, b"NiFi");

    let abort = behavior.abort_negotiation.as_deref();
    let Some(version) = negotiate(&mut sock, behavior.max_protocol_version, abort).await? else {
        return Ok(());
    };
    state.negotiated.lock().unwrap().push(version);

    let _comms_id = read_utf(&mut sock).await?;
    if version >= 3 {
        let _peer_uri = read_utf(&mut sock).await?;
    }
    let count = sock.read_i32().await?;
    let mut props = Vec::new();
    for _ in 0..count {
        let key = read_utf(&mut sock).await?;
        let value = read_utf(&mut sock).await?;
        props.push((key, value));
    }
    let compressed = props.iter().any(|(k, v)| k == "GZIP" && v == "true");
    state.handshakes.lock().unwrap().push(props);
    write_rc(&mut sock, ResponseCode::PropertiesOk, None).await?;

    loop {
        let request = read_utf(&mut sock).await?;
        state.requests.lock().unwrap().push(request.clone());
        match request.as_str() {
            "REQUEST_PEER_LIST" => {
                let mut buf = BytesMut::new();
                if let Some(count) = behavior.peer_count_override {
                    buf.put_i32(count);
                } else {
                    let secure = behavior.tls.is_some();
                    buf.put_i32(1);
                    put_utf(&mut buf, if secure { "localhost" } else { "127.0.0.1" });
                    buf.put_i32(i32::from(state.port));
                    buf.put_u8(u8::from(secure));
                    buf.put_i32(3);
                }
                send(&mut sock, &buf).await?;
            }
            "NEGOTIATE_FLOWFILE_CODEC" => {
                negotiate(&mut sock, 1, None).await?;
            }
            "SEND_FLOWFILES" => receive_flow_files(&mut sock, &state, compressed).await?,
            "SHUTDOWN" => return Ok(()),
            other => panic!("unexpected request type {other}"),
        }
    }
}

async fn receive_flow_files<S: AsyncRead + AsyncWrite + Unpin>(
    sock: &mut S,
    state: &RawState,
    compressed: bool,
) -> std::io::Result<()> {
    let mut frames = Vec::new();
    let mut packets = Vec::new();
    loop {
        let frame = if compressed {
            read_compressed_frame(sock).await?
        } else {
            read_frame(sock).await?
        };
        frames.extend_from_slice(&frame);
        packets.push(decode_packet(&mut Bytes::from(frame)).unwrap());
        match read_rc(sock).await?.0 {
            ResponseCode::ContinueTransaction => continue,
            ResponseCode::FinishTransaction => break,
            other => panic!("unexpected response {other}"),
        }
    }

    let mut checksum = u64::from(crc32fast::hash(&frames));
    if state.behavior.corrupt_checksum {
        checksum += 1;
    }
    write_rc(sock, ResponseCode::ConfirmTransaction, Some(&checksum.to_string())).await?;

    match read_rc(sock).await?.0 {
        ResponseCode::ConfirmTransaction => {
            state.received.lock().unwrap().extend(packets);
            write_rc(sock, ResponseCode::TransactionFinished, None).await
        }
        ResponseCode::BadChecksum => {
            state.bad_checksums.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }
        other => panic!("unexpected confirmation {other}"),
    }
}
