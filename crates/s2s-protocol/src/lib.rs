//! Site-to-Site protocol -- packet framing, compression, wire constants.
//!
//! Shared by both transports. HTTP carries the framed packet stream as a
//! request body; the raw socket transport interleaves it with `RC` response
//! frames on a single TCP stream.

pub mod codec;
pub mod compression;
pub mod messages;
pub mod packet;

pub use codec::{
    decode_packet, encode_packet, PacketStream, Response, ResponseCodec, MAX_UTF_LEN,
};
pub use compression::{decompress, Compressor};
pub use messages::*;
pub use packet::DataPacket;

/// Magic bytes opening every raw socket connection.
pub const MAGIC_BYTES: [u8; 4] = *b"NiFi";

/// Resource name for the flow file transfer protocol.
pub const SOCKET_PROTOCOL_RESOURCE: &str = "SocketFlowFileProtocol";

/// Protocol versions we can speak, most preferred first.
pub const SOCKET_PROTOCOL_VERSIONS: &[i32] = &[6, 5, 4, 3, 2, 1];

/// Resource name for the flow file codec.
pub const CODEC_RESOURCE: &str = "StandardFlowFileCodec";

/// Codec versions we can speak, most preferred first.
pub const CODEC_VERSIONS: &[i32] = &[1];

/// Resource negotiation status: server accepted the proposed version.
pub const RESOURCE_OK: u8 = 20;

/// Resource negotiation status: server wants a different version (followed by i32 max).
pub const DIFFERENT_RESOURCE_VERSION: u8 = 21;

/// Resource negotiation status: server aborted (followed by UTF message).
pub const ABORT: u8 = 255;

/// HTTP transport protocol version advertised in request headers.
pub const HTTP_PROTOCOL_VERSION: u32 = 1;

/// Base path of the NiFi REST API.
pub const API_BASE_PATH: &str = "/nifi-api";

#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    #[error("invalid response frame: expected 'RC' header, got {0:#06x}")]
    InvalidResponseHeader(u16),
    #[error("unknown response code {0}")]
    UnknownResponseCode(u8),
    #[error("string too long for UTF frame: {len} bytes (max {max})")]
    StringTooLong { len: usize, max: usize },
    #[error("invalid utf-8 in {0}")]
    InvalidUtf8(&'static str),
    #[error("negative length {0} in packet frame")]
    NegativeLength(i64),
    #[error("truncated frame: needed {needed} more bytes")]
    Truncated { needed: usize },
    #[error("invalid compression frame: {0}")]
    Compression(String),
    #[error("missing or empty header {0}")]
    MissingHeader(&'static str),
    #[error("unexpected status {status} from {context}")]
    UnexpectedStatus { status: u16, context: String },
    #[error("unexpected response: {0}")]
    UnexpectedResponse(String),
    #[error("resource negotiation failed: {0}")]
    Negotiation(String),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}
