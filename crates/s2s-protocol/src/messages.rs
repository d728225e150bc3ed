//! Response codes, request types, handshake properties and HTTP DTOs.

use serde::{Deserialize, Serialize};

use crate::ProtocolError;

// ============================================================================
// Response codes (shared by both transports)
// ============================================================================

/// Transaction response codes. Raw socket frames carry them as a single byte;
/// HTTP carries them as the `responseCode` query parameter and JSON field.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub enum ResponseCode {
    Reserved,
    PropertiesOk,
    UnknownPropertyName,
    IllegalPropertyValue,
    MissingProperty,
    ContinueTransaction,
    FinishTransaction,
    ConfirmTransaction,
    TransactionFinished,
    TransactionFinishedButDestinationFull,
    CancelTransaction,
    BadChecksum,
    MoreData,
    NoMoreData,
    UnknownPort,
    PortNotInValidState,
    PortsDestinationFull,
    Unauthorized,
    Abort,
    UnrecognizedResponseCode,
    EndOfStream,
}

impl ResponseCode {
    pub fn code(self) -> u8 {
        match self {
            ResponseCode::Reserved => 0,
            ResponseCode::PropertiesOk => 1,
            ResponseCode::UnknownPropertyName => 230,
            ResponseCode::IllegalPropertyValue => 231,
            ResponseCode::MissingProperty => 232,
            ResponseCode::ContinueTransaction => 10,
            ResponseCode::FinishTransaction => 11,
            ResponseCode::ConfirmTransaction => 12,
            ResponseCode::TransactionFinished => 13,
            ResponseCode::TransactionFinishedButDestinationFull => 14,
            ResponseCode::CancelTransaction => 15,
            ResponseCode::BadChecksum => 19,
            ResponseCode::MoreData => 20,
            ResponseCode::NoMoreData => 21,
            ResponseCode::UnknownPort => 200,
            ResponseCode::PortNotInValidState => 201,
            ResponseCode::PortsDestinationFull => 202,
            ResponseCode::Unauthorized => 240,
            ResponseCode::Abort => 250,
            ResponseCode::UnrecognizedResponseCode => 254,
            ResponseCode::EndOfStream => 255,
        }
    }

    pub fn from_code(code: u8) -> Result<Self, ProtocolError> {
        let rc = match code {
            0 => ResponseCode::Reserved,
            1 => ResponseCode::PropertiesOk,
            230 => ResponseCode::UnknownPropertyName,
            231 => ResponseCode::IllegalPropertyValue,
            232 => ResponseCode::MissingProperty,
            10 => ResponseCode::ContinueTransaction,
            11 => ResponseCode::FinishTransaction,
            12 => ResponseCode::ConfirmTransaction,
            13 => ResponseCode::TransactionFinished,
            14 => ResponseCode::TransactionFinishedButDestinationFull,
            15 => ResponseCode::CancelTransaction,
            19 => ResponseCode::BadChecksum,
            20 => ResponseCode::MoreData,
            21 => ResponseCode::NoMoreData,
            200 => ResponseCode::UnknownPort,
            201 => ResponseCode::PortNotInValidState,
            202 => ResponseCode::PortsDestinationFull,
            240 => ResponseCode::Unauthorized,
            250 => ResponseCode::Abort,
            254 => ResponseCode::UnrecognizedResponseCode,
            255 => ResponseCode::EndOfStream,
            other => return Err(ProtocolError::UnknownResponseCode(other)),
        };
        Ok(rc)
    }

    /// Whether a raw socket frame with this code carries a UTF message.
    pub fn has_message(self) -> bool {
        matches!(
            self,
            ResponseCode::UnknownPropertyName
                | ResponseCode::IllegalPropertyValue
                | ResponseCode::MissingProperty
                | ResponseCode::ConfirmTransaction
                | ResponseCode::CancelTransaction
                | ResponseCode::PortNotInValidState
                | ResponseCode::Unauthorized
                | ResponseCode::Abort
        )
    }
}

impl TryFrom<u8> for ResponseCode {
    type Error = ProtocolError;

    fn try_from(code: u8) -> Result<Self, Self::Error> {
        Self::from_code(code)
    }
}

impl From<ResponseCode> for u8 {
    fn from(rc: ResponseCode) -> u8 {
        rc.code()
    }
}

impl std::fmt::Display for ResponseCode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{:?}({})", self, self.code())
    }
}

// ============================================================================
// Raw socket request types
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestType {
    NegotiateFlowFileCodec,
    RequestPeerList,
    SendFlowFiles,
    ReceiveFlowFiles,
    Shutdown,
}

impl RequestType {
    pub fn as_str(self) -> &'static str {
        match self {
            RequestType::NegotiateFlowFileCodec => "NEGOTIATE_FLOWFILE_CODEC",
            RequestType::RequestPeerList => "REQUEST_PEER_LIST",
            RequestType::SendFlowFiles => "SEND_FLOWFILES",
            RequestType::ReceiveFlowFiles => "RECEIVE_FLOWFILES",
            RequestType::Shutdown => "SHUTDOWN",
        }
    }
}

// ============================================================================
// Handshake properties
// ============================================================================

/// Raw socket handshake property keys.
pub mod handshake {
    pub const GZIP: &str = "GZIP";
    pub const PORT_IDENTIFIER: &str = "PORT_IDENTIFIER";
    pub const REQUEST_EXPIRATION_MILLIS: &str = "REQUEST_EXPIRATION_MILLIS";
    pub const BATCH_COUNT: &str = "BATCH_COUNT";
    pub const BATCH_SIZE: &str = "BATCH_SIZE";
    pub const BATCH_DURATION: &str = "BATCH_DURATION";
}

/// HTTP header names used by the transaction endpoints.
pub mod headers {
    pub const LOCATION_URI_INTENT: &str = "x-location-uri-intent";
    pub const LOCATION_URI_INTENT_TRANSACTION_URL: &str = "transaction-url";
    pub const SERVER_TRANSACTION_TTL: &str = "x-nifi-site-to-site-server-transaction-ttl";
    pub const PROTOCOL_VERSION: &str = "x-nifi-site-to-site-protocol-version";
    pub const USE_COMPRESSION: &str = "x-nifi-site-to-site-use-compression";
    pub const REQUEST_EXPIRATION: &str = "x-nifi-site-to-site-request-expiration";
    pub const BATCH_COUNT: &str = "x-nifi-site-to-site-batch-count";
    pub const BATCH_SIZE: &str = "x-nifi-site-to-site-batch-size";
    pub const BATCH_DURATION: &str = "x-nifi-site-to-site-batch-duration";
}

/// Negotiated handshake parameters, rendered as HTTP headers or raw properties.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HandshakeProperties {
    pub use_compression: bool,
    pub request_expiration_ms: u64,
    pub batch_count: u64,
    pub batch_size: u64,
    pub batch_duration_ms: u64,
}

impl HandshakeProperties {
    /// HTTP header pairs; zero-valued settings are omitted.
    pub fn http_headers(&self) -> Vec<(&'static str, String)> {
        let mut out = Vec::new();
        if self.use_compression {
            out.push((headers::USE_COMPRESSION, "true".to_string()));
        }
        if self.request_expiration_ms > 0 {
            out.push((
                headers::REQUEST_EXPIRATION,
                self.request_expiration_ms.to_string(),
            ));
        }
        if self.batch_count > 0 {
            out.push((headers::BATCH_COUNT, self.batch_count.to_string()));
        }
        if self.batch_size > 0 {
            out.push((headers::BATCH_SIZE, self.batch_size.to_string()));
        }
        if self.batch_duration_ms > 0 {
            out.push((headers::BATCH_DURATION, self.batch_duration_ms.to_string()));
        }
        out
    }

    /// Raw socket property map for the given protocol version.
    pub fn socket_properties(
        &self,
        port_identifier: Option<&str>,
        protocol_version: i32,
    ) -> Vec<(&'static str, String)> {
        let mut out = vec![(handshake::GZIP, self.use_compression.to_string())];
        if let Some(port) = port_identifier {
            out.push((handshake::PORT_IDENTIFIER, port.to_string()));
        }
        out.push((
            handshake::REQUEST_EXPIRATION_MILLIS,
            self.request_expiration_ms.to_string(),
        ));
        if protocol_version >= 5 {
            if self.batch_count > 0 {
                out.push((handshake::BATCH_COUNT, self.batch_count.to_string()));
            }
            if self.batch_size > 0 {
                out.push((handshake::BATCH_SIZE, self.batch_size.to_string()));
            }
            if self.batch_duration_ms > 0 {
                out.push((handshake::BATCH_DURATION, self.batch_duration_ms.to_string()));
            }
        }
        out
    }
}

// ============================================================================
// HTTP DTOs
// ============================================================================

/// Body of `DELETE {transactionUrl}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TransactionResultEntity {
    #[serde(default)]
    pub flow_file_sent: i64,
    pub response_code: u8,
    #[serde(default)]
    pub message: Option<String>,
}

/// One entry of `GET /site-to-site/peers`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PeerDto {
    pub hostname: String,
    pub port: i32,
    #[serde(default)]
    pub secure: bool,
    #[serde(default)]
    pub flow_file_count: i32,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PeersEntity {
    #[serde(default)]
    pub peers: Vec<PeerDto>,
}
