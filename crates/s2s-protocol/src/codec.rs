//! Packet framing and raw socket response codec.
//!
//! Packet frame: i32 attribute count, then per attribute i32-length-prefixed
//! UTF-8 key and value, then i64 content length and the raw content.
//! Response frame: `'R' 'C'`, one code byte, and a u16-length UTF message for
//! codes that carry one.

use bytes::{Buf, BufMut, Bytes, BytesMut};
use std::collections::BTreeMap;
use tokio_util::codec::{Decoder, Encoder};

use crate::compression::Compressor;
use crate::messages::ResponseCode;
use crate::packet::DataPacket;
use crate::ProtocolError;

/// Maximum encoded length of a u16-prefixed UTF string.
pub const MAX_UTF_LEN: usize = u16::MAX as usize;

const RESPONSE_HEADER: [u8; 2] = *b"RC";

// ============================================================================
// Packet framing
// ============================================================================

/// Append the framed encoding of `packet` to `dst`.
pub fn encode_packet(packet: &DataPacket, dst: &mut BytesMut) {
    let attributes = packet.attributes();
    dst.put_i32(attributes.len() as i32);
    for (key, value) in attributes {
        put_string(dst, key);
        put_string(dst, value);
    }
    dst.put_i64(packet.size());
    dst.extend_from_slice(packet.content());
}

/// Decode one framed packet from `src`, consuming it.
pub fn decode_packet(src: &mut impl Buf) -> Result<DataPacket, ProtocolError> {
    ensure(src, 4)?;
    let count = src.get_i32();
    if count < 0 {
        return Err(ProtocolError::NegativeLength(count as i64));
    }
    let mut attributes = BTreeMap::new();
    for _ in 0..count {
        let key = get_string(src)?;
        let value = get_string(src)?;
        attributes.insert(key, value);
    }
    ensure(src, 8)?;
    let len = src.get_i64();
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len));
    }
    ensure(src, len as usize)?;
    let content = src.copy_to_bytes(len as usize);
    Ok(DataPacket::new(attributes, content))
}

fn put_string(dst: &mut BytesMut, s: &str) {
    dst.put_i32(s.len() as i32);
    dst.extend_from_slice(s.as_bytes());
}

fn get_string(src: &mut impl Buf) -> Result<String, ProtocolError> {
    ensure(src, 4)?;
    let len = src.get_i32();
    if len < 0 {
        return Err(ProtocolError::NegativeLength(len as i64));
    }
    ensure(src, len as usize)?;
    let raw = src.copy_to_bytes(len as usize);
    String::from_utf8(raw.to_vec()).map_err(|_| ProtocolError::InvalidUtf8("attribute"))
}

fn ensure(src: &impl Buf, n: usize) -> Result<(), ProtocolError> {
    if src.remaining() < n {
        return Err(ProtocolError::Truncated {
            needed: n - src.remaining(),
        });
    }
    Ok(())
}

/// Write a u16-length-prefixed UTF-8 string (the handshake string form).
pub fn put_utf(dst: &mut BytesMut, s: &str) -> Result<(), ProtocolError> {
    if s.len() > MAX_UTF_LEN {
        return Err(ProtocolError::StringTooLong {
            len: s.len(),
            max: MAX_UTF_LEN,
        });
    }
    dst.put_u16(s.len() as u16);
    dst.extend_from_slice(s.as_bytes());
    Ok(())
}

// ============================================================================
// Outbound packet stream
// ============================================================================

/// Outbound side of a transaction's data stream.
///
/// Frames packets, keeps the running CRC-32 over the uncompressed frames and
/// optionally wraps the output in the chunked compression format.
pub struct PacketStream {
    crc: crc32fast::Hasher,
    compressor: Option<Compressor>,
    packets: u64,
    bytes: u64,
    scratch: BytesMut,
}

impl PacketStream {
    pub fn new(use_compression: bool) -> Self {
        Self {
            crc: crc32fast::Hasher::new(),
            compressor: use_compression.then(Compressor::new),
            packets: 0,
            bytes: 0,
            scratch: BytesMut::new(),
        }
    }

    /// Frame one packet. Returns the bytes to put on the wire, which may be
    /// empty while the compressor is still filling a chunk.
    pub fn write_packet(&mut self, packet: &DataPacket) -> Result<Bytes, ProtocolError> {
        self.scratch.clear();
        encode_packet(packet, &mut self.scratch);
        self.crc.update(&self.scratch);
        self.packets += 1;
        self.bytes += self.scratch.len() as u64;

        match self.compressor.as_mut() {
            Some(c) => c.write(&self.scratch),
            None => Ok(self.scratch.split().freeze()),
        }
    }

    /// Flush any buffered compressed data and the end-of-stream marker.
    pub fn finish(&mut self) -> Result<Bytes, ProtocolError> {
        match self.compressor.as_mut() {
            Some(c) => c.finish(),
            None => Ok(Bytes::new()),
        }
    }

    /// CRC-32 of every frame written so far.
    pub fn checksum(&self) -> u32 {
        self.crc.clone().finalize()
    }

    pub fn packets_written(&self) -> u64 {
        self.packets
    }

    pub fn bytes_written(&self) -> u64 {
        self.bytes
    }
}

// ============================================================================
// Raw socket response frames
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Response {
    pub code: ResponseCode,
    pub message: Option<String>,
}

impl Response {
    pub fn new(code: ResponseCode) -> Self {
        Self {
            code,
            message: None,
        }
    }

    pub fn with_message(code: ResponseCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: Some(message.into()),
        }
    }
}

/// Codec for `RC` response frames.
pub struct ResponseCodec;

impl Decoder for ResponseCodec {
    type Item = Response;
    type Error = ProtocolError;

    fn decode(&mut self, src: &mut BytesMut) -> Result<Option<Self::Item>, Self::Error> {
        if src.len() < 3 {
            return Ok(None);
        }
        if src[0..2] != RESPONSE_HEADER {
            return Err(ProtocolError::InvalidResponseHeader(u16::from_be_bytes([
                src[0], src[1],
            ])));
        }
        let code = ResponseCode::from_code(src[2])?;

        if !code.has_message() {
            src.advance(3);
            return Ok(Some(Response::new(code)));
        }

        if src.len() < 5 {
            return Ok(None);
        }
        let len = u16::from_be_bytes([src[3], src[4]]) as usize;
        let total = 5 + len;
        if src.len() < total {
            src.reserve(total - src.len());
            return Ok(None);
        }
        src.advance(5);
        let raw = src.split_to(len);
        let message = String::from_utf8(raw.to_vec())
            .map_err(|_| ProtocolError::InvalidUtf8("response message"))?;
        Ok(Some(Response {
            code,
            message: Some(message),
        }))
    }
}

impl Encoder<Response> for ResponseCodec {
    type Error = ProtocolError;

    fn encode(&mut self, item: Response, dst: &mut BytesMut) -> Result<(), Self::Error> {
        dst.extend_from_slice(&RESPONSE_HEADER);
        dst.put_u8(item.code.code());
        if item.code.has_message() {
            put_utf(dst, item.message.as_deref().unwrap_or(""))?;
        }
        Ok(())
    }
}
