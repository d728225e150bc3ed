//! Chunked compression stream.
//!
//! Each chunk: `SYNC`, i32 uncompressed length, i32 compressed length, zlib
//! (level 1) data. A `1` byte precedes every chunk after the first; a `0`
//! byte ends the stream.

use bytes::{BufMut, Bytes, BytesMut};
use flate2::read::ZlibDecoder;
use flate2::write::ZlibEncoder;
use flate2::Compression;
use std::io::{Read, Write};

use crate::ProtocolError;

pub const SYNC_BYTES: [u8; 4] = *b"SYNC";

/// Uncompressed bytes buffered before a chunk is emitted.
pub const CHUNK_SIZE: usize = 64 * 1024;

const COMPRESSION_LEVEL: u32 = 1;

pub struct Compressor {
    buffer: Vec<u8>,
    chunks_written: u64,
    finished: bool,
}

impl Default for Compressor {
    fn default() -> Self {
        Self::new()
    }
}

impl Compressor {
    pub fn new() -> Self {
        Self {
            buffer: Vec::with_capacity(CHUNK_SIZE),
            chunks_written: 0,
            finished: false,
        }
    }

    /// Buffer `data`, returning any chunks that filled up.
    pub fn write(&mut self, mut data: &[u8]) -> Result<Bytes, ProtocolError> {
        if self.finished {
            return Err(ProtocolError::Compression("write after finish".into()));
        }
        let mut out = BytesMut::new();
        while !data.is_empty() {
            let room = CHUNK_SIZE - self.buffer.len();
            let take = room.min(data.len());
            self.buffer.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.buffer.len() == CHUNK_SIZE {
                self.emit_chunk(&mut out)?;
            }
        }
        Ok(out.freeze())
    }

    /// Emit the pending chunk and the end-of-stream marker.
    pub fn finish(&mut self) -> Result<Bytes, ProtocolError> {
        if self.finished {
            return Ok(Bytes::new());
        }
        let mut out = BytesMut::new();
        if !self.buffer.is_empty() {
            self.emit_chunk(&mut out)?;
        }
        out.put_u8(0);
        self.finished = true;
        Ok(out.freeze())
    }

    fn emit_chunk(&mut self, out: &mut BytesMut) -> Result<(), ProtocolError> {
        let mut encoder = ZlibEncoder::new(Vec::new(), Compression::new(COMPRESSION_LEVEL));
        encoder.write_all(&self.buffer)?;
        let compressed = encoder.finish()?;

        if self.chunks_written > 0 {
            out.put_u8(1);
        }
        out.extend_from_slice(&SYNC_BYTES);
        out.put_i32(self.buffer.len() as i32);
        out.put_i32(compressed.len() as i32);
        out.extend_from_slice(&compressed);

        self.chunks_written += 1;
        self.buffer.clear();
        Ok(())
    }
}

/// Inflate a complete compressed stream.
pub fn decompress(mut input: &[u8]) -> Result<Vec<u8>, ProtocolError> {
    let mut out = Vec::new();

    if input.first() == Some(&0) {
        return Ok(out);
    }

    loop {
        if input.len() < 12 || input[..4] != SYNC_BYTES {
            return Err(ProtocolError::Compression("missing sync bytes".into()));
        }
        let original = i32::from_be_bytes([input[4], input[5], input[6], input[7]]);
        let compressed = i32::from_be_bytes([input[8], input[9], input[10], input[11]]);
        if original < 0 || compressed < 0 {
            return Err(ProtocolError::Compression("negative chunk length".into()));
        }
        input = &input[12..];
        let compressed = compressed as usize;
        if input.len() < compressed {
            return Err(ProtocolError::Compression("truncated chunk".into()));
        }

        let mut chunk = Vec::with_capacity(original as usize);
        ZlibDecoder::new(&input[..compressed]).read_to_end(&mut chunk)?;
        if chunk.len() != original as usize {
            return Err(ProtocolError::Compression(format!(
                "chunk inflated to {} bytes, header says {original}",
                chunk.len()
            )));
        }
        out.extend_from_slice(&chunk);
        input = &input[compressed..];

        match input.first() {
            Some(1) => input = &input[1..],
            Some(0) => return Ok(out),
            Some(other) => {
                return Err(ProtocolError::Compression(format!(
                    "unexpected continuation byte {other}"
                )))
            }
            None => return Err(ProtocolError::Compression("missing end marker".into())),
        }
    }
}
