//! Chunked message framing. Each message travels as one or more chunks, a
//! 16-bit big-endian length prefix followed by that many bytes, terminated
//! by an empty chunk.

use byteorder::{BigEndian, ReadBytesExt, WriteBytesExt};
use std::io;
use std::io::{Read, Write};

/// Default and maximum chunk body sizes.
pub const MAX_CHUNK_SIZE: usize = 16383;
pub const ABSOLUTE_MAX_CHUNK_SIZE: usize = 65535;

/// Accumulates framed messages so that several can be flushed to the socket
/// in a single write.
pub struct ChunkedOutput {
    buffer: Vec<u8>,
    max_chunk_size: usize,
}

impl ChunkedOutput {
    #[inline]
    pub fn new() -> ChunkedOutput {
        ChunkedOutput::with_max_chunk_size(MAX_CHUNK_SIZE)
    }

    #[inline]
    pub fn with_max_chunk_size(max_chunk_size: usize) -> ChunkedOutput {
        assert!(
            max_chunk_size > 0 && max_chunk_size <= ABSOLUTE_MAX_CHUNK_SIZE,
            "chunk size must be within 1..={}, got {}",
            ABSOLUTE_MAX_CHUNK_SIZE,
            max_chunk_size
        );
        ChunkedOutput {
            buffer: Vec::new(),
            max_chunk_size,
        }
    }

    #[inline]
    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    #[inline]
    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Frames one complete message body into the buffer.
    pub fn append_message(&mut self, body: &[u8]) {
        for chunk in body.chunks(self.max_chunk_size) {
            // Infallible: the destination is a growable buffer.
            self.buffer
                .write_u16::<BigEndian>(chunk.len() as u16)
                .unwrap();
            self.buffer.extend_from_slice(chunk);
        }
        self.buffer.write_u16::<BigEndian>(0).unwrap();
    }

    /// Flushes every buffered message to the writer and clears the buffer.
    pub fn write_to<W: Write>(&mut self, writer: &mut W) -> io::Result<usize> {
        let written = self.buffer.len();
        writer.write_all(&self.buffer)?;
        writer.flush()?;
        self.buffer.clear();
        Ok(written)
    }

    #[inline]
    pub fn clear(&mut self) {
        self.buffer.clear();
    }
}

/// Reads one complete message, reassembling chunks until the empty
/// terminator. Blocking reads tolerate arbitrary TCP segmentation; a peer
/// close mid-message surfaces as `UnexpectedEof`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut body = Vec::new();
    loop {
        let size = reader.read_u16::<BigEndian>()? as usize;
        if size == 0 {
            return Ok(body);
        }
        let offset = body.len();
        body.resize(offset + size, 0);
        reader.read_exact(&mut body[offset..])?;
    }
}
