//! Chunking over any `Read` source.

use std::io::{self, ErrorKind, Read};

use bytes::Bytes;

use crate::fastcdc::{cut_point, ChunkingParams};
use crate::gear::GEAR_TABLE;

/// A chunk produced from a stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Offset of the first byte within the stream
    pub offset: u64,
    /// Chunk payload
    pub data: Bytes,
}

impl Chunk {
    /// Payload length.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Returns true for an empty payload.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }
}

/// Largest single read into the buffer.
const READ_STEP: usize = 64 * 1024;

/// Lazy chunker over a reader.
///
/// Holds at most `max_size` bytes and yields the same boundaries as
/// [`chunk_with_params`](crate::chunk_with_params) applied to the whole
/// stream. A read error is yielded once and ends the iteration.
pub struct StreamChunker<R> {
    reader: R,
    params: ChunkingParams,
    buffer: Vec<u8>,
    offset: u64,
    eof: bool,
    failed: bool,
}

impl<R: Read> StreamChunker<R> {
    /// Creates a chunker reading from `reader`.
    pub fn new(reader: R, params: ChunkingParams) -> Self {
        Self {
            reader,
            params,
            buffer: Vec::with_capacity(params.max_size.min(READ_STEP)),
            offset: 0,
            eof: false,
            failed: false,
        }
    }

    /// Bytes emitted so far.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Tops the buffer up to `max_size` bytes or end of stream.
    fn fill(&mut self) -> io::Result<()> {
        let target = self.params.max_size;
        while !self.eof && self.buffer.len() < target {
            let filled = self.buffer.len();
            self.buffer.resize(filled + (target - filled).min(READ_STEP), 0);
            match self.reader.read(&mut self.buffer[filled..]) {
                Ok(0) => {
                    self.buffer.truncate(filled);
                    self.eof = true;
                }
                Ok(n) => self.buffer.truncate(filled + n),
                Err(e) if e.kind() == ErrorKind::Interrupted => self.buffer.truncate(filled),
                Err(e) => {
                    self.buffer.truncate(filled);
                    return Err(e);
                }
            }
        }
        Ok(())
    }
}

impl<R: Read> Iterator for StreamChunker<R> {
    type Item = io::Result<Chunk>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        if let Err(e) = self.fill() {
            self.failed = true;
            return Some(Err(e));
        }
        if self.buffer.is_empty() {
            return None;
        }

        let len = cut_point(&self.buffer, &self.params, &GEAR_TABLE);
        let data = Bytes::copy_from_slice(&self.buffer[..len]);
        self.buffer.drain(..len);

        let chunk = Chunk {
            offset: self.offset,
            data,
        };
        self.offset += len as u64;
        Some(Ok(chunk))
    }
}
