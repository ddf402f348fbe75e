//! Persisted row values.
//!
//! Every value starts with a one-byte format version so rows written by
//! older builds are detected instead of misread.

use bytes::{Bytes, BytesMut};
use cairn_core::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use cairn_core::{Digest, FileId};

const RECORD_VERSION: u8 = 1;

fn check_version(buf: &mut Bytes) -> Result<(), DecodeError> {
    let version = u8::decode(buf)?;
    if version != RECORD_VERSION {
        return Err(DecodeError::UnsupportedVersion(version));
    }
    Ok(())
}

/// A file row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRecord {
    /// File identifier (also the row key)
    pub id: FileId,
    /// Display name, usually the last path component
    pub name: String,
    /// Logical path, unique across live files
    pub path: String,
    /// Digest of the complete byte stream
    pub hash: Digest,
    /// Total size in bytes
    pub size: u64,
    /// Number of sections
    pub chunk_count: u64,
}

impl CanonicalEncode for FileRecord {
    fn encode(&self, buf: &mut BytesMut) {
        RECORD_VERSION.encode(buf);
        self.id.encode(buf);
        self.name.encode(buf);
        self.path.encode(buf);
        self.hash.encode(buf);
        self.size.encode(buf);
        self.chunk_count.encode(buf);
    }
}

impl CanonicalDecode for FileRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(buf)?;
        Ok(Self {
            id: FileId::decode(buf)?,
            name: String::decode(buf)?,
            path: String::decode(buf)?,
            hash: Digest::decode(buf)?,
            size: u64::decode(buf)?,
            chunk_count: u64::decode(buf)?,
        })
    }
}

/// A section row: one chunk at one position of a file.
///
/// The chunk index lives in the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SectionRecord {
    /// Referenced chunk
    pub chunk_hash: Digest,
    /// Byte offset of the chunk within the file
    pub offset: u64,
    /// Chunk size, denormalised from the chunk row
    pub size: u64,
}

impl CanonicalEncode for SectionRecord {
    fn encode(&self, buf: &mut BytesMut) {
        RECORD_VERSION.encode(buf);
        self.chunk_hash.encode(buf);
        self.offset.encode(buf);
        self.size.encode(buf);
    }
}

impl CanonicalDecode for SectionRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(buf)?;
        Ok(Self {
            chunk_hash: Digest::decode(buf)?,
            offset: u64::decode(buf)?,
            size: u64::decode(buf)?,
        })
    }
}

/// A chunk row. The digest is the key.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChunkRecord {
    /// Payload size in bytes
    pub size: u64,
}

impl CanonicalEncode for ChunkRecord {
    fn encode(&self, buf: &mut BytesMut) {
        RECORD_VERSION.encode(buf);
        self.size.encode(buf);
    }
}

impl CanonicalDecode for ChunkRecord {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        check_version(buf)?;
        Ok(Self {
            size: u64::decode(buf)?,
        })
    }
}
