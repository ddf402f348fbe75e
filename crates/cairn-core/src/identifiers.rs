//! Identifier types.
//!
//! - `Digest` - BLAKE3 of a chunk payload or of a whole file
//! - `FileId` - opaque random identifier, stable for a file's lifetime

use std::fmt;
use std::str::FromStr;

use bytes::{Bytes, BytesMut};
use uuid::Uuid;

use crate::encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
use crate::{DIGEST_LEN, FILE_ID_LEN};

/// Content digest: BLAKE3(bytes), 256 bits.
///
/// Identifies a chunk in the store and doubles as the whole-file
/// integrity check.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct Digest(pub [u8; DIGEST_LEN]);

impl Digest {
    /// Creates a digest from raw bytes.
    pub const fn new(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }

    /// Hashes `data`.
    pub fn of(data: &[u8]) -> Self {
        crate::hash::hash(data)
    }

    /// Returns the inner bytes.
    pub const fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }

    /// Returns the inner bytes as a slice.
    pub fn as_slice(&self) -> &[u8] {
        &self.0
    }

    /// Builds a digest from a 32-byte slice, as stored in database keys.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        let arr: [u8; DIGEST_LEN] =
            bytes
                .try_into()
                .map_err(|_| DecodeError::InsufficientBytes {
                    expected: DIGEST_LEN,
                    available: bytes.len(),
                })?;
        Ok(Self(arr))
    }

    /// Creates from a hex string.
    pub fn from_hex(s: &str) -> Result<Self, hex::FromHexError> {
        let bytes = hex::decode(s)?;
        if bytes.len() != DIGEST_LEN {
            return Err(hex::FromHexError::InvalidStringLength);
        }
        let mut arr = [0u8; DIGEST_LEN];
        arr.copy_from_slice(&bytes);
        Ok(Self(arr))
    }

    /// Returns as a hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }
}

impl fmt::Debug for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Digest({})", &self.to_hex()[..16])
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", &self.to_hex()[..16])
    }
}

impl From<[u8; DIGEST_LEN]> for Digest {
    fn from(bytes: [u8; DIGEST_LEN]) -> Self {
        Self(bytes)
    }
}

impl AsRef<[u8]> for Digest {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

impl CanonicalEncode for Digest {
    fn encode(&self, buf: &mut BytesMut) {
        self.0.encode(buf);
    }
}

impl CanonicalDecode for Digest {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        Ok(Self(<[u8; DIGEST_LEN]>::decode(buf)?))
    }
}

/// File identifier (random UUID v4).
///
/// Identifies a file independently of its path and content, so a file
/// keeps its identity across re-ingestion and renames.
#[derive(Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FileId(Uuid);

impl FileId {
    /// Generates a fresh random identifier.
    pub fn random() -> Self {
        Self(Uuid::new_v4())
    }

    /// Wraps an existing UUID.
    pub const fn from_uuid(uuid: Uuid) -> Self {
        Self(uuid)
    }

    /// Returns the 16 raw bytes, used as the key prefix in storage.
    pub fn as_bytes(&self) -> &[u8; FILE_ID_LEN] {
        self.0.as_bytes()
    }

    /// Builds an identifier from the 16 raw bytes of a storage key.
    pub fn from_slice(bytes: &[u8]) -> Result<Self, DecodeError> {
        Uuid::from_slice(bytes)
            .map(Self)
            .map_err(|_| DecodeError::InsufficientBytes {
                expected: FILE_ID_LEN,
                available: bytes.len(),
            })
    }
}

impl fmt::Debug for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "FileId({})", self.0)
    }
}

impl fmt::Display for FileId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for FileId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s).map(Self)
    }
}

impl CanonicalEncode for FileId {
    fn encode(&self, buf: &mut BytesMut) {
        self.as_bytes().encode(buf);
    }
}

impl CanonicalDecode for FileId {
    fn decode(buf: &mut Bytes) -> Result<Self, DecodeError> {
        let bytes = <[u8; FILE_ID_LEN]>::decode(buf)?;
        Ok(Self(Uuid::from_bytes(bytes)))
    }
}
