//! Content hasher.
//!
//! BLAKE3 in default mode with 256-bit output is used both as the chunk
//! dedup key and as the whole-file integrity digest. There is no separate
//! whole-file algorithm: the same function is applied to a wider input.

use crate::identifiers::Digest;

/// Computes the digest of `data` in one shot.
///
/// # Example
/// ```
/// use cairn_core::hash;
///
/// // BLAKE3("") conformance anchor
/// let digest = hash(&[]);
/// assert_eq!(
///     digest.to_hex(),
///     "af1349b9f5f9a1a6a0404dea36dcc9499bcb25c9adc112b7cc9a93cae41f3262"
/// );
/// ```
pub fn hash(data: &[u8]) -> Digest {
    Digest::new(*blake3::hash(data).as_bytes())
}

/// Incremental hasher for streams that do not fit in memory.
///
/// Feeding the chunks of a file in order yields the same digest as hashing
/// the concatenated bytes.
pub struct ContentHasher {
    inner: blake3::Hasher,
    bytes: u64,
}

impl ContentHasher {
    /// Creates a new hasher.
    pub fn new() -> Self {
        Self {
            inner: blake3::Hasher::new(),
            bytes: 0,
        }
    }

    /// Updates the hasher with additional data.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
        self.bytes += data.len() as u64;
    }

    /// Number of bytes fed so far.
    pub fn bytes_hashed(&self) -> u64 {
        self.bytes
    }

    /// Finalizes the hash.
    pub fn finalize(self) -> Digest {
        Digest::new(*self.inner.finalize().as_bytes())
    }
}

impl Default for ContentHasher {
    fn default() -> Self {
        Self::new()
    }
}
