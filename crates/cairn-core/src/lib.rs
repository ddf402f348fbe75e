//! Cairn Core - shared primitives for the Cairn storage engine.
//!
//! This crate provides:
//! - The content hasher (BLAKE3, 256-bit) used for chunk and file digests
//! - Identifier types (`Digest`, `FileId`)
//! - Canonical encoding for the records persisted by `cairn-store`

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod encoding;
pub mod hash;
pub mod identifiers;

pub use encoding::{CanonicalDecode, CanonicalEncode, DecodeError};
pub use hash::{hash, ContentHasher};
pub use identifiers::*;

/// Width of every digest in bytes.
pub const DIGEST_LEN: usize = 32;

/// Width of a file identifier in bytes.
pub const FILE_ID_LEN: usize = 16;
