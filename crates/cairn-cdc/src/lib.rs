//! Cairn CDC - content-defined chunking.
//!
//! Splits byte streams into variable-size chunks whose boundaries depend on
//! local content, found with a gear rolling hash and normalised masks.
//!
//! Fixed-size chunking shifts every downstream boundary when bytes are
//! inserted or removed. Content-defined boundaries keep an edit local, so
//! unchanged regions of a re-ingested file map onto the same chunks.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

mod fastcdc;
mod gear;
mod stream;

pub use fastcdc::{chunk, chunk_with_params, ChunkBoundary, ChunkingParams, FastCdcChunker};
pub use gear::{gear_table, GearTable, GEAR_TABLE};
pub use stream::{Chunk, StreamChunker};

use thiserror::Error;

/// Default chunk size parameters.
pub mod params {
    /// Minimum chunk size: 512 bytes
    pub const CHUNK_MIN_SIZE: usize = 512;

    /// Target average chunk size: 1 KiB
    pub const CHUNK_TARGET_SIZE: usize = 1024;

    /// Maximum chunk size: 2 KiB
    pub const CHUNK_MAX_SIZE: usize = 2048;
}

/// Rejected chunking parameters.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ParamsError {
    /// Minimum size must be positive
    #[error("min_size must be greater than zero")]
    ZeroMinSize,

    /// Sizes are not ordered min <= target <= max
    #[error("chunk sizes must satisfy min <= target <= max (got {min} / {target} / {max})")]
    Unordered {
        /// Minimum size
        min: usize,
        /// Target size
        target: usize,
        /// Maximum size
        max: usize,
    },
}
