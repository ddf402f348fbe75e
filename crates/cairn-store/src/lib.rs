//! Cairn Store - deduplicating storage engine.
//!
//! Provides:
//! - A blob medium abstraction for chunk payloads (filesystem or memory)
//! - The chunk store (one row and one payload per digest)
//! - The file catalog (files, path index, ordered sections)
//! - Verified reconstruction of files from their sections
//! - Mark-and-sweep garbage collection of unreferenced chunks
//! - The `Engine` facade tying ingestion, restore and GC together
//!
//! Metadata lives in a RocksDB `TransactionDB`. Referential checks between
//! sections and chunks are enforced here, under pessimistic row locks.

#![deny(unsafe_code)]
#![warn(missing_docs, rust_2018_idioms)]

pub mod blob;
pub mod catalog;
pub mod chunk;
pub mod config;
pub mod db;
pub mod engine;
pub mod gc;
pub mod records;
pub mod restore;

pub use blob::{BlobMedium, FsBlobMedium, MemoryBlobMedium};
pub use catalog::{Catalog, IngestRecord, Section};
pub use chunk::{ChunkLease, ChunkStore, ChunkStoreStats, PutOutcome};
pub use config::StoreConfig;
pub use db::Database;
pub use engine::{ChangeSet, Engine, EngineStats, IngestReport};
pub use gc::{GarbageCollector, GcPhase, GcReport, STALE_TEMP_AGE};
pub use records::{ChunkRecord, FileRecord, SectionRecord};
pub use restore::{IntegrityFault, Reconstructor};

use cairn_core::{Digest, FileId};
use thiserror::Error;

/// Errors from storage operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// RocksDB error
    #[error("Database error: {0}")]
    Database(String),

    /// Lock wait timed out or the database reported contention
    #[error("Storage busy: {0}")]
    Busy(String),

    /// Encoding error
    #[error("Encoding error: {0}")]
    Encoding(#[from] cairn_core::DecodeError),

    /// File not found
    #[error("File not found: {0}")]
    FileNotFound(FileId),

    /// Chunk not found
    #[error("Chunk not found: {0}")]
    ChunkNotFound(Digest),

    /// Chunk row exists but its payload is gone from the medium
    #[error("Chunk {0} has no payload in the blob medium")]
    MissingPayload(Digest),

    /// Path already belongs to another live file
    #[error("Path {path} is already owned by file {owner}")]
    PathConflict {
        /// Conflicting path
        path: String,
        /// File currently holding the path
        owner: FileId,
    },

    /// A section references a chunk the store does not hold
    #[error("File {file_id} references missing chunk {digest}")]
    MissingChunk {
        /// Referencing file
        file_id: FileId,
        /// Missing chunk
        digest: Digest,
    },

    /// Stored bytes do not match their recorded digest, size or layout
    #[error("Integrity violation in file {file_id}: {fault}")]
    IntegrityViolation {
        /// Affected file
        file_id: FileId,
        /// What failed
        fault: IntegrityFault,
    },

    /// Same digest offered with a different size than the stored row
    #[error("Chunk {digest} size mismatch: stored {stored}, offered {offered}")]
    ChunkSizeMismatch {
        /// Chunk digest
        digest: Digest,
        /// Size in the chunk row
        stored: u64,
        /// Size offered by the caller
        offered: u64,
    },

    /// Invalid data
    #[error("Invalid data: {0}")]
    InvalidData(String),

    /// Path cannot be stored (not UTF-8, no file name)
    #[error("Invalid path: {0}")]
    InvalidPath(String),

    /// Rejected configuration
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
}

impl StoreError {
    /// Errors worth retrying: lock contention and blob medium IO.
    pub fn is_transient(&self) -> bool {
        matches!(self, StoreError::Busy(_) | StoreError::Io(_))
    }

    /// Errors signalling that stored data is inconsistent. Never retried.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            StoreError::MissingChunk { .. }
                | StoreError::MissingPayload(_)
                | StoreError::IntegrityViolation { .. }
                | StoreError::ChunkSizeMismatch { .. }
                | StoreError::Encoding(_)
                | StoreError::InvalidData(_)
        )
    }
}

impl From<rocksdb::Error> for StoreError {
    fn from(e: rocksdb::Error) -> Self {
        use rocksdb::ErrorKind;

        match e.kind() {
            ErrorKind::Busy | ErrorKind::TimedOut | ErrorKind::TryAgain => {
                StoreError::Busy(e.to_string())
            }
            _ => StoreError::Database(e.to_string()),
        }
    }
}

/// Result alias used throughout the crate.
pub type Result<T, E = StoreError> = std::result::Result<T, E>;
