//! Engine facade.
//!
//! Ingestion streams a source through the chunker and hasher, inserts each
//! chunk under an ingest lease, then records the file in the catalog in a
//! single transaction. If anything fails before that commit the catalog is
//! unchanged, and chunks already written are left for GC once the lease
//! is released.

use std::collections::HashSet;
use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use cairn_cdc::StreamChunker;
use cairn_core::{ContentHasher, Digest, FileId};
use rayon::prelude::*;
use tracing::{debug, info};

use crate::blob::{BlobMedium, FsBlobMedium};
use crate::catalog::{Catalog, IngestRecord, Section};
use crate::chunk::{ChunkStore, ChunkStoreStats, PutOutcome};
use crate::config::StoreConfig;
use crate::db::Database;
use crate::gc::{GarbageCollector, GcPhase, GcReport};
use crate::records::FileRecord;
use crate::restore::Reconstructor;
use crate::StoreError;

/// Outcome of ingesting one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IngestReport {
    /// File identifier (reused when the path was already known)
    pub file_id: FileId,
    /// Content size in bytes
    pub size: u64,
    /// Number of sections
    pub chunks: u64,
    /// Chunks that were not stored before
    pub new_chunks: u64,
    /// Bytes of those new chunks
    pub new_bytes: u64,
    /// Digest of the whole content
    pub whole_file_hash: Digest,
}

/// Difference between a stored file and candidate new content.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
    /// Compared file
    pub file_id: FileId,
    /// Chunks in the new content
    pub total_chunks: u64,
    /// Indices of new-content chunks that differ from the stored section
    /// at the same index
    pub changed_indices: Vec<u64>,
    /// Stored sections beyond the end of the new content
    pub removed_chunks: u64,
    /// Distinct chunks the store does not hold yet
    pub new_chunks: u64,
    /// Bytes of those chunks
    pub new_bytes: u64,
    /// Size of the new content
    pub size: u64,
    /// Digest of the new content
    pub whole_file_hash: Digest,
}

impl ChangeSet {
    /// True when the new content is byte-identical to the stored file.
    pub fn is_unchanged(&self) -> bool {
        self.changed_indices.is_empty() && self.removed_chunks == 0
    }
}

/// Store-wide figures.
#[derive(Debug, Clone)]
pub struct EngineStats {
    /// Live files
    pub files: u64,
    /// Stored chunks
    pub chunks: u64,
    /// Bytes held in chunks
    pub stored_bytes: u64,
    /// Sum of live file sizes
    pub logical_bytes: u64,
    /// Chunk store counters since open
    pub chunk_store: ChunkStoreStats,
}

impl EngineStats {
    /// Logical bytes per stored byte; 1.0 for an empty store.
    pub fn dedup_ratio(&self) -> f64 {
        if self.stored_bytes == 0 {
            1.0
        } else {
            self.logical_bytes as f64 / self.stored_bytes as f64
        }
    }
}

/// Content-addressed, deduplicating file store.
pub struct Engine {
    config: StoreConfig,
    chunks: Arc<ChunkStore>,
    catalog: Arc<Catalog>,
    restorer: Reconstructor,
    gc: GarbageCollector,
}

impl Engine {
    /// Opens a store with payloads on the filesystem under `base_path`.
    pub fn open(config: StoreConfig) -> Result<Self, StoreError> {
        config.validate()?;
        config.create_dirs()?;
        let medium = FsBlobMedium::open(config.blobs_path(), config.sync_writes)?;
        Self::with_medium(config, Arc::new(medium))
    }

    /// Opens a store with a caller-supplied blob medium.
    pub fn with_medium(config: StoreConfig, medium: Arc<dyn BlobMedium>) -> Result<Self, StoreError> {
        config.validate()?;
        std::fs::create_dir_all(config.db_path())?;

        let db = Arc::new(Database::open(&config)?);
        let chunks = Arc::new(ChunkStore::new(db.clone(), medium));
        let catalog = Arc::new(Catalog::new(db));

        info!(path = %config.base_path.display(), "Opened store");
        Ok(Self {
            restorer: Reconstructor::new(catalog.clone(), chunks.clone()),
            gc: GarbageCollector::new(chunks.clone()),
            config,
            chunks,
            catalog,
        })
    }

    /// Active configuration.
    pub fn config(&self) -> &StoreConfig {
        &self.config
    }

    /// Underlying chunk store.
    pub fn chunk_store(&self) -> &ChunkStore {
        &self.chunks
    }

    /// Underlying catalog.
    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    /// Ingests a file from disk, keyed by its canonical path.
    pub fn ingest(&self, path: &Path) -> Result<IngestReport, StoreError> {
        let canonical = std::fs::canonicalize(path)?;
        let logical = canonical
            .to_str()
            .ok_or_else(|| StoreError::InvalidPath(canonical.display().to_string()))?;
        let name = file_name(logical);

        let file = File::open(&canonical)?;
        self.ingest_reader(name, logical, file)
    }

    /// Ingests any reader under a logical path.
    ///
    /// A known path keeps its file id and has its content replaced.
    pub fn ingest_reader<R: Read>(
        &self,
        name: &str,
        path: &str,
        reader: R,
    ) -> Result<IngestReport, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidPath("empty path".to_string()));
        }

        let file_id = match self.catalog.file_by_path(path)? {
            Some(existing) => existing.id,
            None => FileId::random(),
        };

        let mut lease = self.chunks.lease();
        let mut hasher = ContentHasher::new();
        let mut chunks = Vec::new();
        let mut new_chunks = 0u64;
        let mut new_bytes = 0u64;

        for chunk in StreamChunker::new(reader, self.config.chunking) {
            let chunk = chunk?;
            let size = chunk.len() as u64;
            let digest = Digest::of(&chunk.data);
            hasher.update(&chunk.data);

            if lease.put(&digest, &chunk.data)? == PutOutcome::Inserted {
                new_chunks += 1;
                new_bytes += size;
            }
            chunks.push((digest, size));
        }

        let record = IngestRecord {
            file_id,
            name: name.to_string(),
            path: path.to_string(),
            whole_file_hash: hasher.finalize(),
            chunks,
        };
        let file = self.catalog.ingest(&record)?;
        drop(lease);

        info!(
            file_id = %file_id,
            path = %path,
            size = file.size,
            chunks = file.chunk_count,
            new_chunks,
            new_bytes,
            "Ingested file"
        );
        Ok(IngestReport {
            file_id,
            size: file.size,
            chunks: file.chunk_count,
            new_chunks,
            new_bytes,
            whole_file_hash: file.hash,
        })
    }

    /// Ingests several files in parallel, one task per file.
    pub fn ingest_batch(&self, paths: &[PathBuf]) -> Vec<Result<IngestReport, StoreError>> {
        debug!(files = paths.len(), "Batch ingest");
        paths.par_iter().map(|path| self.ingest(path)).collect()
    }

    /// Returns a file's verified content.
    pub fn restore(&self, file_id: &FileId) -> Result<Vec<u8>, StoreError> {
        self.restorer.restore(file_id)
    }

    /// Streams a file's content into `writer`. Discard the output on error.
    pub fn restore_to<W: Write>(&self, file_id: &FileId, writer: &mut W) -> Result<u64, StoreError> {
        self.restorer.restore_to(file_id, writer)
    }

    /// Verifies a file end to end without producing output.
    pub fn verify(&self, file_id: &FileId) -> Result<(), StoreError> {
        self.restorer.verify(file_id)
    }

    /// Removes a file from the catalog. Its chunks wait for GC.
    pub fn remove(&self, file_id: &FileId) -> Result<FileRecord, StoreError> {
        self.catalog.delete(file_id)
    }

    /// Runs garbage collection.
    pub fn run_gc(&self) -> Result<GcReport, StoreError> {
        self.gc.run()
    }

    /// Current garbage collector phase.
    pub fn gc_phase(&self) -> GcPhase {
        self.gc.phase()
    }

    /// Compares new content against a stored file without storing anything.
    pub fn diff<R: Read>(&self, file_id: &FileId, reader: R) -> Result<ChangeSet, StoreError> {
        let stored = self.catalog.sections_for(file_id)?;

        let mut hasher = ContentHasher::new();
        let mut changed_indices = Vec::new();
        let mut unseen = HashSet::new();
        let mut total_chunks = 0u64;
        let mut new_bytes = 0u64;

        for (index, chunk) in StreamChunker::new(reader, self.config.chunking).enumerate() {
            let chunk = chunk?;
            let digest = Digest::of(&chunk.data);
            hasher.update(&chunk.data);
            total_chunks += 1;

            if stored.get(index).map(|s| s.digest) != Some(digest) {
                changed_indices.push(index as u64);
            }
            if !self.chunks.contains(&digest)? && unseen.insert(digest) {
                new_bytes += chunk.len() as u64;
            }
        }

        Ok(ChangeSet {
            file_id: *file_id,
            total_chunks,
            changed_indices,
            removed_chunks: (stored.len() as u64).saturating_sub(total_chunks),
            new_chunks: unseen.len() as u64,
            new_bytes,
            size: hasher.bytes_hashed(),
            whole_file_hash: hasher.finalize(),
        })
    }

    /// Moves a file to a new logical path; the name follows the last component.
    pub fn rename(&self, file_id: &FileId, path: &str) -> Result<FileRecord, StoreError> {
        if path.is_empty() {
            return Err(StoreError::InvalidPath("empty path".to_string()));
        }
        self.catalog.rename(file_id, file_name(path), path)
    }

    /// All live files, ordered by path.
    pub fn list_files(&self) -> Result<Vec<FileRecord>, StoreError> {
        self.catalog.list()
    }

    /// Looks up one file.
    pub fn file(&self, file_id: &FileId) -> Result<FileRecord, StoreError> {
        self.catalog.file(file_id)
    }

    /// Sections of a file, ordered by chunk index.
    pub fn sections_for(&self, file_id: &FileId) -> Result<Vec<Section>, StoreError> {
        self.catalog.sections_for(file_id)
    }

    /// Store-wide statistics.
    pub fn stats(&self) -> Result<EngineStats, StoreError> {
        let files = self.catalog.list()?;
        Ok(EngineStats {
            files: files.len() as u64,
            chunks: self.chunks.count()?,
            stored_bytes: self.chunks.total_size()?,
            logical_bytes: files.iter().map(|f| f.size).sum(),
            chunk_store: self.chunks.stats(),
        })
    }
}

fn file_name(path: &str) -> &str {
    Path::new(path)
        .file_name()
        .and_then(|n| n.to_str())
        .unwrap_or(path)
}
