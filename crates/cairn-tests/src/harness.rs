//! Store harness for integration testing.

use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use cairn_cdc::ChunkingParams;
use cairn_core::Digest;
use cairn_store::{BlobMedium, Engine, FsBlobMedium, IngestReport, StoreConfig, StoreError};
use tempfile::TempDir;
use tracing::info;

/// Blob medium wrapper counting the calls that change stored payloads.
pub struct CountingMedium {
    inner: FsBlobMedium,
    writes: AtomicU64,
    deletes: AtomicU64,
}

impl CountingMedium {
    /// Wraps a filesystem medium rooted at `root`.
    pub fn open(root: impl Into<PathBuf>) -> io::Result<Self> {
        Ok(Self {
            inner: FsBlobMedium::open(root, false)?,
            writes: AtomicU64::new(0),
            deletes: AtomicU64::new(0),
        })
    }

    /// Number of `write` calls so far.
    pub fn writes(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Number of `delete` calls that removed something.
    pub fn deletes(&self) -> u64 {
        self.deletes.load(Ordering::SeqCst)
    }

    /// On-disk location of a payload, for tampering.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        self.inner.path_for(digest)
    }
}

impl BlobMedium for CountingMedium {
    fn write(&self, digest: &Digest, data: &[u8]) -> io::Result<()> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        self.inner.write(digest, data)
    }

    fn read(&self, digest: &Digest) -> io::Result<Option<Bytes>> {
        self.inner.read(digest)
    }

    fn delete(&self, digest: &Digest) -> io::Result<bool> {
        let removed = self.inner.delete(digest)?;
        if removed {
            self.deletes.fetch_add(1, Ordering::SeqCst);
        }
        Ok(removed)
    }

    fn contains(&self, digest: &Digest) -> io::Result<bool> {
        self.inner.contains(digest)
    }

    fn list(&self) -> io::Result<Vec<Digest>> {
        self.inner.list()
    }

    fn purge_stale(&self, older_than: Duration) -> io::Result<u64> {
        self.inner.purge_stale(older_than)
    }
}

/// An engine over a temporary directory, removed on drop.
pub struct TestStore {
    dir: TempDir,
    medium: Arc<CountingMedium>,
    engine: Engine,
}

impl TestStore {
    /// Creates a store with default chunking parameters.
    pub fn new() -> Result<Self, StoreError> {
        Self::with_chunking(ChunkingParams::default())
    }

    /// Creates a store with explicit chunk sizes.
    pub fn with_sizes(min: usize, target: usize, max: usize) -> Result<Self, StoreError> {
        let params = ChunkingParams::new(min, target, max)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        Self::with_chunking(params)
    }

    /// Creates a store with the given chunker parameters.
    pub fn with_chunking(chunking: ChunkingParams) -> Result<Self, StoreError> {
        let dir = TempDir::new()?;
        let config = StoreConfig {
            chunking,
            lock_timeout_ms: 2000,
            ..StoreConfig::new(dir.path().join("store"))
        };

        let medium = Arc::new(CountingMedium::open(config.blobs_path())?);
        let engine = Engine::with_medium(config, medium.clone())?;
        info!(path = %dir.path().display(), "Created test store");

        Ok(Self { dir, medium, engine })
    }

    /// The engine under test.
    pub fn engine(&self) -> &Engine {
        &self.engine
    }

    /// The counting medium behind the engine.
    pub fn medium(&self) -> &CountingMedium {
        &self.medium
    }

    /// Scratch directory for source files, outside the store.
    pub fn scratch(&self) -> PathBuf {
        self.dir.path().join("scratch")
    }

    /// Writes a source file into the scratch directory.
    pub fn write_file(&self, name: &str, data: &[u8]) -> io::Result<PathBuf> {
        let dir = self.scratch();
        std::fs::create_dir_all(&dir)?;
        let path = dir.join(name);
        std::fs::write(&path, data)?;
        Ok(path)
    }

    /// Writes `data` to a scratch file and ingests it.
    pub fn ingest_bytes(&self, name: &str, data: &[u8]) -> Result<IngestReport, StoreError> {
        let path = self.write_file(name, data)?;
        self.engine.ingest(&path)
    }

    /// Ingests an existing path.
    pub fn ingest(&self, path: &Path) -> Result<IngestReport, StoreError> {
        self.engine.ingest(path)
    }
}
