//! Storage configuration.

use std::path::PathBuf;

use cairn_cdc::ChunkingParams;

use crate::StoreError;

/// Storage configuration.
#[derive(Debug, Clone)]
pub struct StoreConfig {
    /// Base path for all storage
    pub base_path: PathBuf,
    /// Chunker parameters used for ingestion and diffing
    pub chunking: ChunkingParams,
    /// How long a transaction waits for a row lock before failing as busy
    pub lock_timeout_ms: u64,
    /// Sync writes to disk
    pub sync_writes: bool,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            base_path: PathBuf::from(".cairn"),
            chunking: ChunkingParams::default(),
            lock_timeout_ms: 5000,
            sync_writes: false,
        }
    }
}

impl StoreConfig {
    /// Creates a new configuration with the given base path.
    pub fn new(base_path: PathBuf) -> Self {
        Self {
            base_path,
            ..Default::default()
        }
    }

    /// Returns the path of the metadata database.
    pub fn db_path(&self) -> PathBuf {
        self.base_path.join("db")
    }

    /// Returns the path for chunk payloads.
    pub fn blobs_path(&self) -> PathBuf {
        self.base_path.join("blobs")
    }

    /// Creates all necessary directories.
    pub fn create_dirs(&self) -> std::io::Result<()> {
        std::fs::create_dir_all(&self.base_path)?;
        std::fs::create_dir_all(self.db_path())?;
        std::fs::create_dir_all(self.blobs_path())?;
        Ok(())
    }

    /// Checks values that would otherwise fail deep inside the engine.
    pub fn validate(&self) -> Result<(), StoreError> {
        if self.base_path.as_os_str().is_empty() {
            return Err(StoreError::InvalidConfig("base_path is empty".to_string()));
        }
        if self.lock_timeout_ms == 0 || self.lock_timeout_ms > i64::MAX as u64 {
            return Err(StoreError::InvalidConfig(format!(
                "lock_timeout_ms out of range: {}",
                self.lock_timeout_ms
            )));
        }

        let c = &self.chunking;
        ChunkingParams::new(c.min_size, c.avg_size, c.max_size)
            .map_err(|e| StoreError::InvalidConfig(e.to_string()))?;
        Ok(())
    }
}
