//! Blob medium for chunk payloads.
//!
//! Chunk rows live in the database; the bytes live here, addressed by the
//! same digest. Writing a digest twice is harmless and deleting an absent
//! digest is a no-op, which lets the chunk store and the collector repair
//! interrupted operations by simply repeating them.

use std::collections::HashMap;
use std::fs::{self, DirEntry};
use std::io::{self, ErrorKind, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime};

use bytes::Bytes;
use cairn_core::Digest;
use parking_lot::RwLock;
use tempfile::NamedTempFile;
use tracing::{debug, trace, warn};

/// Storage for chunk payloads keyed by digest.
pub trait BlobMedium: Send + Sync {
    /// Stores `data` under `digest`, replacing any previous payload.
    fn write(&self, digest: &Digest, data: &[u8]) -> io::Result<()>;

    /// Reads the payload, `None` when absent.
    fn read(&self, digest: &Digest) -> io::Result<Option<Bytes>>;

    /// Removes the payload. Returns whether anything was removed.
    fn delete(&self, digest: &Digest) -> io::Result<bool>;

    /// Checks whether a payload exists.
    fn contains(&self, digest: &Digest) -> io::Result<bool>;

    /// Lists every stored digest.
    fn list(&self) -> io::Result<Vec<Digest>>;

    /// Removes leftovers of interrupted writes last modified more than
    /// `older_than` ago. Returns how many were removed.
    fn purge_stale(&self, _older_than: Duration) -> io::Result<u64> {
        Ok(0)
    }
}

/// Filesystem medium with a two-level fan-out: `ab/cd/abcd...`.
pub struct FsBlobMedium {
    root: PathBuf,
    sync_writes: bool,
}

impl FsBlobMedium {
    /// Opens (creating if needed) a medium rooted at `root`.
    pub fn open(root: impl Into<PathBuf>, sync_writes: bool) -> io::Result<Self> {
        let root = root.into();
        fs::create_dir_all(&root)?;
        debug!(root = %root.display(), "Opened blob medium");
        Ok(Self { root, sync_writes })
    }

    /// Root directory.
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Location of the payload for `digest`.
    pub fn path_for(&self, digest: &Digest) -> PathBuf {
        let hex = digest.to_hex();
        self.root.join(&hex[0..2]).join(&hex[2..4]).join(hex)
    }

    /// Every entry of the second-level shard directories.
    fn shard_entries(&self) -> io::Result<Vec<DirEntry>> {
        let mut entries = Vec::new();
        for level1 in fs::read_dir(&self.root)? {
            let level1 = level1?;
            if !level1.file_type()?.is_dir() {
                continue;
            }
            for level2 in fs::read_dir(level1.path())? {
                let level2 = level2?;
                if !level2.file_type()?.is_dir() {
                    continue;
                }
                for entry in fs::read_dir(level2.path())? {
                    entries.push(entry?);
                }
            }
        }
        Ok(entries)
    }
}

fn entry_digest(entry: &DirEntry) -> Option<Digest> {
    entry.file_name().to_str().and_then(|n| Digest::from_hex(n).ok())
}

impl BlobMedium for FsBlobMedium {
    fn write(&self, digest: &Digest, data: &[u8]) -> io::Result<()> {
        let path = self.path_for(digest);
        let parent = path
            .parent()
            .ok_or_else(|| io::Error::new(ErrorKind::InvalidInput, "blob path has no parent"))?;
        fs::create_dir_all(parent)?;

        // Same directory as the target so the rename stays atomic
        let mut tmp = NamedTempFile::new_in(parent)?;
        tmp.write_all(data)?;
        if self.sync_writes {
            tmp.as_file().sync_all()?;
        }
        tmp.persist(&path).map_err(|e| e.error)?;

        trace!(digest = %digest, size = data.len(), "Wrote payload");
        Ok(())
    }

    fn read(&self, digest: &Digest) -> io::Result<Option<Bytes>> {
        match fs::read(self.path_for(digest)) {
            Ok(data) => Ok(Some(Bytes::from(data))),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(None),
            Err(e) => Err(e),
        }
    }

    fn delete(&self, digest: &Digest) -> io::Result<bool> {
        match fs::remove_file(self.path_for(digest)) {
            Ok(()) => Ok(true),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
            Err(e) => Err(e),
        }
    }

    fn contains(&self, digest: &Digest) -> io::Result<bool> {
        self.path_for(digest).try_exists()
    }

    fn list(&self) -> io::Result<Vec<Digest>> {
        // Leftover temp files do not parse as digests
        let mut digests: Vec<Digest> = self.shard_entries()?.iter().filter_map(entry_digest).collect();
        digests.sort_unstable();
        Ok(digests)
    }

    fn purge_stale(&self, older_than: Duration) -> io::Result<u64> {
        let now = SystemTime::now();
        let mut removed = 0u64;

        for entry in self.shard_entries()? {
            if entry_digest(&entry).is_some() || !entry.file_type()?.is_file() {
                continue;
            }
            let modified = entry.metadata()?.modified()?;
            // A write still in flight has a fresh mtime
            if now.duration_since(modified).unwrap_or_default() < older_than {
                continue;
            }
            match fs::remove_file(entry.path()) {
                Ok(()) => {
                    warn!(path = %entry.path().display(), "Removed stale temp file");
                    removed += 1;
                }
                Err(e) if e.kind() == ErrorKind::NotFound => {}
                Err(e) => return Err(e),
            }
        }
        Ok(removed)
    }
}

/// In-process medium, for tests and ephemeral stores.
#[derive(Default)]
pub struct MemoryBlobMedium {
    blobs: RwLock<HashMap<Digest, Bytes>>,
}

impl MemoryBlobMedium {
    /// Creates an empty medium.
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of stored payloads.
    pub fn len(&self) -> usize {
        self.blobs.read().len()
    }

    /// Returns true when nothing is stored.
    pub fn is_empty(&self) -> bool {
        self.blobs.read().is_empty()
    }
}

impl BlobMedium for MemoryBlobMedium {
    fn write(&self, digest: &Digest, data: &[u8]) -> io::Result<()> {
        self.blobs.write().insert(*digest, Bytes::copy_from_slice(data));
        Ok(())
    }

    fn read(&self, digest: &Digest) -> io::Result<Option<Bytes>> {
        Ok(self.blobs.read().get(digest).cloned())
    }

    fn delete(&self, digest: &Digest) -> io::Result<bool> {
        Ok(self.blobs.write().remove(digest).is_some())
    }

    fn contains(&self, digest: &Digest) -> io::Result<bool> {
        Ok(self.blobs.read().contains_key(digest))
    }

    fn list(&self) -> io::Result<Vec<Digest>> {
        let mut digests: Vec<Digest> = self.blobs.read().keys().copied().collect();
        digests.sort_unstable();
        Ok(digests)
    }
}
