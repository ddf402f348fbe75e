//! Chunk storage implementation.
//!
//! Each distinct digest has exactly one row in the `chunks` column family
//! and one payload in the blob medium. Inserts take an exclusive lock on
//! the digest row, so concurrent puts of the same content write the
//! payload once and every other caller observes `AlreadyPresent`. A put
//! waiting on that lock keeps waiting across lock timeouts, since the
//! holder releases it on commit or rollback.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use bytes::Bytes;
use cairn_core::encoding::{CanonicalDecode, CanonicalEncode};
use cairn_core::Digest;
use parking_lot::{Mutex, RwLock};
use rocksdb::{ColumnFamily, IteratorMode, Transaction, TransactionDB};
use tracing::{debug, warn};

use crate::blob::BlobMedium;
use crate::db::{Database, CHUNKS_CF};
use crate::records::ChunkRecord;
use crate::StoreError;

/// Result of inserting a chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PutOutcome {
    /// Row and payload were created by this call
    Inserted,
    /// The digest was already stored; nothing new was written
    AlreadyPresent,
}

/// Statistics for the chunk store.
#[derive(Debug, Default, Clone)]
pub struct ChunkStoreStats {
    /// Chunks inserted
    pub inserted: u64,
    /// Bytes inserted
    pub bytes_inserted: u64,
    /// Puts that found the digest already stored
    pub deduplicated: u64,
    /// Successful reads
    pub hits: u64,
    /// Reads of unknown digests
    pub misses: u64,
    /// Chunks deleted
    pub deleted: u64,
    /// Payloads rewritten because the row outlived them
    pub repaired: u64,
}

/// Chunk store backed by the metadata database and a blob medium.
pub struct ChunkStore {
    db: Arc<Database>,
    medium: Arc<dyn BlobMedium>,
    /// Digests held by live ingest leases, with holder counts
    pins: Mutex<HashMap<Digest, usize>>,
    stats: RwLock<ChunkStoreStats>,
}

impl ChunkStore {
    /// Creates a chunk store over an open database and medium.
    pub fn new(db: Arc<Database>, medium: Arc<dyn BlobMedium>) -> Self {
        Self {
            db,
            medium,
            pins: Mutex::new(HashMap::new()),
            stats: RwLock::new(ChunkStoreStats::default()),
        }
    }

    /// Inserts a chunk if its digest is not stored yet.
    ///
    /// `digest` must be the hash of `payload`. A digest already stored with
    /// a different size is a fatal `ChunkSizeMismatch`.
    pub fn put(&self, digest: &Digest, payload: &[u8]) -> Result<PutOutcome, StoreError> {
        debug_assert_eq!(Digest::of(payload), *digest, "digest does not match payload");

        let offered = payload.len() as u64;
        let cf = self.db.cf(CHUNKS_CF)?;
        let (txn, existing) = self.lock_row(cf, digest)?;

        match existing {
            None => {
                // Payload first: a crash before commit leaves an orphan
                // payload for GC, never a row without bytes
                self.medium.write(digest, payload)?;
                txn.put_cf(cf, digest.as_slice(), ChunkRecord { size: offered }.to_vec())?;
                txn.commit()?;

                {
                    let mut stats = self.stats.write();
                    stats.inserted += 1;
                    stats.bytes_inserted += offered;
                }

                debug!(hash = %digest, size = offered, "Stored chunk");
                Ok(PutOutcome::Inserted)
            }
            Some(bytes) => {
                let record = ChunkRecord::from_bytes(&bytes)?;
                if record.size != offered {
                    return Err(StoreError::ChunkSizeMismatch {
                        digest: *digest,
                        stored: record.size,
                        offered,
                    });
                }

                if !self.medium.contains(digest)? {
                    warn!(hash = %digest, "Chunk row without payload, rewriting payload");
                    self.medium.write(digest, payload)?;
                    self.stats.write().repaired += 1;
                }
                txn.commit()?;

                self.stats.write().deduplicated += 1;
                Ok(PutOutcome::AlreadyPresent)
            }
        }
    }

    /// Retrieves a chunk payload.
    pub fn get(&self, digest: &Digest) -> Result<Bytes, StoreError> {
        if self.record(digest)?.is_none() {
            self.stats.write().misses += 1;
            return Err(StoreError::ChunkNotFound(*digest));
        }

        let payload = self
            .medium
            .read(digest)?
            .ok_or(StoreError::MissingPayload(*digest))?;

        self.stats.write().hits += 1;
        Ok(payload)
    }

    /// Removes a chunk row and its payload without checking referrers.
    ///
    /// Returns `false` when the digest was not stored.
    pub fn delete(&self, digest: &Digest) -> Result<bool, StoreError> {
        let cf = self.db.cf(CHUNKS_CF)?;
        let txn = self.db.transaction();

        if txn.get_for_update_cf(cf, digest.as_slice(), true)?.is_none() {
            return Ok(false);
        }

        self.medium.delete(digest)?;
        txn.delete_cf(cf, digest.as_slice())?;
        txn.commit()?;

        self.stats.write().deleted += 1;
        debug!(hash = %digest, "Deleted chunk");
        Ok(true)
    }

    /// Checks if a chunk row exists.
    pub fn contains(&self, digest: &Digest) -> Result<bool, StoreError> {
        Ok(self.record(digest)?.is_some())
    }

    /// Returns the chunk row, if stored.
    pub fn record(&self, digest: &Digest) -> Result<Option<ChunkRecord>, StoreError> {
        let cf = self.db.cf(CHUNKS_CF)?;
        match self.db.inner().get_cf(cf, digest.as_slice())? {
            Some(bytes) => Ok(Some(ChunkRecord::from_bytes(&bytes)?)),
            None => Ok(None),
        }
    }

    /// Lists all stored digests in key order.
    pub fn list(&self) -> Result<Vec<Digest>, StoreError> {
        let cf = self.db.cf(CHUNKS_CF)?;
        let mut digests = Vec::new();
        for item in self.db.inner().iterator_cf(cf, IteratorMode::Start) {
            let (key, _) = item?;
            digests.push(Digest::from_slice(&key)?);
        }
        Ok(digests)
    }

    /// Number of stored chunks.
    pub fn count(&self) -> Result<u64, StoreError> {
        let cf = self.db.cf(CHUNKS_CF)?;
        let mut count = 0u64;
        for item in self.db.inner().iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// Sum of all stored chunk sizes.
    pub fn total_size(&self) -> Result<u64, StoreError> {
        let cf = self.db.cf(CHUNKS_CF)?;
        let mut total = 0u64;
        for item in self.db.inner().iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            total += ChunkRecord::from_bytes(&value)?.size;
        }
        Ok(total)
    }

    /// Returns store statistics.
    pub fn stats(&self) -> ChunkStoreStats {
        self.stats.read().clone()
    }

    /// Starts an ingest lease. Digests put through it stay pinned until
    /// the lease is dropped.
    pub fn lease(&self) -> ChunkLease<'_> {
        ChunkLease {
            store: self,
            pinned: HashSet::new(),
        }
    }

    /// True while any live lease holds `digest`.
    pub fn is_pinned(&self, digest: &Digest) -> bool {
        self.pins.lock().contains_key(digest)
    }

    /// Takes the exclusive lock on a digest row and reads it, retrying
    /// lock timeouts.
    fn lock_row(
        &self,
        cf: &ColumnFamily,
        digest: &Digest,
    ) -> Result<(Transaction<'_, TransactionDB>, Option<Vec<u8>>), StoreError> {
        let mut waits = 0u32;
        loop {
            let txn = self.db.transaction();
            let row = txn.get_for_update_cf(cf, digest.as_slice(), true);
            match row.map_err(StoreError::from) {
                Ok(row) => return Ok((txn, row)),
                Err(StoreError::Busy(reason)) => {
                    waits += 1;
                    debug!(hash = %digest, waits, reason = %reason, "Chunk row locked, waiting again");
                }
                Err(e) => return Err(e),
            }
        }
    }

    pub(crate) fn database(&self) -> &Database {
        &self.db
    }

    pub(crate) fn medium(&self) -> &dyn BlobMedium {
        self.medium.as_ref()
    }

    pub(crate) fn note_deleted(&self) {
        self.stats.write().deleted += 1;
    }

    fn pin(&self, digest: &Digest) {
        *self.pins.lock().entry(*digest).or_insert(0) += 1;
    }

    fn unpin(&self, digest: &Digest) {
        let mut pins = self.pins.lock();
        if let Some(count) = pins.get_mut(digest) {
            *count -= 1;
            if *count == 0 {
                pins.remove(digest);
            }
        }
    }
}

/// Ingest-scoped guard protecting freshly written chunks from GC.
///
/// A chunk is pinned before it is put, so a collection that starts after
/// the put but before the catalog commit skips it.
pub struct ChunkLease<'a> {
    store: &'a ChunkStore,
    pinned: HashSet<Digest>,
}

impl ChunkLease<'_> {
    /// Pins `digest` and inserts the chunk.
    pub fn put(&mut self, digest: &Digest, payload: &[u8]) -> Result<PutOutcome, StoreError> {
        self.pin(digest);
        self.store.put(digest, payload)
    }

    /// Pins `digest` without inserting anything.
    pub fn pin(&mut self, digest: &Digest) {
        if self.pinned.insert(*digest) {
            self.store.pin(digest);
        }
    }

    /// Number of distinct digests held.
    pub fn len(&self) -> usize {
        self.pinned.len()
    }

    /// Returns true when nothing is pinned.
    pub fn is_empty(&self) -> bool {
        self.pinned.is_empty()
    }
}

impl Drop for ChunkLease<'_> {
    fn drop(&mut self) {
        for digest in &self.pinned {
            self.store.unpin(digest);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::blob::MemoryBlobMedium;
    use std::sync::atomic::{AtomicU64, Ordering};
    use std::sync::Barrier;
    use std::time::Duration;
    use tempfile::TempDir;

    fn create_store(dir: &TempDir) -> (ChunkStore, Arc<MemoryBlobMedium>) {
        let db = Arc::new(Database::open_path(dir.path(), 1000, false).unwrap());
        let medium = Arc::new(MemoryBlobMedium::new());
        (ChunkStore::new(db, medium.clone()), medium)
    }

    #[test]
    fn test_chunk_store_roundtrip() {
        let dir = TempDir::new().unwrap();
        let (store, _) = create_store(&dir);

        let payload = vec![0xAA; 100];
        let digest = Digest::of(&payload);
        assert_eq!(store.put(&digest, &payload).unwrap(), PutOutcome::Inserted);

        assert_eq!(store.get(&digest).unwrap().as_ref(), payload.as_slice());
        assert_eq!(store.record(&digest).unwrap(), Some(ChunkRecord { size: 100 }));
    }

    #[test]
    fn test_second_put_is_deduplicated() {
        let dir = TempDir::new().unwrap();
        let (store, medium) = create_store(&dir);

        let digest = Digest::of(b"same");
        assert_eq!(store.put(&digest, b"same").unwrap(), PutOutcome::Inserted);
        assert_eq!(store.put(&digest, b"same").unwrap(), PutOutcome::AlreadyPresent);

        assert_eq!(store.count().unwrap(), 1);
        assert_eq!(medium.len(), 1);
        let stats = store.stats();
        assert_eq!(stats.inserted, 1);
        assert_eq!(stats.deduplicated, 1);
    }

    #[test]
    fn test_size_mismatch_is_fatal() {
        let dir = TempDir::new().unwrap();
        let (store, _) = create_store(&dir);
        let cf = store.db.cf(CHUNKS_CF).unwrap();

        // Corrupt row claiming a different size
        let digest = Digest::of(b"payload");
        store
            .db
            .inner()
            .put_cf(cf, digest.as_slice(), ChunkRecord { size: 3 }.to_vec())
            .unwrap();

        let err = store.put(&digest, b"payload").unwrap_err();
        assert!(err.is_fatal());
        assert!(matches!(
            err,
            StoreError::ChunkSizeMismatch {
                stored: 3,
                offered: 7,
                ..
            }
        ));
    }

    #[test]
    fn test_missing_payload_is_repaired_on_put() {
        let dir = TempDir::new().unwrap();
        let (store, medium) = create_store(&dir);

        let digest = Digest::of(b"fragile");
        store.put(&digest, b"fragile").unwrap();
        medium.delete(&digest).unwrap();

        assert!(matches!(store.get(&digest), Err(StoreError::MissingPayload(_))));
        assert_eq!(store.put(&digest, b"fragile").unwrap(), PutOutcome::AlreadyPresent);
        assert_eq!(store.get(&digest).unwrap().as_ref(), b"fragile");
        assert_eq!(store.stats().repaired, 1);
    }

    #[test]
    fn test_get_unknown_chunk() {
        let dir = TempDir::new().unwrap();
        let (store, _) = create_store(&dir);
        let digest = Digest::of(b"nothing");
        assert!(matches!(store.get(&digest), Err(StoreError::ChunkNotFound(d)) if d == digest));
        assert_eq!(store.stats().misses, 1);
    }

    #[test]
    fn test_delete_is_idempotent() {
        let dir = TempDir::new().unwrap();
        let (store, medium) = create_store(&dir);

        let digest = Digest::of(b"temp");
        store.put(&digest, b"temp").unwrap();
        assert!(store.delete(&digest).unwrap());
        assert!(!store.delete(&digest).unwrap());
        assert!(!store.contains(&digest).unwrap());
        assert!(medium.is_empty());
    }

    #[test]
    fn test_list_count_and_size() {
        let dir = TempDir::new().unwrap();
        let (store, _) = create_store(&dir);

        let payloads: [&[u8]; 3] = [b"one", b"three", b"fifteen"];
        for p in payloads {
            store.put(&Digest::of(p), p).unwrap();
        }

        let mut expected: Vec<Digest> = payloads.iter().map(|p| Digest::of(p)).collect();
        expected.sort_unstable();
        assert_eq!(store.list().unwrap(), expected);
        assert_eq!(store.count().unwrap(), 3);
        assert_eq!(store.total_size().unwrap(), 3 + 5 + 7);
    }

    #[test]
    fn test_lease_pins_until_dropped() {
        let dir = TempDir::new().unwrap();
        let (store, _) = create_store(&dir);
        let digest = Digest::of(b"pinned");

        {
            let mut outer = store.lease();
            outer.put(&digest, b"pinned").unwrap();
            {
                let mut inner = store.lease();
                inner.pin(&digest);
                inner.pin(&digest);
                assert_eq!(inner.len(), 1);
            }
            assert!(store.is_pinned(&digest));
        }
        assert!(!store.is_pinned(&digest));
    }

    #[test]
    fn test_concurrent_puts_write_once() {
        let dir = TempDir::new().unwrap();
        let (store, medium) = create_store(&dir);
        let payload = vec![0x5A; 4096];
        let digest = Digest::of(&payload);

        let outcomes: Vec<PutOutcome> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..8)
                .map(|_| s.spawn(|| store.put(&digest, &payload).unwrap()))
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let inserted = outcomes.iter().filter(|o| **o == PutOutcome::Inserted).count();
        assert_eq!(inserted, 1);
        assert_eq!(medium.len(), 1);
        assert_eq!(store.count().unwrap(), 1);
    }

    /// Medium whose writes outlast the lock timeout.
    struct SlowMedium {
        inner: MemoryBlobMedium,
        delay: Duration,
        writes: AtomicU64,
    }

    impl BlobMedium for SlowMedium {
        fn write(&self, digest: &Digest, data: &[u8]) -> std::io::Result<()> {
            self.writes.fetch_add(1, Ordering::SeqCst);
            std::thread::sleep(self.delay);
            self.inner.write(digest, data)
        }

        fn read(&self, digest: &Digest) -> std::io::Result<Option<Bytes>> {
            self.inner.read(digest)
        }

        fn delete(&self, digest: &Digest) -> std::io::Result<bool> {
            self.inner.delete(digest)
        }

        fn contains(&self, digest: &Digest) -> std::io::Result<bool> {
            self.inner.contains(digest)
        }

        fn list(&self) -> std::io::Result<Vec<Digest>> {
            self.inner.list()
        }
    }

    #[test]
    fn test_losing_put_outlasts_lock_timeout() {
        let dir = TempDir::new().unwrap();
        let db = Arc::new(Database::open_path(dir.path(), 100, false).unwrap());
        let medium = Arc::new(SlowMedium {
            inner: MemoryBlobMedium::new(),
            delay: Duration::from_millis(400),
            writes: AtomicU64::new(0),
        });
        let store = ChunkStore::new(db, medium.clone());
        let payload = vec![0x3C; 2048];
        let digest = Digest::of(&payload);
        let barrier = Barrier::new(4);

        let outcomes: Vec<Result<PutOutcome, StoreError>> = std::thread::scope(|s| {
            let handles: Vec<_> = (0..4)
                .map(|_| {
                    s.spawn(|| {
                        barrier.wait();
                        store.put(&digest, &payload)
                    })
                })
                .collect();
            handles.into_iter().map(|h| h.join().unwrap()).collect()
        });

        let outcomes: Vec<PutOutcome> = outcomes.into_iter().map(|o| o.unwrap()).collect();
        let inserted = outcomes.iter().filter(|o| **o == PutOutcome::Inserted).count();
        assert_eq!(inserted, 1);
        assert_eq!(outcomes.len() - inserted, 3);
        assert_eq!(medium.writes.load(Ordering::SeqCst), 1);
        assert_eq!(store.get(&digest).unwrap().as_ref(), payload.as_slice());
    }
}
