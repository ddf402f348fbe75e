//! Metadata database.
//!
//! One RocksDB `TransactionDB` holds every relation. Pessimistic
//! transactions provide the row locks that serialise same-digest inserts,
//! catalog commits and garbage collection.
//!
//! | column family | key | value |
//! |---|---|---|
//! | `files` | file id (16 bytes) | `FileRecord` |
//! | `file_paths` | path (UTF-8) | file id |
//! | `file_sections` | file id ‖ chunk index (u64 BE) | `SectionRecord` |
//! | `chunk_refs` | digest ‖ file id ‖ chunk index (u64 BE) | empty |
//! | `chunks` | digest (32 bytes) | `ChunkRecord` |

use std::path::Path;

use cairn_core::{Digest, FileId, DIGEST_LEN, FILE_ID_LEN};
use rocksdb::{
    ColumnFamily, Direction, IteratorMode, Options, SnapshotWithThreadMode, Transaction,
    TransactionDB, TransactionDBOptions, TransactionOptions, WriteOptions,
};
use tracing::debug;

use crate::config::StoreConfig;
use crate::StoreError;

/// Column family for file rows.
pub(crate) const FILES_CF: &str = "files";
/// Column family for the unique path index.
pub(crate) const PATHS_CF: &str = "file_paths";
/// Column family for ordered file sections.
pub(crate) const SECTIONS_CF: &str = "file_sections";
/// Column family for the digest-to-section reverse index.
pub(crate) const REFS_CF: &str = "chunk_refs";
/// Column family for chunk rows.
pub(crate) const CHUNKS_CF: &str = "chunks";

const COLUMN_FAMILIES: [&str; 5] = [FILES_CF, PATHS_CF, SECTIONS_CF, REFS_CF, CHUNKS_CF];

/// Raw key/value pair as returned by RocksDB iterators.
pub(crate) type KvPair = (Box<[u8]>, Box<[u8]>);

/// Transactional metadata database.
pub struct Database {
    db: TransactionDB,
    lock_timeout_ms: i64,
    sync_writes: bool,
}

impl Database {
    /// Opens or creates the database described by `config`.
    pub fn open(config: &StoreConfig) -> Result<Self, StoreError> {
        Self::open_path(&config.db_path(), config.lock_timeout_ms, config.sync_writes)
    }

    /// Opens or creates a database at `path`.
    pub fn open_path(path: &Path, lock_timeout_ms: u64, sync_writes: bool) -> Result<Self, StoreError> {
        let lock_timeout_ms = i64::try_from(lock_timeout_ms)
            .map_err(|_| StoreError::InvalidConfig("lock timeout too large".to_string()))?;

        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let mut txn_db_opts = TransactionDBOptions::default();
        txn_db_opts.set_txn_lock_timeout(lock_timeout_ms);
        txn_db_opts.set_default_lock_timeout(lock_timeout_ms);

        let db = TransactionDB::open_cf(&opts, &txn_db_opts, path, COLUMN_FAMILIES)?;
        debug!(path = %path.display(), "Opened metadata database");

        Ok(Self {
            db,
            lock_timeout_ms,
            sync_writes,
        })
    }

    /// Resolves a column family handle.
    pub(crate) fn cf(&self, name: &str) -> Result<&ColumnFamily, StoreError> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("Missing {} column family", name)))
    }

    /// Begins a pessimistic transaction with the configured lock timeout.
    pub(crate) fn transaction(&self) -> Transaction<'_, TransactionDB> {
        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(self.sync_writes);

        let mut txn_opts = TransactionOptions::default();
        txn_opts.set_lock_timeout(self.lock_timeout_ms);
        txn_opts.set_deadlock_detect(true);

        self.db.transaction_opt(&write_opts, &txn_opts)
    }

    /// Takes a consistent read snapshot.
    pub(crate) fn snapshot(&self) -> SnapshotWithThreadMode<'_, TransactionDB> {
        self.db.snapshot()
    }

    /// Direct access for lock-free reads.
    pub(crate) fn inner(&self) -> &TransactionDB {
        &self.db
    }
}

/// Iterator mode positioned at the first key `>= prefix`.
pub(crate) fn from_prefix(prefix: &[u8]) -> IteratorMode<'_> {
    IteratorMode::From(prefix, Direction::Forward)
}

/// Restricts a forward iterator to keys starting with `prefix`.
///
/// No prefix extractor is configured, so iteration has to stop by hand at
/// the first foreign key.
pub(crate) fn within_prefix<'a, I>(
    iter: I,
    prefix: &'a [u8],
) -> impl Iterator<Item = Result<KvPair, StoreError>> + 'a
where
    I: Iterator<Item = Result<KvPair, rocksdb::Error>> + 'a,
{
    iter.map(|item| item.map_err(StoreError::from))
        .take_while(move |item| match item {
            Ok((key, _)) => key.starts_with(prefix),
            Err(_) => true,
        })
}

/// `file_sections` key: file id followed by the big-endian chunk index.
pub(crate) fn section_key(file_id: &FileId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(FILE_ID_LEN + 8);
    key.extend_from_slice(file_id.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

/// Chunk index stored in a `file_sections` key.
pub(crate) fn section_index(key: &[u8]) -> Result<u64, StoreError> {
    let suffix: [u8; 8] = key
        .get(FILE_ID_LEN..)
        .and_then(|s| s.try_into().ok())
        .ok_or_else(|| StoreError::InvalidData(format!("Malformed section key ({} bytes)", key.len())))?;
    Ok(u64::from_be_bytes(suffix))
}

/// `chunk_refs` key: digest, owning file id, chunk index.
pub(crate) fn ref_key(digest: &Digest, file_id: &FileId, index: u64) -> Vec<u8> {
    let mut key = Vec::with_capacity(DIGEST_LEN + FILE_ID_LEN + 8);
    key.extend_from_slice(digest.as_slice());
    key.extend_from_slice(file_id.as_bytes());
    key.extend_from_slice(&index.to_be_bytes());
    key
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn open_test_db(dir: &TempDir) -> Database {
        Database::open_path(dir.path(), 200, false).unwrap()
    }

    #[test]
    fn test_section_keys_sort_by_index() {
        let id = FileId::random();
        let k2 = section_key(&id, 2);
        let k10 = section_key(&id, 10);
        let k256 = section_key(&id, 256);
        assert!(k2 < k10 && k10 < k256);
        assert_eq!(section_index(&k256).unwrap(), 256);
        assert!(section_index(&[0u8; 5]).is_err());
    }

    #[test]
    fn test_prefix_scan_stops_at_foreign_keys() {
        let dir = TempDir::new().unwrap();
        let db = open_test_db(&dir);
        let cf = db.cf(SECTIONS_CF).unwrap();

        let a = FileId::random();
        let b = FileId::random();
        for i in 0..3 {
            db.inner().put_cf(cf, section_key(&a, i), b"a").unwrap();
            db.inner().put_cf(cf, section_key(&b, i), b"b").unwrap();
        }

        let rows: Vec<KvPair> = within_prefix(
            db.inner().iterator_cf(cf, from_prefix(a.as_bytes())),
            a.as_bytes(),
        )
        .collect::<Result<_, _>>()
        .unwrap();

        assert_eq!(rows.len(), 3);
        assert!(rows.iter().all(|(_, v)| v.as_ref() == b"a"));
    }

    #[test]
    fn test_exclusive_lock_blocks_second_writer() {
        let dir = TempDir::new().unwrap();
        let db = open_test_db(&dir);
        let cf = db.cf(CHUNKS_CF).unwrap();
        let key = Digest::of(b"locked");

        let first = db.transaction();
        first.get_for_update_cf(cf, key.as_slice(), true).unwrap();

        let second = db.transaction();
        let err = second
            .get_for_update_cf(cf, key.as_slice(), true)
            .map_err(StoreError::from)
            .unwrap_err();
        assert!(err.is_transient(), "expected busy, got {err}");

        first.commit().unwrap();
        second.get_for_update_cf(cf, key.as_slice(), true).unwrap();
    }

    #[test]
    fn test_shared_locks_coexist() {
        let dir = TempDir::new().unwrap();
        let db = open_test_db(&dir);
        let cf = db.cf(CHUNKS_CF).unwrap();
        let key = Digest::of(b"shared");

        let a = db.transaction();
        let b = db.transaction();
        a.get_for_update_cf(cf, key.as_slice(), false).unwrap();
        b.get_for_update_cf(cf, key.as_slice(), false).unwrap();

        let writer = db.transaction();
        assert!(writer.get_for_update_cf(cf, key.as_slice(), true).is_err());
    }
}
