//! File catalog.
//!
//! Maps files to the ordered list of chunks that make them up. A file's row,
//! its path index entry, its sections and their reverse references are
//! always written and removed together in one transaction, so readers see
//! either the old or the new complete section set.
//!
//! Catalog commits take shared locks on every chunk row they reference.
//! The collector needs an exclusive lock to delete a row, so a sweep and a
//! commit touching the same chunk are serialised.

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;

use cairn_core::encoding::{CanonicalDecode, CanonicalEncode};
use cairn_core::{Digest, FileId};
use rocksdb::{DBIteratorWithThreadMode, IteratorMode, TransactionDB};
use tracing::{debug, info};

use crate::db::{
    from_prefix, ref_key, section_index, section_key, within_prefix, Database, KvPair, CHUNKS_CF,
    FILES_CF, PATHS_CF, REFS_CF, SECTIONS_CF,
};
use crate::records::{ChunkRecord, FileRecord, SectionRecord};
use crate::StoreError;

/// Everything needed to record one ingested file.
#[derive(Debug, Clone)]
pub struct IngestRecord {
    /// Identifier to write under; reuse the existing id to replace a file
    pub file_id: FileId,
    /// Display name
    pub name: String,
    /// Logical path, unique across live files
    pub path: String,
    /// Digest of the complete content
    pub whole_file_hash: Digest,
    /// Chunk digests and sizes in file order
    pub chunks: Vec<(Digest, u64)>,
}

impl IngestRecord {
    /// Total content size.
    pub fn size(&self) -> u64 {
        self.chunks.iter().map(|(_, size)| size).sum()
    }
}

/// One chunk at one position of a file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Section {
    /// Chunk digest
    pub digest: Digest,
    /// Position in the file, contiguous from 0
    pub chunk_index: u64,
    /// Byte offset within the file
    pub offset: u64,
    /// Chunk size
    pub size: u64,
}

/// File catalog over the metadata database.
pub struct Catalog {
    db: Arc<Database>,
}

impl Catalog {
    /// Creates a catalog over an open database.
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }

    /// Records a file and its sections, replacing any previous version.
    ///
    /// Fails with `PathConflict` when another file owns the path,
    /// `MissingChunk` when a chunk row is absent and `ChunkSizeMismatch`
    /// when a declared size disagrees with the chunk row. On error nothing
    /// is written.
    pub fn ingest(&self, record: &IngestRecord) -> Result<FileRecord, StoreError> {
        let files_cf = self.db.cf(FILES_CF)?;
        let paths_cf = self.db.cf(PATHS_CF)?;
        let sections_cf = self.db.cf(SECTIONS_CF)?;
        let refs_cf = self.db.cf(REFS_CF)?;
        let chunks_cf = self.db.cf(CHUNKS_CF)?;

        let id = record.file_id;
        let txn = self.db.transaction();

        let previous = txn
            .get_for_update_cf(files_cf, id.as_bytes(), true)?
            .map(|bytes| FileRecord::from_bytes(&bytes))
            .transpose()?;

        if let Some(bytes) = txn.get_for_update_cf(paths_cf, record.path.as_bytes(), true)? {
            let owner = FileId::from_slice(&bytes)?;
            if owner != id {
                return Err(StoreError::PathConflict {
                    path: record.path.clone(),
                    owner,
                });
            }
        }

        // Shared locks in digest order so concurrent commits cannot deadlock
        let wanted: BTreeMap<Digest, u64> = record.chunks.iter().copied().collect();
        let mut stored = HashMap::with_capacity(wanted.len());
        for digest in wanted.keys() {
            let bytes = txn
                .get_for_update_cf(chunks_cf, digest.as_slice(), false)?
                .ok_or(StoreError::MissingChunk {
                    file_id: id,
                    digest: *digest,
                })?;
            stored.insert(*digest, ChunkRecord::from_bytes(&bytes)?.size);
        }
        for (digest, size) in &record.chunks {
            let stored_size = stored[digest];
            if stored_size != *size {
                return Err(StoreError::ChunkSizeMismatch {
                    digest: *digest,
                    stored: stored_size,
                    offered: *size,
                });
            }
        }

        let old_sections: Vec<KvPair> = within_prefix(
            txn.iterator_cf(sections_cf, from_prefix(id.as_bytes())),
            id.as_bytes(),
        )
        .collect::<Result<_, _>>()?;
        for (key, value) in &old_sections {
            let section = SectionRecord::from_bytes(value)?;
            txn.delete_cf(refs_cf, ref_key(&section.chunk_hash, &id, section_index(key)?))?;
            txn.delete_cf(sections_cf, key)?;
        }

        let mut offset = 0u64;
        for (index, (digest, size)) in record.chunks.iter().enumerate() {
            let index = index as u64;
            let section = SectionRecord {
                chunk_hash: *digest,
                offset,
                size: *size,
            };
            txn.put_cf(sections_cf, section_key(&id, index), section.to_vec())?;
            txn.put_cf(refs_cf, ref_key(digest, &id, index), b"")?;
            offset += size;
        }

        if let Some(prev) = &previous {
            if prev.path != record.path {
                txn.delete_cf(paths_cf, prev.path.as_bytes())?;
            }
        }
        txn.put_cf(paths_cf, record.path.as_bytes(), id.as_bytes())?;

        let file = FileRecord {
            id,
            name: record.name.clone(),
            path: record.path.clone(),
            hash: record.whole_file_hash,
            size: offset,
            chunk_count: record.chunks.len() as u64,
        };
        txn.put_cf(files_cf, id.as_bytes(), file.to_vec())?;
        txn.commit()?;

        info!(
            file_id = %id,
            path = %file.path,
            size = file.size,
            chunks = file.chunk_count,
            replaced = previous.is_some(),
            "Recorded file"
        );
        Ok(file)
    }

    /// Sections of a file, ordered by chunk index.
    pub fn sections_for(&self, file_id: &FileId) -> Result<Vec<Section>, StoreError> {
        Ok(self.snapshot(file_id)?.1)
    }

    /// File row and sections read from one consistent snapshot.
    pub fn snapshot(&self, file_id: &FileId) -> Result<(FileRecord, Vec<Section>), StoreError> {
        let snapshot = self.db.snapshot();
        let files_cf = self.db.cf(FILES_CF)?;
        let sections_cf = self.db.cf(SECTIONS_CF)?;

        let bytes = snapshot
            .get_cf(files_cf, file_id.as_bytes())?
            .ok_or(StoreError::FileNotFound(*file_id))?;
        let file = FileRecord::from_bytes(&bytes)?;

        let sections = read_sections(
            snapshot.iterator_cf(sections_cf, from_prefix(file_id.as_bytes())),
            file_id,
        )?;
        Ok((file, sections))
    }

    /// Sections of several files, from one snapshot.
    pub fn sections_for_many(
        &self,
        file_ids: &[FileId],
    ) -> Result<HashMap<FileId, Vec<Section>>, StoreError> {
        let snapshot = self.db.snapshot();
        let files_cf = self.db.cf(FILES_CF)?;
        let sections_cf = self.db.cf(SECTIONS_CF)?;

        let mut grouped = HashMap::with_capacity(file_ids.len());
        for id in file_ids {
            if snapshot.get_cf(files_cf, id.as_bytes())?.is_none() {
                return Err(StoreError::FileNotFound(*id));
            }
            let sections = read_sections(
                snapshot.iterator_cf(sections_cf, from_prefix(id.as_bytes())),
                id,
            )?;
            grouped.insert(*id, sections);
        }
        Ok(grouped)
    }

    /// Removes a file with its path entry, sections and reverse references.
    ///
    /// Chunks are left alone; unreferenced ones are reclaimed by GC.
    pub fn delete(&self, file_id: &FileId) -> Result<FileRecord, StoreError> {
        let files_cf = self.db.cf(FILES_CF)?;
        let paths_cf = self.db.cf(PATHS_CF)?;
        let sections_cf = self.db.cf(SECTIONS_CF)?;
        let refs_cf = self.db.cf(REFS_CF)?;

        let txn = self.db.transaction();
        let bytes = txn
            .get_for_update_cf(files_cf, file_id.as_bytes(), true)?
            .ok_or(StoreError::FileNotFound(*file_id))?;
        let file = FileRecord::from_bytes(&bytes)?;

        let sections: Vec<KvPair> = within_prefix(
            txn.iterator_cf(sections_cf, from_prefix(file_id.as_bytes())),
            file_id.as_bytes(),
        )
        .collect::<Result<_, _>>()?;
        for (key, value) in &sections {
            let section = SectionRecord::from_bytes(value)?;
            txn.delete_cf(refs_cf, ref_key(&section.chunk_hash, file_id, section_index(key)?))?;
            txn.delete_cf(sections_cf, key)?;
        }

        if let Some(owner) = txn.get_for_update_cf(paths_cf, file.path.as_bytes(), true)? {
            if FileId::from_slice(&owner)? == *file_id {
                txn.delete_cf(paths_cf, file.path.as_bytes())?;
            }
        }
        txn.delete_cf(files_cf, file_id.as_bytes())?;
        txn.commit()?;

        info!(file_id = %file_id, path = %file.path, sections = sections.len(), "Removed file");
        Ok(file)
    }

    /// Moves a file to a new name and path without touching its content.
    pub fn rename(&self, file_id: &FileId, name: &str, path: &str) -> Result<FileRecord, StoreError> {
        let files_cf = self.db.cf(FILES_CF)?;
        let paths_cf = self.db.cf(PATHS_CF)?;

        let txn = self.db.transaction();
        let bytes = txn
            .get_for_update_cf(files_cf, file_id.as_bytes(), true)?
            .ok_or(StoreError::FileNotFound(*file_id))?;
        let mut file = FileRecord::from_bytes(&bytes)?;

        if let Some(owner) = txn.get_for_update_cf(paths_cf, path.as_bytes(), true)? {
            let owner = FileId::from_slice(&owner)?;
            if owner != *file_id {
                return Err(StoreError::PathConflict {
                    path: path.to_string(),
                    owner,
                });
            }
        }

        if file.path != path {
            txn.delete_cf(paths_cf, file.path.as_bytes())?;
            txn.put_cf(paths_cf, path.as_bytes(), file_id.as_bytes())?;
        }
        file.name = name.to_string();
        file.path = path.to_string();
        txn.put_cf(files_cf, file_id.as_bytes(), file.to_vec())?;
        txn.commit()?;

        debug!(file_id = %file_id, path = %path, "Renamed file");
        Ok(file)
    }

    /// Looks up a file row.
    pub fn file(&self, file_id: &FileId) -> Result<FileRecord, StoreError> {
        let cf = self.db.cf(FILES_CF)?;
        let bytes = self
            .db
            .inner()
            .get_cf(cf, file_id.as_bytes())?
            .ok_or(StoreError::FileNotFound(*file_id))?;
        Ok(FileRecord::from_bytes(&bytes)?)
    }

    /// Looks up several file rows from one snapshot. Unknown ids map to `None`.
    pub fn files(&self, file_ids: &[FileId]) -> Result<Vec<Option<FileRecord>>, StoreError> {
        let snapshot = self.db.snapshot();
        let cf = self.db.cf(FILES_CF)?;
        file_ids
            .iter()
            .map(|id| {
                snapshot
                    .get_cf(cf, id.as_bytes())?
                    .map(|bytes| FileRecord::from_bytes(&bytes).map_err(StoreError::from))
                    .transpose()
            })
            .collect()
    }

    /// Finds the live file at `path`.
    pub fn file_by_path(&self, path: &str) -> Result<Option<FileRecord>, StoreError> {
        let paths_cf = self.db.cf(PATHS_CF)?;
        match self.db.inner().get_cf(paths_cf, path.as_bytes())? {
            Some(bytes) => {
                let id = FileId::from_slice(&bytes)?;
                match self.file(&id) {
                    Ok(file) => Ok(Some(file)),
                    // Removed between the two reads
                    Err(StoreError::FileNotFound(_)) => Ok(None),
                    Err(e) => Err(e),
                }
            }
            None => Ok(None),
        }
    }

    /// All live files, ordered by path.
    pub fn list(&self) -> Result<Vec<FileRecord>, StoreError> {
        let cf = self.db.cf(FILES_CF)?;
        let mut files = Vec::new();
        for item in self.db.inner().iterator_cf(cf, IteratorMode::Start) {
            let (_, value) = item?;
            files.push(FileRecord::from_bytes(&value)?);
        }
        files.sort_by(|a, b| a.path.cmp(&b.path));
        Ok(files)
    }

    /// Number of live files.
    pub fn count(&self) -> Result<u64, StoreError> {
        let cf = self.db.cf(FILES_CF)?;
        let mut count = 0u64;
        for item in self.db.inner().iterator_cf(cf, IteratorMode::Start) {
            item?;
            count += 1;
        }
        Ok(count)
    }

    /// True when at least one section references `digest`.
    pub fn is_referenced(&self, digest: &Digest) -> Result<bool, StoreError> {
        let cf = self.db.cf(REFS_CF)?;
        let mut refs = within_prefix(
            self.db.inner().iterator_cf(cf, from_prefix(digest.as_slice())),
            digest.as_slice(),
        );
        refs.next().transpose().map(|first| first.is_some())
    }
}

/// Decodes the sections under `file_id` from an iterator positioned at
/// its prefix.
fn read_sections(
    iter: DBIteratorWithThreadMode<'_, TransactionDB>,
    file_id: &FileId,
) -> Result<Vec<Section>, StoreError> {
    let mut sections = Vec::new();
    for item in within_prefix(iter, file_id.as_bytes()) {
        let (key, value) = item?;
        let record = SectionRecord::from_bytes(&value)?;
        sections.push(Section {
            digest: record.chunk_hash,
            chunk_index: section_index(&key)?,
            offset: record.offset,
            size: record.size,
        });
    }
    Ok(sections)
}
