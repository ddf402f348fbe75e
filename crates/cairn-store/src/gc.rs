//! Mark-and-sweep garbage collection.
//!
//! Mark reads one snapshot and collects every digest referenced by a
//! section; chunk rows outside that set become candidates. Sweep handles
//! each candidate in its own transaction: it takes an exclusive lock on the
//! chunk row, re-checks the reverse reference index, skips digests pinned
//! by a lease, and only then deletes payload and row.
//!
//! The pin check comes after the reference check. A reader that pins a
//! digest and then sees it referenced is therefore safe: either the sweep
//! saw the pin, or it saw the reference, since no new reference can be
//! committed while the sweep holds the row lock.
//!
//! Payloads are deleted before rows. A crash in between leaves a row
//! without bytes, which the next put of that content repairs. Payloads
//! left without a row by an interrupted insert are removed by a second
//! pass over the medium, along with temp files abandoned by interrupted
//! writes.
//!
//! Every step is idempotent, so an interrupted collection is resumed by
//! simply running it again.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use cairn_core::encoding::CanonicalDecode;
use cairn_core::Digest;
use parking_lot::{Mutex, RwLock};
use rocksdb::IteratorMode;
use tracing::{debug, info, warn};

use crate::chunk::ChunkStore;
use crate::db::{from_prefix, within_prefix, CHUNKS_CF, REFS_CF, SECTIONS_CF};
use crate::records::{ChunkRecord, SectionRecord};
use crate::StoreError;

/// Collector state.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GcPhase {
    /// No collection running
    Idle,
    /// Computing the live set
    Marking,
    /// Deleting unreferenced chunks and payloads
    Sweeping,
}

/// Outcome of one collection.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct GcReport {
    /// Chunk rows deleted
    pub chunks_removed: u64,
    /// Sum of the sizes of deleted chunks
    pub bytes_reclaimed: u64,
    /// Payloads without a chunk row that were deleted
    pub payloads_removed: u64,
    /// Candidates held by an ingest lease
    pub skipped_pinned: u64,
    /// Candidates referenced again by the time they were swept
    pub skipped_referenced: u64,
    /// Candidates whose row lock could not be taken in time
    pub skipped_busy: u64,
    /// Abandoned temp files removed from the medium
    pub stale_files_removed: u64,
}

/// Temp files younger than this may still belong to a running write.
pub const STALE_TEMP_AGE: Duration = Duration::from_secs(3600);

enum Sweep {
    Removed(u64),
    Absent,
    Pinned,
    Referenced,
}

/// Garbage collector over a chunk store and its catalog relations.
pub struct GarbageCollector {
    chunks: Arc<ChunkStore>,
    phase: RwLock<GcPhase>,
    running: Mutex<()>,
    stale_age: Duration,
}

/// Returns the collector to `Idle` however the run ends.
struct PhaseGuard<'a>(&'a RwLock<GcPhase>);

impl Drop for PhaseGuard<'_> {
    fn drop(&mut self) {
        *self.0.write() = GcPhase::Idle;
    }
}

impl GarbageCollector {
    /// Creates a collector.
    pub fn new(chunks: Arc<ChunkStore>) -> Self {
        Self {
            chunks,
            phase: RwLock::new(GcPhase::Idle),
            running: Mutex::new(()),
            stale_age: STALE_TEMP_AGE,
        }
    }

    /// Overrides the age after which temp files count as abandoned.
    pub fn with_stale_age(mut self, stale_age: Duration) -> Self {
        self.stale_age = stale_age;
        self
    }

    /// Current phase.
    pub fn phase(&self) -> GcPhase {
        *self.phase.read()
    }

    /// Runs a full collection. Concurrent callers wait their turn.
    pub fn run(&self) -> Result<GcReport, StoreError> {
        let _running = self.running.lock();
        let _idle = PhaseGuard(&self.phase);

        *self.phase.write() = GcPhase::Marking;
        let candidates = self.mark()?;
        debug!(candidates = candidates.len(), "Mark phase complete");

        *self.phase.write() = GcPhase::Sweeping;
        let mut report = GcReport::default();
        for (digest, _) in &candidates {
            match self.sweep_chunk(digest) {
                Ok(Sweep::Removed(size)) => {
                    report.chunks_removed += 1;
                    report.bytes_reclaimed += size;
                }
                Ok(Sweep::Absent) => {}
                Ok(Sweep::Pinned) => report.skipped_pinned += 1,
                Ok(Sweep::Referenced) => report.skipped_referenced += 1,
                Err(StoreError::Busy(reason)) => {
                    warn!(hash = %digest, reason = %reason, "Chunk locked, leaving it for the next run");
                    report.skipped_busy += 1;
                }
                Err(e) => return Err(e),
            }
        }

        let orphans = self.sweep_orphan_payloads(&mut report)?;
        report.payloads_removed = orphans;
        report.stale_files_removed = self.chunks.medium().purge_stale(self.stale_age)?;

        info!(
            chunks_removed = report.chunks_removed,
            bytes_reclaimed = report.bytes_reclaimed,
            payloads_removed = report.payloads_removed,
            stale_files_removed = report.stale_files_removed,
            skipped_pinned = report.skipped_pinned,
            skipped_referenced = report.skipped_referenced,
            "Garbage collection complete"
        );
        Ok(report)
    }

    /// Chunk rows not referenced by any section, with their sizes.
    fn mark(&self) -> Result<Vec<(Digest, u64)>, StoreError> {
        let db = self.chunks.database();
        let snapshot = db.snapshot();

        let mut live = HashSet::new();
        for item in snapshot.iterator_cf(db.cf(SECTIONS_CF)?, IteratorMode::Start) {
            let (_, value) = item?;
            live.insert(SectionRecord::from_bytes(&value)?.chunk_hash);
        }

        let mut candidates = Vec::new();
        for item in snapshot.iterator_cf(db.cf(CHUNKS_CF)?, IteratorMode::Start) {
            let (key, value) = item?;
            let digest = Digest::from_slice(&key)?;
            if !live.contains(&digest) {
                candidates.push((digest, ChunkRecord::from_bytes(&value)?.size));
            }
        }
        Ok(candidates)
    }

    fn sweep_chunk(&self, digest: &Digest) -> Result<Sweep, StoreError> {
        let db = self.chunks.database();
        let chunks_cf = db.cf(CHUNKS_CF)?;
        let refs_cf = db.cf(REFS_CF)?;
        let txn = db.transaction();

        let Some(bytes) = txn.get_for_update_cf(chunks_cf, digest.as_slice(), true)? else {
            return Ok(Sweep::Absent);
        };
        let size = ChunkRecord::from_bytes(&bytes)?.size;

        let mut refs = within_prefix(
            txn.iterator_cf(refs_cf, from_prefix(digest.as_slice())),
            digest.as_slice(),
        );
        if refs.next().transpose()?.is_some() {
            debug!(hash = %digest, "Chunk referenced since mark, skipping");
            return Ok(Sweep::Referenced);
        }
        drop(refs);

        if self.chunks.is_pinned(digest) {
            debug!(hash = %digest, "Chunk pinned, skipping");
            return Ok(Sweep::Pinned);
        }

        self.chunks.medium().delete(digest)?;
        txn.delete_cf(chunks_cf, digest.as_slice())?;
        txn.commit()?;

        self.chunks.note_deleted();
        debug!(hash = %digest, size, "Collected chunk");
        Ok(Sweep::Removed(size))
    }

    /// Deletes payloads that have no chunk row.
    fn sweep_orphan_payloads(&self, report: &mut GcReport) -> Result<u64, StoreError> {
        let db = self.chunks.database();
        let chunks_cf = db.cf(CHUNKS_CF)?;
        let mut removed = 0u64;

        for digest in self.chunks.medium().list()? {
            if db.inner().get_cf(chunks_cf, digest.as_slice())?.is_some() {
                continue;
            }

            // The row lock waits out any put still writing this payload
            let txn = db.transaction();
            match txn.get_for_update_cf(chunks_cf, digest.as_slice(), true) {
                Ok(Some(_)) => continue,
                Ok(None) => {}
                Err(e) => match StoreError::from(e) {
                    StoreError::Busy(_) => {
                        report.skipped_busy += 1;
                        continue;
                    }
                    other => return Err(other),
                },
            }

            if self.chunks.medium().delete(&digest)? {
                warn!(hash = %digest, "Removed orphan payload");
                removed += 1;
            }
            txn.commit()?;
        }
        Ok(removed)
    }
}
