//! Verified reconstruction of files.
//!
//! The file row and its sections are read from one snapshot, and every
//! section digest is pinned before chunks are fetched. The snapshot is read
//! again after pinning; only a section list that is unchanged across both
//! reads is used, so a concurrent re-ingest followed by a collection cannot
//! remove chunks the restore still needs.
//!
//! Each chunk is fetched in index order and checked against its recorded
//! size and digest before it reaches the output. The whole-file digest is
//! checked last.

use std::io::{self, Write};
use std::sync::Arc;

use cairn_core::{ContentHasher, Digest, FileId};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::catalog::{Catalog, Section};
use crate::chunk::{ChunkLease, ChunkStore};
use crate::records::FileRecord;
use crate::StoreError;

/// What an integrity check found wrong.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum IntegrityFault {
    /// Payload bytes do not hash to the referenced digest
    #[error("chunk {index} digest mismatch: expected {expected}, got {actual}")]
    ChunkDigest {
        /// Chunk index
        index: u64,
        /// Referenced digest
        expected: Digest,
        /// Digest of the stored bytes
        actual: Digest,
    },

    /// Payload length differs from the section size
    #[error("chunk {index} size mismatch: expected {expected}, got {actual}")]
    ChunkSize {
        /// Chunk index
        index: u64,
        /// Recorded size
        expected: u64,
        /// Stored length
        actual: u64,
    },

    /// Reassembled content does not hash to the whole-file digest
    #[error("file digest mismatch: expected {expected}, got {actual}")]
    FileDigest {
        /// Recorded digest
        expected: Digest,
        /// Digest of the reassembled bytes
        actual: Digest,
    },

    /// Sections are not contiguous or do not add up to the file row
    #[error("layout: {0}")]
    Layout(String),
}

/// Rebuilds files from the catalog and the chunk store.
pub struct Reconstructor {
    catalog: Arc<Catalog>,
    chunks: Arc<ChunkStore>,
}

impl Reconstructor {
    /// Creates a reconstructor.
    pub fn new(catalog: Arc<Catalog>, chunks: Arc<ChunkStore>) -> Self {
        Self { catalog, chunks }
    }

    /// Returns the file's full content.
    pub fn restore(&self, file_id: &FileId) -> Result<Vec<u8>, StoreError> {
        let mut out = Vec::new();
        self.restore_to(file_id, &mut out)?;
        Ok(out)
    }

    /// Streams the file's content into `writer` and returns the byte count.
    ///
    /// Bytes reach the writer before the whole-file digest is checked, so
    /// on error whatever was written must be discarded.
    pub fn restore_to<W: Write>(&self, file_id: &FileId, writer: &mut W) -> Result<u64, StoreError> {
        let (file, sections, _lease) = self.pinned_snapshot(file_id)?;
        self.write_sections(&file, &sections, writer)
    }

    /// Runs the full restore pipeline into a sink.
    pub fn verify(&self, file_id: &FileId) -> Result<(), StoreError> {
        self.restore_to(file_id, &mut io::sink()).map(|_| ())
    }

    /// Reads the file and pins its section digests, re-reading until the
    /// pinned section list is still current.
    fn pinned_snapshot(&self, file_id: &FileId) -> Result<(FileRecord, Vec<Section>, ChunkLease<'_>), StoreError> {
        let mut lease = self.chunks.lease();
        let (mut file, mut sections) = self.catalog.snapshot(file_id)?;

        loop {
            for section in &sections {
                lease.pin(&section.digest);
            }

            let (current_file, current_sections) = self.catalog.snapshot(file_id)?;
            if current_file == file && current_sections == sections {
                return Ok((file, sections, lease));
            }

            debug!(file_id = %file_id, "File changed while pinning, reading again");
            file = current_file;
            sections = current_sections;
        }
    }

    fn write_sections<W: Write>(
        &self,
        file: &FileRecord,
        sections: &[Section],
        writer: &mut W,
    ) -> Result<u64, StoreError> {
        let file_id = &file.id;
        check_layout(file, sections).map_err(|fault| violation(file_id, fault))?;

        let mut hasher = ContentHasher::new();
        for section in sections {
            let payload = match self.chunks.get(&section.digest) {
                Ok(payload) => payload,
                Err(StoreError::ChunkNotFound(digest)) => {
                    return Err(StoreError::MissingChunk {
                        file_id: *file_id,
                        digest,
                    })
                }
                Err(e) => return Err(e),
            };

            if payload.len() as u64 != section.size {
                return Err(violation(
                    file_id,
                    IntegrityFault::ChunkSize {
                        index: section.chunk_index,
                        expected: section.size,
                        actual: payload.len() as u64,
                    },
                ));
            }
            let actual = Digest::of(&payload);
            if actual != section.digest {
                return Err(violation(
                    file_id,
                    IntegrityFault::ChunkDigest {
                        index: section.chunk_index,
                        expected: section.digest,
                        actual,
                    },
                ));
            }

            hasher.update(&payload);
            writer.write_all(&payload)?;
        }
        writer.flush()?;

        let written = hasher.bytes_hashed();
        let actual = hasher.finalize();
        if actual != file.hash {
            return Err(violation(
                file_id,
                IntegrityFault::FileDigest {
                    expected: file.hash,
                    actual,
                },
            ));
        }

        info!(file_id = %file_id, size = written, chunks = sections.len(), "Restored file");
        Ok(written)
    }
}

fn violation(file_id: &FileId, fault: IntegrityFault) -> StoreError {
    warn!(file_id = %file_id, fault = %fault, "Integrity violation");
    StoreError::IntegrityViolation {
        file_id: *file_id,
        fault,
    }
}

/// Indices must run 0..n, each offset must equal the running size total,
/// and the totals must match the file row.
fn check_layout(file: &FileRecord, sections: &[Section]) -> Result<(), IntegrityFault> {
    let mut offset = 0u64;
    for (expected_index, section) in sections.iter().enumerate() {
        if section.chunk_index != expected_index as u64 {
            return Err(IntegrityFault::Layout(format!(
                "expected chunk index {}, found {}",
                expected_index, section.chunk_index
            )));
        }
        if section.offset != offset {
            return Err(IntegrityFault::Layout(format!(
                "chunk {} at offset {}, expected {}",
                section.chunk_index, section.offset, offset
            )));
        }
        offset += section.size;
    }

    if sections.len() as u64 != file.chunk_count {
        return Err(IntegrityFault::Layout(format!(
            "{} sections, file row says {}",
            sections.len(),
            file.chunk_count
        )));
    }
    if offset != file.size {
        return Err(IntegrityFault::Layout(format!(
            "sections cover {} bytes, file row says {}",
            offset, file.size
        )));
    }
    Ok(())
}
