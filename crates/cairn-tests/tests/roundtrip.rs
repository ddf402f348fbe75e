//! Ingest and restore integration tests.
//!
//! Tests for:
//! - Lossless round trips across sizes
//! - Section completeness and ordering
//! - Tamper detection on restore
//! - Persistence across reopen

use std::fs;
use std::io::Cursor;

use cairn_store::{Engine, IntegrityFault, StoreConfig, StoreError};
use cairn_tests::data::{pseudo_random, repeated};
use cairn_tests::TestStore;
use tempfile::TempDir;

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cairn_tests=debug,cairn_store=debug")
        .with_test_writer()
        .try_init();
}

#[test]
fn test_roundtrip_various_sizes() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();

    for (i, len) in [0usize, 1, 63, 64, 65, 1024, 1025, 50_000].into_iter().enumerate() {
        let data = pseudo_random(len, i as u64 + 1);
        let report = store.ingest_bytes(&format!("f{i}"), &data).unwrap();
        assert_eq!(report.size, len as u64);
        assert_eq!(store.engine().restore(&report.file_id).unwrap(), data, "len {len}");
    }
}

#[test]
fn test_sections_are_complete() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let data = pseudo_random(30_000, 42);
    let report = store.ingest_bytes("sections", &data).unwrap();

    let sections = store.engine().sections_for(&report.file_id).unwrap();
    assert_eq!(sections.len() as u64, report.chunks);

    let mut offset = 0u64;
    for (i, section) in sections.iter().enumerate() {
        assert_eq!(section.chunk_index, i as u64);
        assert_eq!(section.offset, offset);
        let slice = &data[offset as usize..(offset + section.size) as usize];
        assert_eq!(section.digest, cairn_core::hash(slice));
        assert!(store.engine().chunk_store().contains(&section.digest).unwrap());
        offset += section.size;
    }
    assert_eq!(offset, data.len() as u64);
}

#[test]
fn test_repeating_content_reuses_chunks_within_file() {
    init_tracing();
    let store = TestStore::with_sizes(256, 1024, 4096).unwrap();
    let data = repeated(b"ab", 40_000);
    let report = store.ingest_bytes("ab", &data).unwrap();

    assert!(report.new_chunks < report.chunks);
    assert_eq!(store.engine().restore(&report.file_id).unwrap(), data);
}

#[test]
fn test_tampered_payload_detected() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let data = pseudo_random(10_000, 5);
    let report = store.ingest_bytes("victim", &data).unwrap();

    let sections = store.engine().sections_for(&report.file_id).unwrap();
    let target = sections[sections.len() / 2];
    let path = store.medium().path_for(&target.digest);
    let mut bytes = fs::read(&path).unwrap();
    bytes[0] ^= 0x01;
    fs::write(&path, bytes).unwrap();

    let err = store.engine().verify(&report.file_id).unwrap_err();
    assert!(err.is_fatal());
    match err {
        StoreError::IntegrityViolation { file_id, fault } => {
            assert_eq!(file_id, report.file_id);
            assert!(matches!(
                fault,
                IntegrityFault::ChunkDigest { index, .. } if index == target.chunk_index
            ));
        }
        other => panic!("unexpected error: {other}"),
    }
}

#[test]
fn test_deleted_payload_reported() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let report = store.ingest_bytes("gone", &pseudo_random(5_000, 6)).unwrap();

    let first = store.engine().sections_for(&report.file_id).unwrap()[0];
    fs::remove_file(store.medium().path_for(&first.digest)).unwrap();

    let err = store.engine().restore(&report.file_id).unwrap_err();
    assert!(matches!(err, StoreError::MissingPayload(d) if d == first.digest));
    assert!(err.is_fatal());

    // Re-ingesting the same content repairs the payload
    store.ingest_bytes("gone-again", &pseudo_random(5_000, 6)).unwrap();
    store.engine().verify(&report.file_id).unwrap();
}

#[test]
fn test_restore_to_writer() {
    init_tracing();
    let store = TestStore::new().unwrap();
    let data = pseudo_random(12_345, 77);
    let report = store.ingest_bytes("stream", &data).unwrap();

    let mut out = Cursor::new(Vec::new());
    let written = store.engine().restore_to(&report.file_id, &mut out).unwrap();
    assert_eq!(written, 12_345);
    assert_eq!(out.into_inner(), data);
}

#[test]
fn test_store_survives_reopen() {
    init_tracing();
    let dir = TempDir::new().unwrap();
    let src = dir.path().join("src.bin");
    let data = pseudo_random(9_000, 13);
    fs::write(&src, &data).unwrap();

    let config = StoreConfig::new(dir.path().join("store"));
    let file_id = {
        let engine = Engine::open(config.clone()).unwrap();
        engine.ingest(&src).unwrap().file_id
    };

    let engine = Engine::open(config).unwrap();
    assert_eq!(engine.restore(&file_id).unwrap(), data);
    assert_eq!(engine.list_files().unwrap().len(), 1);
}

#[test]
fn test_unknown_file_errors() {
    init_tracing();
    let store = TestStore::new().unwrap();
    let id = cairn_core::FileId::random();
    assert!(matches!(store.engine().restore(&id), Err(StoreError::FileNotFound(_))));
    assert!(matches!(store.engine().remove(&id), Err(StoreError::FileNotFound(_))));
    assert!(matches!(store.engine().verify(&id), Err(StoreError::FileNotFound(_))));
}
