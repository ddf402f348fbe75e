//! Concurrency integration tests.
//!
//! Tests for:
//! - Racing puts of one digest
//! - Parallel ingestion of overlapping files
//! - Ingestion while garbage collection runs
//! - Restores racing re-ingestion and collection

use std::io::Cursor;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Barrier;
use std::thread;

use cairn_core::Digest;
use cairn_store::{IngestReport, PutOutcome, StoreError};
use cairn_tests::data::pseudo_random;
use cairn_tests::TestStore;

/// Initialize tracing for tests.
fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("cairn_tests=debug,cairn_store=info")
        .with_test_writer()
        .try_init();
}

#[test]
fn test_racing_puts_write_payload_once() {
    init_tracing();
    let store = TestStore::new().unwrap();
    let chunks = store.engine().chunk_store();
    let payload = pseudo_random(1500, 99);
    let digest = Digest::of(&payload);
    let barrier = Barrier::new(8);

    let outcomes: Vec<PutOutcome> = thread::scope(|s| {
        let handles: Vec<_> = (0..8)
            .map(|_| {
                s.spawn(|| {
                    barrier.wait();
                    chunks.put(&digest, &payload).unwrap()
                })
            })
            .collect();
        handles.into_iter().map(|h| h.join().unwrap()).collect()
    });

    let inserted = outcomes.iter().filter(|o| **o == PutOutcome::Inserted).count();
    assert_eq!(inserted, 1);
    assert_eq!(store.medium().writes(), 1);
    assert_eq!(chunks.count().unwrap(), 1);
}

#[test]
fn test_parallel_batch_ingest() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let shared = pseudo_random(16_000, 3);

    let paths: Vec<_> = (0..6u64)
        .map(|i| {
            let mut data = shared.clone();
            data.extend_from_slice(&pseudo_random(2_000, 100 + i));
            store.write_file(&format!("batch-{i}"), &data).unwrap()
        })
        .collect();

    let reports = store.engine().ingest_batch(&paths);
    assert_eq!(reports.len(), 6);

    let mut new_bytes = 0;
    for (report, path) in reports.into_iter().zip(&paths) {
        let report = report.unwrap();
        new_bytes += report.new_bytes;
        let expected = std::fs::read(path).unwrap();
        assert_eq!(store.engine().restore(&report.file_id).unwrap(), expected);
    }

    // Every stored byte was written by exactly one ingest
    let stats = store.engine().stats().unwrap();
    assert_eq!(stats.stored_bytes, new_bytes);
    assert!(stats.dedup_ratio() > 1.0);
}

#[test]
fn test_ingest_during_gc_never_loses_chunks() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let engine = store.engine();

    // Garbage for the collector to chew on while ingests run
    for i in 0..4u64 {
        let report = store.ingest_bytes(&format!("trash-{i}"), &pseudo_random(20_000, 500 + i)).unwrap();
        engine.remove(&report.file_id).unwrap();
    }

    let files: Vec<(String, Vec<u8>)> = (0..4u64)
        .map(|i| (format!("live-{i}"), pseudo_random(20_000, 500 + i)))
        .collect();

    let reports: Vec<IngestReport> = thread::scope(|s| {
        let collector = s.spawn(|| {
            for _ in 0..5 {
                engine.run_gc().unwrap();
            }
        });
        let ingests: Vec<_> = files
            .iter()
            .map(|(name, data)| s.spawn(|| store.ingest_bytes(name, data).unwrap()))
            .collect();

        let reports = ingests.into_iter().map(|h| h.join().unwrap()).collect();
        collector.join().unwrap();
        reports
    });

    engine.run_gc().unwrap();
    for (report, (_, data)) in reports.iter().zip(&files) {
        engine.verify(&report.file_id).unwrap();
        assert_eq!(&engine.restore(&report.file_id).unwrap(), data);
    }
}

#[test]
fn test_missing_chunk_row_is_fatal() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let report = store.ingest_bytes("f", &pseudo_random(4_000, 11)).unwrap();

    let section = store.engine().sections_for(&report.file_id).unwrap()[1];
    store.engine().chunk_store().delete(&section.digest).unwrap();

    let err = store.engine().verify(&report.file_id).unwrap_err();
    assert!(err.is_fatal());
    assert!(!err.is_transient());
    assert!(matches!(
        err,
        StoreError::MissingChunk { file_id, digest }
            if file_id == report.file_id && digest == section.digest
    ));
}

#[test]
fn test_restore_during_reingest_and_gc() {
    init_tracing();
    let store = TestStore::with_sizes(64, 256, 1024).unwrap();
    let engine = store.engine();
    let versions = [pseudo_random(30_000, 71), pseudo_random(30_000, 72)];
    let file_id = engine
        .ingest_reader("doc", "/doc", Cursor::new(&versions[0]))
        .unwrap()
        .file_id;
    let done = AtomicBool::new(false);

    thread::scope(|s| {
        s.spawn(|| {
            for round in 1..=20 {
                let data = &versions[round % 2];
                engine.ingest_reader("doc", "/doc", Cursor::new(data)).unwrap();
            }
            done.store(true, Ordering::SeqCst);
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                engine.run_gc().unwrap();
            }
        });
        s.spawn(|| {
            while !done.load(Ordering::SeqCst) {
                let restored = engine.restore(&file_id).unwrap();
                assert!(restored == versions[0] || restored == versions[1]);
            }
        });
    });

    assert_eq!(engine.restore(&file_id).unwrap(), versions[0]);
}
