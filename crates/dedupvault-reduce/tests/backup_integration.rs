//! End-to-end backup runs against a real file tree.

mod common;

use common::{test_config, write_file, CountingBackend, HOST};
use dedupvault_reduce::{
    find_latest, restore_file, BackupPipeline, BlockDigest, FileCache, FileIdentity, NullFileCache,
    PipelineHandle, SqliteFileCache, StorageBackend, Submission,
};
use std::path::Path;
use std::sync::Arc;

/// Submit one file and wait until the consumer has finished it
async fn submit_and_settle(handle: &PipelineHandle, path: &Path) {
    let done = handle.stats().files_completed + handle.stats().files_failed;
    let mut rx = handle.subscribe();
    handle.submit(path).await.unwrap();
    rx.wait_for(|s| s.files_completed + s.files_failed > done).await.unwrap();
}

#[tokio::test]
async fn test_shared_block_is_stored_once() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let a = write_file(src.path(), "a", b"XXXXXXXXYYYYYYYY");
    let b = write_file(src.path(), "b", b"XXXXXXXXZZZZZZZZ");
    let backend = CountingBackend::new(store.path());

    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .with_cache(Arc::new(NullFileCache::new()))
        .start()
        .await
        .unwrap();
    handle.submit(&a).await.unwrap();
    handle.submit(&b).await.unwrap();
    let report = handle.shutdown().await.unwrap();

    assert_eq!(backend.block_stores(), 3);
    assert_eq!(backend.metadata_stores(), 2);
    assert_eq!(report.metrics.total_bytes_seen, 32);
    assert_eq!(report.metrics.unique_bytes_stored, 24);
    assert!((report.metrics.dedup_ratio - 0.75).abs() < 1e-9);

    let records = backend.load_file_metadata(HOST).await.unwrap();
    assert_eq!(records.len(), 2);
    for record in &records {
        assert_eq!(record.block_count(), 2);
        assert_eq!(record.digests[0], BlockDigest::of(b"XXXXXXXX"));
    }
}

#[tokio::test]
async fn test_unchanged_file_is_skipped_on_next_run() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "doc", b"the same bytes every time");

    let first = CountingBackend::new(store.path());
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(first.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(handle.submit(&path).await.unwrap(), Submission::Queued);
    handle.shutdown().await.unwrap();
    assert!(first.block_stores() > 0);

    let second = CountingBackend::new(store.path());
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(second.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(handle.submit(&path).await.unwrap(), Submission::Skipped);
    let report = handle.shutdown().await.unwrap();

    assert_eq!(second.block_stores(), 0);
    assert_eq!(second.metadata_stores(), 0);
    assert_eq!(report.metrics.files_skipped, 1);
}

#[tokio::test]
async fn test_modified_file_is_reprocessed() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "log", b"AAAAAAAA");

    let handle = BackupPipeline::new(test_config(store.path())).start().await.unwrap();
    handle.submit(&path).await.unwrap();
    handle.shutdown().await.unwrap();

    write_file(src.path(), "log", b"AAAAAAAABBBBBBBB");
    let backend = CountingBackend::new(store.path());
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(handle.submit(&path).await.unwrap(), Submission::Queued);
    let report = handle.shutdown().await.unwrap();

    // fresh index: both blocks are new to it, the backend already has one
    assert_eq!(backend.block_stores(), 2);
    assert_eq!(report.stats.blocks_already_present, 1);
    assert_eq!(report.stats.blocks_written, 1);
}

#[tokio::test]
async fn test_bad_paths_do_not_stop_the_run() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let subdir = src.path().join("subdir");
    std::fs::create_dir(&subdir).unwrap();
    let missing = src.path().join("missing");
    let good = write_file(src.path(), "good", b"still backed up");

    let handle = BackupPipeline::new(test_config(store.path()))
        .with_cache(Arc::new(NullFileCache::new()))
        .start()
        .await
        .unwrap();
    assert_eq!(handle.submit(&missing).await.unwrap(), Submission::Rejected);
    assert_eq!(handle.submit(&subdir).await.unwrap(), Submission::Rejected);
    assert_eq!(handle.submit(&good).await.unwrap(), Submission::Queued);
    let report = handle.shutdown().await.unwrap();

    assert_eq!(report.stats.files_completed, 1);
    assert_eq!(report.stats.files_failed, 2);
    let failed: Vec<_> = report.stats.failed.iter().map(|f| f.path.clone()).collect();
    assert!(failed.contains(&missing));
    assert!(failed.contains(&subdir));
    assert_eq!(report.metrics.files_failed, 2);
}

#[tokio::test]
async fn test_restore_round_trip() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let content: Vec<u8> = (0..1000u32).map(|i| (i * 31 % 251) as u8).collect();
    let path = write_file(src.path(), "data.bin", &content);
    let backend = CountingBackend::new(store.path());

    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .start()
        .await
        .unwrap();
    handle.submit(&path).await.unwrap();
    handle.shutdown().await.unwrap();

    let record = find_latest(backend.as_ref(), HOST, &path).await.unwrap().unwrap();
    assert_eq!(record.size, 1000);
    assert_eq!(record.block_count(), 125);

    let mut out = Vec::new();
    restore_file(backend.as_ref(), &record, &mut out).await.unwrap();
    assert_eq!(out, content);
}

#[tokio::test]
async fn test_empty_file_gets_a_record_and_no_blocks() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "empty", b"");
    let backend = CountingBackend::new(store.path());

    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .with_cache(Arc::new(NullFileCache::new()))
        .start()
        .await
        .unwrap();
    handle.submit(&path).await.unwrap();
    let report = handle.shutdown().await.unwrap();

    assert_eq!(report.stats.files_completed, 1);
    assert_eq!(backend.block_stores(), 0);
    let records = backend.load_file_metadata(HOST).await.unwrap();
    assert_eq!(records.len(), 1);
    assert!(records[0].digests.is_empty());
    assert!((report.metrics.dedup_ratio - 1.0).abs() < 1e-9);
}

#[tokio::test]
async fn test_failed_store_is_pending_and_file_not_cached() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let path = write_file(src.path(), "f", b"KEEPKEEPLOSTLOST");
    let lost = BlockDigest::of(b"LOSTLOST");

    let backend = CountingBackend::new(store.path());
    backend.refuse(lost);
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .start()
        .await
        .unwrap();
    handle.submit(&path).await.unwrap();
    let report = handle.shutdown().await.unwrap();

    assert_eq!(report.pending_retry, vec![lost]);
    assert_eq!(report.stats.store_failures, 1);
    assert_eq!(report.metrics.store_failures, 1);
    assert!(!backend.contains_block(&lost).await.unwrap());

    let backend = CountingBackend::new(store.path());
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .start()
        .await
        .unwrap();
    assert_eq!(handle.submit(&path).await.unwrap(), Submission::Queued);
    let report = handle.shutdown().await.unwrap();
    assert!(report.pending_retry.is_empty());
    assert!(backend.contains_block(&lost).await.unwrap());
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_many_identical_files_with_few_workers() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let content = b"0123456789abcdef0123456789abcdef01234";
    let paths: Vec<_> = (0..24)
        .map(|i| write_file(src.path(), &format!("copy-{i}"), content))
        .collect();
    let backend = CountingBackend::new(store.path());

    let mut config = test_config(store.path());
    config.max_parallel_hashers = 2;
    config.channel_capacity = 4;
    let handle = BackupPipeline::new(config)
        .with_backend(backend.clone())
        .with_cache(Arc::new(NullFileCache::new()))
        .start()
        .await
        .unwrap();
    for path in &paths {
        handle.submit(path).await.unwrap();
        assert!(handle.busy_workers() <= 2);
    }
    let report = handle.shutdown().await.unwrap();

    // "01234567", "89abcdef" and the 5-byte tail
    assert_eq!(backend.block_stores(), 3);
    assert_eq!(report.stats.files_completed, 24);
    assert_eq!(report.metrics.total_bytes_seen, 24 * content.len() as u64);
    assert_eq!(report.metrics.unique_bytes_stored, 21);
    assert!(backend.tree().verify().await.unwrap().is_clean());
}

#[tokio::test]
async fn test_failed_block_is_not_trusted_by_later_files() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let a = write_file(src.path(), "a", b"LOSTLOSTAAAAAAAA");
    let b = write_file(src.path(), "b", b"LOSTLOSTBBBBBBBB");
    let lost = BlockDigest::of(b"LOSTLOST");
    let cache = Arc::new(SqliteFileCache::in_memory().unwrap());

    let backend = CountingBackend::new(store.path());
    backend.refuse(lost);
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .with_cache(cache.clone())
        .start()
        .await
        .unwrap();
    submit_and_settle(&handle, &a).await;
    submit_and_settle(&handle, &b).await;
    let report = handle.shutdown().await.unwrap();

    // the shared block was attempted again for b, and failed again
    assert_eq!(backend.block_stores(), 4);
    assert_eq!(report.stats.store_failures, 2);
    assert_eq!(report.pending_retry, vec![lost]);
    assert!(!backend.contains_block(&lost).await.unwrap());
    assert!(!cache.is_processed(&FileIdentity::from_path(&a).unwrap()));
    assert!(!cache.is_processed(&FileIdentity::from_path(&b).unwrap()));
}

#[tokio::test]
async fn test_failed_block_is_rewritten_by_a_later_file() {
    let store = tempfile::tempdir().unwrap();
    let src = tempfile::tempdir().unwrap();
    let a = write_file(src.path(), "a", b"LOSTLOSTAAAAAAAA");
    let b = write_file(src.path(), "b", b"LOSTLOSTBBBBBBBB");
    let lost = BlockDigest::of(b"LOSTLOST");
    let cache = Arc::new(SqliteFileCache::in_memory().unwrap());

    let backend = CountingBackend::new(store.path());
    backend.refuse(lost);
    let handle = BackupPipeline::new(test_config(store.path()))
        .with_backend(backend.clone())
        .with_cache(cache.clone())
        .start()
        .await
        .unwrap();
    submit_and_settle(&handle, &a).await;
    backend.allow(&lost);
    submit_and_settle(&handle, &b).await;
    let report = handle.shutdown().await.unwrap();

    assert!(report.pending_retry.is_empty());
    assert!(backend.contains_block(&lost).await.unwrap());
    assert!(!cache.is_processed(&FileIdentity::from_path(&a).unwrap()));
    assert!(cache.is_processed(&FileIdentity::from_path(&b).unwrap()));

    let record = find_latest(backend.as_ref(), HOST, &b).await.unwrap().unwrap();
    let mut out = Vec::new();
    restore_file(backend.as_ref(), &record, &mut out).await.unwrap();
    assert_eq!(out, b"LOSTLOSTBBBBBBBB");
}
