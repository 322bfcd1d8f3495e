//! Shared fixtures for backup integration tests.

#![allow(dead_code)]

use async_trait::async_trait;
use bytes::Bytes;
use dedupvault_reduce::{
    BackupError, BackupResult, BlockDigest, BlockWrite, FileMetadata, FileTreeBackend, PipelineConfig,
    StorageBackend,
};
use parking_lot::Mutex;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub const HOST: &str = "itest";

/// Small-block config rooted at `root`
pub fn test_config(root: &Path) -> PipelineConfig {
    PipelineConfig {
        storage_root: root.to_path_buf(),
        block_size: 8,
        max_parallel_hashers: 4,
        host_identity: Some(HOST.to_string()),
        cache_path: Some(root.join("cache.db")),
        sync_metadata: false,
        ..Default::default()
    }
}

pub fn write_file(dir: &Path, name: &str, content: &[u8]) -> PathBuf {
    let path = dir.join(name);
    std::fs::write(&path, content).unwrap();
    path
}

/// File tree backend that counts calls and can be told to refuse digests
pub struct CountingBackend {
    inner: FileTreeBackend,
    pub block_stores: AtomicU64,
    pub metadata_stores: AtomicU64,
    refused: Mutex<HashSet<BlockDigest>>,
}

impl CountingBackend {
    pub fn new(root: &Path) -> Arc<Self> {
        Arc::new(Self {
            inner: FileTreeBackend::new(root).with_sync_metadata(false),
            block_stores: AtomicU64::new(0),
            metadata_stores: AtomicU64::new(0),
            refused: Mutex::new(HashSet::new()),
        })
    }

    pub fn refuse(&self, digest: BlockDigest) {
        self.refused.lock().insert(digest);
    }

    pub fn allow(&self, digest: &BlockDigest) {
        self.refused.lock().remove(digest);
    }

    pub fn block_stores(&self) -> u64 {
        self.block_stores.load(Ordering::SeqCst)
    }

    pub fn metadata_stores(&self) -> u64 {
        self.metadata_stores.load(Ordering::SeqCst)
    }

    pub fn tree(&self) -> &FileTreeBackend {
        &self.inner
    }
}

#[async_trait]
impl StorageBackend for CountingBackend {
    async fn initialize(&self) -> BackupResult<()> {
        self.inner.initialize().await
    }

    async fn store_block(&self, digest: &BlockDigest, payload: &[u8]) -> BackupResult<BlockWrite> {
        self.block_stores.fetch_add(1, Ordering::SeqCst);
        if self.refused.lock().contains(digest) {
            return Err(BackupError::Io(std::io::Error::other("disk full")));
        }
        self.inner.store_block(digest, payload).await
    }

    async fn store_file_metadata(&self, host_identity: &str, metadata: &FileMetadata) -> BackupResult<()> {
        self.metadata_stores.fetch_add(1, Ordering::SeqCst);
        self.inner.store_file_metadata(host_identity, metadata).await
    }

    async fn contains_block(&self, digest: &BlockDigest) -> BackupResult<bool> {
        self.inner.contains_block(digest).await
    }

    async fn load_block(&self, digest: &BlockDigest) -> BackupResult<Bytes> {
        self.inner.load_block(digest).await
    }

    async fn load_file_metadata(&self, host_identity: &str) -> BackupResult<Vec<FileMetadata>> {
        self.inner.load_file_metadata(host_identity).await
    }
}
