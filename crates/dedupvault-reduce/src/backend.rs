//! Storage backend interface.
//!
//! A backend persists unique blocks under content-derived locations and
//! appends per-host file metadata records. Backends are selected once at
//! startup through [`BackendKind`].

use crate::config::PipelineConfig;
use crate::error::BackupResult;
use crate::file_tree::FileTreeBackend;
use crate::fingerprint::BlockDigest;
use crate::metadata::FileMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use serde::{Deserialize, Serialize};
use std::sync::Arc;

/// Outcome of a block write
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BlockWrite {
    /// Block bytes were written
    Written,
    /// A block with this digest was already stored; nothing was written
    AlreadyPresent,
}

/// Capability set every backend provides.
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Prepare durable storage. Idempotent. Failure is fatal to startup.
    async fn initialize(&self) -> BackupResult<()>;

    /// Persist a block under a location derived only from `digest`.
    ///
    /// Storing the same digest twice is safe and never damages the first
    /// copy. On error the block is not durable; retrying is up to the caller.
    async fn store_block(&self, digest: &BlockDigest, payload: &[u8]) -> BackupResult<BlockWrite>;

    /// Append one record to the metadata log of `host_identity`.
    ///
    /// Not safe to call concurrently for the same host: the backend takes no
    /// lock on this path. The pipeline calls it from its single consumer task.
    async fn store_file_metadata(&self, host_identity: &str, metadata: &FileMetadata) -> BackupResult<()>;

    /// True if a block with this digest is stored
    async fn contains_block(&self, digest: &BlockDigest) -> BackupResult<bool>;

    /// Read a stored block back
    async fn load_block(&self, digest: &BlockDigest) -> BackupResult<Bytes>;

    /// Read every intact record of a host's metadata log, oldest first
    async fn load_file_metadata(&self, host_identity: &str) -> BackupResult<Vec<FileMetadata>>;
}

/// Backend implementations selectable from configuration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BackendKind {
    /// Blocks and metadata logs as plain files under `storage_root`
    #[default]
    FileTree,
}

/// Build the backend named by `config.backend`. Call `initialize` before use.
pub fn open_backend(config: &PipelineConfig) -> Arc<dyn StorageBackend> {
    match config.backend {
        BackendKind::FileTree => Arc::new(
            FileTreeBackend::new(&config.storage_root)
                .with_shard_depth(config.shard_depth)
                .with_sync_metadata(config.sync_metadata),
        ),
    }
}
