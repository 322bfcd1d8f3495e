//! Pipeline configuration

use crate::backend::BackendKind;
use crate::error::BackupError;
use crate::file_tree::{DEFAULT_SHARD_DEPTH, MAX_SHARD_DEPTH};
use crate::hasher::DEFAULT_BLOCK_SIZE;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tracing::warn;

/// Default size of the hashing worker pool
pub const DEFAULT_MAX_PARALLEL_HASHERS: usize = 16;

/// Largest accepted block size
pub const MAX_BLOCK_SIZE: usize = 64 * 1024 * 1024;

/// Largest accepted hashing pool
pub const MAX_PARALLEL_HASHERS: usize = 1024;

/// Default capacity of the hasher → index channel, in events
pub const DEFAULT_CHANNEL_CAPACITY: usize = 1024;

/// Configuration for the backup pipeline
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    /// Block size in bytes
    pub block_size: usize,
    /// Maximum number of files hashed at once
    pub max_parallel_hashers: usize,
    /// Root directory of the block store
    pub storage_root: PathBuf,
    /// Name of the metadata log to append to; defaults to the hostname
    pub host_identity: Option<String>,
    /// File change cache database; defaults to `<storage_root>/filecache.db`
    pub cache_path: Option<PathBuf>,
    /// Number of shard directory levels under `data/`
    pub shard_depth: usize,
    /// Capacity of the hasher → index channel
    pub channel_capacity: usize,
    /// `fsync` after every metadata append
    pub sync_metadata: bool,
    /// Storage backend implementation
    pub backend: BackendKind,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            block_size: DEFAULT_BLOCK_SIZE,
            max_parallel_hashers: DEFAULT_MAX_PARALLEL_HASHERS,
            storage_root: PathBuf::from("vault"),
            host_identity: None,
            cache_path: None,
            shard_depth: DEFAULT_SHARD_DEPTH,
            channel_capacity: DEFAULT_CHANNEL_CAPACITY,
            sync_metadata: true,
            backend: BackendKind::FileTree,
        }
    }
}

impl PipelineConfig {
    /// Replace out-of-range values with defaults.
    ///
    /// Returns one `Configuration` error per corrected field; each is also
    /// logged as a warning. Nothing here is fatal.
    pub fn sanitize(&mut self) -> Vec<BackupError> {
        let defaults = Self::default();
        let mut issues = Vec::new();

        if self.block_size == 0 || self.block_size > MAX_BLOCK_SIZE {
            issues.push(BackupError::Configuration(format!(
                "block size {} outside 1..={}, using {}",
                self.block_size, MAX_BLOCK_SIZE, defaults.block_size
            )));
            self.block_size = defaults.block_size;
        }
        if self.max_parallel_hashers == 0 || self.max_parallel_hashers > MAX_PARALLEL_HASHERS {
            issues.push(BackupError::Configuration(format!(
                "thread count {} outside 1..={}, using {}",
                self.max_parallel_hashers, MAX_PARALLEL_HASHERS, defaults.max_parallel_hashers
            )));
            self.max_parallel_hashers = defaults.max_parallel_hashers;
        }
        if self.shard_depth > MAX_SHARD_DEPTH {
            issues.push(BackupError::Configuration(format!(
                "shard depth {} above {}, using {}",
                self.shard_depth, MAX_SHARD_DEPTH, defaults.shard_depth
            )));
            self.shard_depth = defaults.shard_depth;
        }
        if self.channel_capacity == 0 {
            issues.push(BackupError::Configuration(format!(
                "channel capacity 0, using {}",
                defaults.channel_capacity
            )));
            self.channel_capacity = defaults.channel_capacity;
        }
        if let Some(host) = &self.host_identity {
            if host.is_empty() || host.contains('/') || host == "." || host == ".." {
                issues.push(BackupError::Configuration(format!(
                    "host identity {:?} is not a single path component, using hostname",
                    host
                )));
                self.host_identity = None;
            }
        }

        for issue in &issues {
            warn!("{}", issue);
        }
        issues
    }

    /// Host identity to write metadata under
    pub fn resolved_host_identity(&self) -> String {
        self.host_identity.clone().unwrap_or_else(local_hostname)
    }

    /// Location of the file change cache
    pub fn resolved_cache_path(&self) -> PathBuf {
        self.cache_path
            .clone()
            .unwrap_or_else(|| self.storage_root.join("filecache.db"))
    }
}

/// Hostname of this machine, or `localhost` when it cannot be read
pub fn local_hostname() -> String {
    nix::unistd::gethostname()
        .ok()
        .and_then(|h| h.into_string().ok())
        .map(|h| h.replace('/', "_"))
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}
