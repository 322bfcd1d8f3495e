#![warn(missing_docs)]

//! DedupVault reduction engine: fixed-size block hashing (BLAKE3), an
//! in-memory dedup index, a persistent file change cache and pluggable
//! block storage.
//!
//! Backup path: File → Blocks (BlockHasher) → Dedup (DedupIndex) → Store (StorageBackend) → Metadata log
//! Restore path: Metadata log → Digest list → Blocks → File

pub mod backend;
pub mod config;
pub mod dedupe;
pub mod error;
pub mod file_cache;
pub mod file_tree;
pub mod fingerprint;
pub mod hasher;
pub mod metadata;
pub mod metrics;
pub mod pipeline;
pub mod restore;

pub use backend::{open_backend, BackendKind, BlockWrite, StorageBackend};
pub use config::PipelineConfig;
pub use dedupe::{DedupEntry, DedupIndex, Observation, StoreState};
pub use error::{BackupError, BackupResult};
pub use file_cache::{open_or_disabled, FileCache, FileIdentity, NullFileCache, SqliteFileCache};
pub use file_tree::{FileTreeBackend, VerifyReport};
pub use fingerprint::BlockDigest;
pub use hasher::{Block, BlockHasher, BlockReader, OpenedFile};
pub use metadata::{FileMetadata, FileType};
pub use metrics::{BackupMetric, DedupMetrics, MetricKind, MetricValue, MetricsSnapshot};
pub use pipeline::{BackupPipeline, FailedFile, PipelineHandle, PipelineReport, PipelineStats, Submission};
pub use restore::{find_latest, restore_file};
