//! Error types for the dedupvault engine

use std::path::PathBuf;

/// Result alias used throughout the engine
pub type BackupResult<T> = Result<T, BackupError>;

/// All errors that can occur while hashing, indexing or storing backup data
#[derive(Debug, thiserror::Error)]
pub enum BackupError {
    /// Open, read or write failure. Local to one file or one block.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
    /// IO failure tied to a specific path
    #[error("IO error on {path}: {source}")]
    PathIo {
        /// Path being read or written
        path: PathBuf,
        /// Underlying error
        #[source]
        source: std::io::Error,
    },
    /// Path does not resolve to a regular file
    #[error("Not a regular file: {0}")]
    NotRegularFile(PathBuf),
    /// Invalid configuration value; callers correct it to the default
    #[error("Configuration error: {0}")]
    Configuration(String),
    /// Storage backend could not be initialized. Fatal at startup.
    #[error("Storage unavailable at {root}: {reason}")]
    StorageUnavailable {
        /// Storage root that failed to initialize
        root: PathBuf,
        /// Description of the failure
        reason: String,
    },
    /// File change cache could not be opened or queried
    #[error("File cache unavailable: {0}")]
    CacheUnavailable(String),
    /// Digest text is not 64 hex characters
    #[error("Invalid digest: {0}")]
    InvalidDigest(String),
    /// Metadata log record could not be parsed
    #[error("Malformed metadata record: {0}")]
    MalformedRecord(String),
    /// Block referenced by a metadata record is not in the store
    #[error("Block missing from store: {0}")]
    BlockMissing(String),
    /// Stored block content does not hash to its name
    #[error("Digest mismatch for block {expected}: content hashes to {actual}")]
    DigestMismatch {
        /// Digest the block is stored under
        expected: String,
        /// Digest of the bytes actually read
        actual: String,
    },
    /// The pipeline consumer has stopped and accepts no more work
    #[error("Pipeline closed")]
    PipelineClosed,
}

impl BackupError {
    /// Attach a path to an IO error
    pub fn path_io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        BackupError::PathIo {
            path: path.into(),
            source,
        }
    }

    /// True for errors that abort startup rather than a single file
    pub fn is_fatal(&self) -> bool {
        matches!(self, BackupError::StorageUnavailable { .. })
    }
}

impl From<rusqlite::Error> for BackupError {
    fn from(e: rusqlite::Error) -> Self {
        BackupError::CacheUnavailable(e.to_string())
    }
}
