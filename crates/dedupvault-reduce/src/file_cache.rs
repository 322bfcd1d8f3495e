//! Persistent "already processed" cache, keyed by file identity.
//!
//! The identity is derived from path, size and modification time so an
//! unchanged file can be skipped without reading it. Any failure of the
//! backing store degrades to "not processed".

use crate::error::{BackupError, BackupResult};
use crate::fingerprint::{BlockDigest, DIGEST_LEN};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OptionalExtension};
use std::os::unix::ffi::OsStrExt;
use std::os::unix::fs::MetadataExt;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Stable identity of a file version. Not a content digest.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FileIdentity {
    /// Path as submitted
    pub path: PathBuf,
    /// Size in bytes
    pub size: u64,
    /// Modification time, seconds part
    pub mtime_secs: i64,
    /// Modification time, nanoseconds part
    pub mtime_nanos: i64,
}

impl FileIdentity {
    /// Build an identity from a `stat` result
    pub fn from_metadata(path: &Path, meta: &std::fs::Metadata) -> Self {
        Self {
            path: path.to_path_buf(),
            size: meta.size(),
            mtime_secs: meta.mtime(),
            mtime_nanos: meta.mtime_nsec(),
        }
    }

    /// `stat` the path and build its identity
    pub fn from_path(path: &Path) -> BackupResult<Self> {
        let meta = std::fs::metadata(path).map_err(|e| BackupError::path_io(path, e))?;
        Ok(Self::from_metadata(path, &meta))
    }

    /// Hex fingerprint used as the cache key
    pub fn fingerprint(&self) -> String {
        let mut hasher = blake3::Hasher::new();
        hasher.update(self.path.as_os_str().as_bytes());
        hasher.update(&[0]);
        hasher.update(&self.size.to_le_bytes());
        hasher.update(&self.mtime_secs.to_le_bytes());
        hasher.update(&self.mtime_nanos.to_le_bytes());
        hasher.finalize().to_hex().to_string()
    }
}

/// Query/insert contract of the change cache.
pub trait FileCache: Send + Sync {
    /// True if this exact file version was fully indexed before. Read-only.
    fn is_processed(&self, identity: &FileIdentity) -> bool;

    /// Record a fully indexed file with its ordered digest list.
    ///
    /// Called once per file after every block was observed by the dedup
    /// index. Calls for the same identity must not race.
    fn mark_processed(&self, identity: &FileIdentity, digests: &[BlockDigest]) -> BackupResult<()>;
}

/// SQLite-backed cache
pub struct SqliteFileCache {
    conn: Mutex<Connection>,
}

impl SqliteFileCache {
    /// Open or create the cache database at `path`
    pub fn open(path: &Path) -> BackupResult<Self> {
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| {
                BackupError::CacheUnavailable(format!("creating {}: {}", parent.display(), e))
            })?;
        }
        let conn = Connection::open(path)?;
        // WAL lets lookups proceed while a mark is being written
        conn.execute_batch("PRAGMA journal_mode = WAL; PRAGMA synchronous = NORMAL;")?;
        let cache = Self::with_connection(conn)?;
        info!(path = %path.display(), "file cache opened");
        Ok(cache)
    }

    /// In-memory cache for tests
    pub fn in_memory() -> BackupResult<Self> {
        Self::with_connection(Connection::open_in_memory()?)
    }

    fn with_connection(conn: Connection) -> BackupResult<Self> {
        conn.execute_batch(
            "CREATE TABLE IF NOT EXISTS processed_files (
                identity TEXT PRIMARY KEY,
                path TEXT NOT NULL,
                size INTEGER NOT NULL,
                mtime_secs INTEGER NOT NULL,
                mtime_nanos INTEGER NOT NULL,
                block_count INTEGER NOT NULL,
                digests BLOB NOT NULL,
                processed_at INTEGER NOT NULL
            );",
        )?;
        Ok(Self {
            conn: Mutex::new(conn),
        })
    }

    /// Digest list recorded for `identity`, if any
    pub fn processed_digests(&self, identity: &FileIdentity) -> BackupResult<Option<Vec<BlockDigest>>> {
        let conn = self.conn.lock();
        let blob: Option<Vec<u8>> = conn
            .prepare_cached("SELECT digests FROM processed_files WHERE identity = ?1")?
            .query_row([identity.fingerprint()], |row| row.get(0))
            .optional()?;
        Ok(blob.map(|b| {
            b.chunks_exact(DIGEST_LEN)
                .map(|c| {
                    let mut d = [0u8; DIGEST_LEN];
                    d.copy_from_slice(c);
                    BlockDigest(d)
                })
                .collect()
        }))
    }

    /// Number of cached files
    pub fn len(&self) -> BackupResult<usize> {
        let conn = self.conn.lock();
        let n: i64 = conn.query_row("SELECT COUNT(*) FROM processed_files", [], |row| row.get(0))?;
        Ok(n as usize)
    }

    /// True if nothing is cached
    pub fn is_empty(&self) -> BackupResult<bool> {
        Ok(self.len()? == 0)
    }

    fn lookup(&self, identity: &FileIdentity) -> BackupResult<bool> {
        let conn = self.conn.lock();
        let found = conn
            .prepare_cached("SELECT 1 FROM processed_files WHERE identity = ?1")?
            .query_row([identity.fingerprint()], |_| Ok(()))
            .optional()?;
        Ok(found.is_some())
    }
}

impl FileCache for SqliteFileCache {
    fn is_processed(&self, identity: &FileIdentity) -> bool {
        match self.lookup(identity) {
            Ok(hit) => hit,
            Err(e) => {
                warn!(path = %identity.path.display(), error = %e, "file cache lookup failed, treating as unprocessed");
                false
            }
        }
    }

    fn mark_processed(&self, identity: &FileIdentity, digests: &[BlockDigest]) -> BackupResult<()> {
        let blob: Vec<u8> = digests.iter().flat_map(|d| d.0).collect();
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_secs() as i64)
            .unwrap_or(0);
        let conn = self.conn.lock();
        conn.execute(
            "INSERT INTO processed_files
                (identity, path, size, mtime_secs, mtime_nanos, block_count, digests, processed_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)
             ON CONFLICT(identity) DO UPDATE SET
                block_count = ?6, digests = ?7, processed_at = ?8",
            params![
                identity.fingerprint(),
                identity.path.to_string_lossy(),
                identity.size as i64,
                identity.mtime_secs,
                identity.mtime_nanos,
                digests.len() as i64,
                blob,
                now,
            ],
        )?;
        debug!(path = %identity.path.display(), blocks = digests.len(), "marked processed");
        Ok(())
    }
}

/// Cache that remembers nothing; every file is unprocessed
#[derive(Debug, Default)]
pub struct NullFileCache;

impl NullFileCache {
    /// Create a new null cache
    pub fn new() -> Self {
        Self
    }
}

impl FileCache for NullFileCache {
    fn is_processed(&self, _identity: &FileIdentity) -> bool {
        false
    }

    fn mark_processed(&self, _identity: &FileIdentity, _digests: &[BlockDigest]) -> BackupResult<()> {
        Ok(())
    }
}

/// Open the SQLite cache, falling back to [`NullFileCache`] if it is
/// unavailable or corrupt.
pub fn open_or_disabled(path: &Path) -> Arc<dyn FileCache> {
    match SqliteFileCache::open(path) {
        Ok(cache) => Arc::new(cache),
        Err(e) => {
            warn!(path = %path.display(), error = %e, "file cache unavailable, every file will be reprocessed");
            Arc::new(NullFileCache::new())
        }
    }
}
