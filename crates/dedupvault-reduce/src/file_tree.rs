//! File-tree storage backend.
//!
//! Layout under the storage root:
//!
//! ```text
//! data/<h0>/<h1>/<h2>/<hex digest>   one file per unique block
//! metas/<host identity>             append-only metadata log per host
//! ```
//!
//! `h0..` are the leading hex characters of the digest, one per directory
//! level (three levels by default). A stored block's file name is the hash
//! of its content, so the tree can be verified without any index.

use crate::backend::{BlockWrite, StorageBackend};
use crate::error::{BackupError, BackupResult};
use crate::fingerprint::BlockDigest;
use crate::metadata::FileMetadata;
use async_trait::async_trait;
use bytes::Bytes;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, instrument, warn};

/// Default number of shard directory levels
pub const DEFAULT_SHARD_DEPTH: usize = 3;

/// Largest supported shard depth
pub const MAX_SHARD_DEPTH: usize = 8;

/// Backend storing blocks and metadata logs as plain files
#[derive(Debug)]
pub struct FileTreeBackend {
    root: PathBuf,
    shard_depth: usize,
    sync_metadata: bool,
    tmp_seq: AtomicU64,
}

impl FileTreeBackend {
    /// Backend rooted at `root` with default sharding
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            shard_depth: DEFAULT_SHARD_DEPTH,
            sync_metadata: true,
            tmp_seq: AtomicU64::new(0),
        }
    }

    /// Set the number of shard levels, capped at [`MAX_SHARD_DEPTH`]
    pub fn with_shard_depth(mut self, depth: usize) -> Self {
        self.shard_depth = depth.min(MAX_SHARD_DEPTH);
        self
    }

    /// Whether each metadata append is followed by `fsync`
    pub fn with_sync_metadata(mut self, sync: bool) -> Self {
        self.sync_metadata = sync;
        self
    }

    /// Storage root
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Directory holding the block shards
    pub fn data_dir(&self) -> PathBuf {
        self.root.join("data")
    }

    /// Directory holding per-host metadata logs
    pub fn metas_dir(&self) -> PathBuf {
        self.root.join("metas")
    }

    /// Location of the block with this digest
    pub fn block_path(&self, digest: &BlockDigest) -> PathBuf {
        let hex = digest.to_hex();
        let mut path = self.data_dir();
        for c in hex.chars().take(self.shard_depth) {
            path.push(c.to_string());
        }
        path.push(hex);
        path
    }

    /// Location of a host's metadata log
    pub fn metadata_path(&self, host_identity: &str) -> BackupResult<PathBuf> {
        validate_host(host_identity)?;
        Ok(self.metas_dir().join(host_identity))
    }

    /// Re-hash every stored block and report mismatches
    pub async fn verify(&self) -> BackupResult<VerifyReport> {
        let data_dir = self.data_dir();
        tokio::task::spawn_blocking(move || verify_tree(&data_dir))
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?
    }

    fn temp_path(&self, final_path: &Path) -> PathBuf {
        let seq = self.tmp_seq.fetch_add(1, Ordering::Relaxed);
        let name = final_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        final_path.with_file_name(format!(".{}.{}.{}.tmp", name, std::process::id(), seq))
    }
}

fn validate_host(host: &str) -> BackupResult<()> {
    let bad = host.is_empty()
        || host == "."
        || host == ".."
        || host.contains('/')
        || host.contains('\0');
    if bad {
        return Err(BackupError::Configuration(format!(
            "invalid host identity {:?}",
            host
        )));
    }
    Ok(())
}

async fn create_dir_all(path: &Path) -> BackupResult<()> {
    match fs::create_dir_all(path).await {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == ErrorKind::AlreadyExists => Ok(()),
        Err(e) => Err(BackupError::path_io(path, e)),
    }
}

#[async_trait]
impl StorageBackend for FileTreeBackend {
    async fn initialize(&self) -> BackupResult<()> {
        for dir in [self.data_dir(), self.metas_dir()] {
            fs::create_dir_all(&dir)
                .await
                .map_err(|e| BackupError::StorageUnavailable {
                    root: self.root.clone(),
                    reason: format!("creating {}: {}", dir.display(), e),
                })?;
        }
        debug!(root = %self.root.display(), shard_depth = self.shard_depth, "file tree initialized");
        Ok(())
    }

    #[instrument(skip(self, digest, payload), fields(digest = %digest, len = payload.len()))]
    async fn store_block(&self, digest: &BlockDigest, payload: &[u8]) -> BackupResult<BlockWrite> {
        let path = self.block_path(digest);
        if fs::try_exists(&path).await.map_err(|e| BackupError::path_io(&path, e))? {
            debug!("block already stored");
            return Ok(BlockWrite::AlreadyPresent);
        }
        if let Some(shard) = path.parent() {
            create_dir_all(shard).await?;
        }

        // write aside, then rename: a reader never sees a partial block
        let tmp = self.temp_path(&path);
        let result: std::io::Result<()> = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(payload).await?;
            file.sync_data().await?;
            fs::rename(&tmp, &path).await
        }
        .await;
        if let Err(e) = result {
            let _ = fs::remove_file(&tmp).await;
            return Err(BackupError::path_io(&path, e));
        }
        Ok(BlockWrite::Written)
    }

    async fn store_file_metadata(&self, host_identity: &str, metadata: &FileMetadata) -> BackupResult<()> {
        let path = self.metadata_path(host_identity)?;
        create_dir_all(&self.metas_dir()).await?;
        let record = metadata.to_record();
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .await
            .map_err(|e| BackupError::path_io(&path, e))?;
        file.write_all(record.as_bytes())
            .await
            .map_err(|e| BackupError::path_io(&path, e))?;
        if self.sync_metadata {
            file.sync_data().await.map_err(|e| BackupError::path_io(&path, e))?;
        } else {
            file.flush().await.map_err(|e| BackupError::path_io(&path, e))?;
        }
        debug!(host = host_identity, name = %metadata.name.display(), blocks = metadata.block_count(), "metadata appended");
        Ok(())
    }

    async fn contains_block(&self, digest: &BlockDigest) -> BackupResult<bool> {
        let path = self.block_path(digest);
        fs::try_exists(&path).await.map_err(|e| BackupError::path_io(&path, e))
    }

    async fn load_block(&self, digest: &BlockDigest) -> BackupResult<Bytes> {
        let path = self.block_path(digest);
        match fs::read(&path).await {
            Ok(data) => Ok(Bytes::from(data)),
            Err(e) if e.kind() == ErrorKind::NotFound => Err(BackupError::BlockMissing(digest.to_hex())),
            Err(e) => Err(BackupError::path_io(&path, e)),
        }
    }

    async fn load_file_metadata(&self, host_identity: &str) -> BackupResult<Vec<FileMetadata>> {
        let path = self.metadata_path(host_identity)?;
        let text = match fs::read_to_string(&path).await {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(BackupError::path_io(&path, e)),
        };
        Ok(parse_log(&text, &path))
    }
}

/// Parse a metadata log, skipping a torn final line and malformed records
fn parse_log(text: &str, path: &Path) -> Vec<FileMetadata> {
    let mut records = Vec::new();
    let mut rest = text;
    while !rest.is_empty() {
        let Some(end) = rest.find('\n') else {
            warn!(log = %path.display(), "ignoring unterminated trailing record");
            break;
        };
        let line = &rest[..end];
        rest = &rest[end + 1..];
        if line.is_empty() {
            continue;
        }
        match FileMetadata::parse_record(line) {
            Ok(meta) => records.push(meta),
            Err(e) => warn!(log = %path.display(), error = %e, "skipping malformed record"),
        }
    }
    records
}

/// Result of re-hashing the data tree
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VerifyReport {
    /// Blocks whose content matched their name
    pub blocks_ok: u64,
    /// Bytes read while verifying
    pub bytes_checked: u64,
    /// Blocks whose content does not hash to their name
    pub corrupt: Vec<PathBuf>,
    /// Files that are not named like a block (leftover temp files and such)
    pub stray: Vec<PathBuf>,
}

impl VerifyReport {
    /// True if no corrupt block was found
    pub fn is_clean(&self) -> bool {
        self.corrupt.is_empty()
    }
}

fn verify_tree(data_dir: &Path) -> BackupResult<VerifyReport> {
    let mut report = VerifyReport::default();
    if !data_dir.exists() {
        return Ok(report);
    }
    let mut stack = vec![data_dir.to_path_buf()];
    while let Some(dir) = stack.pop() {
        let entries = std::fs::read_dir(&dir).map_err(|e| BackupError::path_io(&dir, e))?;
        for entry in entries {
            let entry = entry.map_err(|e| BackupError::path_io(&dir, e))?;
            let path = entry.path();
            let file_type = entry.file_type().map_err(|e| BackupError::path_io(&path, e))?;
            if file_type.is_dir() {
                stack.push(path);
                continue;
            }
            let expected = match path.file_name().and_then(|n| n.to_str()).map(BlockDigest::from_hex) {
                Some(Ok(d)) => d,
                _ => {
                    report.stray.push(path);
                    continue;
                }
            };
            let data = std::fs::read(&path).map_err(|e| BackupError::path_io(&path, e))?;
            report.bytes_checked += data.len() as u64;
            if BlockDigest::of(&data) == expected {
                report.blocks_ok += 1;
            } else {
                warn!(block = %path.display(), "stored block does not match its digest");
                report.corrupt.push(path);
            }
        }
    }
    Ok(report)
}
