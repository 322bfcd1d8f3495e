//! Rebuilding files from stored blocks and metadata logs

use crate::backend::StorageBackend;
use crate::error::{BackupError, BackupResult};
use crate::fingerprint::BlockDigest;
use crate::metadata::FileMetadata;
use std::path::Path;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tracing::{debug, info};

/// Write the content described by `metadata` to `writer`.
///
/// Blocks are fetched in digest-list order and each one is re-hashed before
/// it is written. Returns the number of bytes written.
pub async fn restore_file<W>(
    backend: &dyn StorageBackend,
    metadata: &FileMetadata,
    writer: &mut W,
) -> BackupResult<u64>
where
    W: AsyncWrite + Unpin + Send,
{
    let mut written = 0u64;
    for digest in &metadata.digests {
        let payload = backend.load_block(digest).await?;
        let actual = BlockDigest::of(&payload);
        if actual != *digest {
            return Err(BackupError::DigestMismatch {
                expected: digest.to_hex(),
                actual: actual.to_hex(),
            });
        }
        writer.write_all(&payload).await?;
        written += payload.len() as u64;
    }
    writer.flush().await?;

    if written != metadata.size {
        debug!(
            name = %metadata.name.display(),
            recorded = metadata.size,
            written,
            "restored size differs from recorded size"
        );
    }
    info!(name = %metadata.name.display(), blocks = metadata.block_count(), bytes = written, "file restored");
    Ok(written)
}

/// Most recently appended record for `name` in the log of `host_identity`
pub async fn find_latest(
    backend: &dyn StorageBackend,
    host_identity: &str,
    name: impl AsRef<Path>,
) -> BackupResult<Option<FileMetadata>> {
    let name = name.as_ref();
    let records = backend.load_file_metadata(host_identity).await?;
    Ok(records.into_iter().rev().find(|m| m.name == name))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::file_tree::FileTreeBackend;
    use crate::metadata::FileType;

    fn record(name: &str, mtime: i64, blocks: &[&[u8]]) -> FileMetadata {
        FileMetadata {
            file_type: FileType::Regular,
            mode: 0o100644,
            atime: mtime,
            ctime: mtime,
            mtime,
            size: blocks.iter().map(|b| b.len() as u64).sum(),
            owner: "root".into(),
            group: "root".into(),
            uid: 0,
            gid: 0,
            name: name.into(),
            digests: blocks.iter().map(|b| BlockDigest::of(b)).collect(),
        }
    }

    async fn backend_with(blocks: &[&[u8]]) -> (tempfile::TempDir, FileTreeBackend) {
        let dir = tempfile::tempdir().unwrap();
        let backend = FileTreeBackend::new(dir.path()).with_sync_metadata(false);
        backend.initialize().await.unwrap();
        for block in blocks {
            backend.store_block(&BlockDigest::of(block), block).await.unwrap();
        }
        (dir, backend)
    }

    #[tokio::test]
    async fn restores_blocks_in_order() {
        let (_dir, backend) = backend_with(&[b"head", b"tail"]).await;
        let meta = record("/f", 1, &[b"tail", b"head", b"tail"]);
        let mut out = Vec::new();
        let n = restore_file(&backend, &meta, &mut out).await.unwrap();
        assert_eq!(n, 12);
        assert_eq!(out, b"tailheadtail");
    }

    #[tokio::test]
    async fn empty_file_restores_to_nothing() {
        let (_dir, backend) = backend_with(&[]).await;
        let mut out = Vec::new();
        let n = restore_file(&backend, &record("/empty", 1, &[]), &mut out).await.unwrap();
        assert_eq!(n, 0);
        assert!(out.is_empty());
    }

    #[tokio::test]
    async fn missing_block_fails() {
        let (_dir, backend) = backend_with(&[b"one"]).await;
        let meta = record("/f", 1, &[b"one", b"two"]);
        let mut out = Vec::new();
        let err = restore_file(&backend, &meta, &mut out).await.unwrap_err();
        assert!(matches!(err, BackupError::BlockMissing(_)));
    }

    #[tokio::test]
    async fn tampered_block_is_detected() {
        let (_dir, backend) = backend_with(&[b"good"]).await;
        let digest = BlockDigest::of(b"good");
        std::fs::write(backend.block_path(&digest), b"evil").unwrap();
        let mut out = Vec::new();
        let err = restore_file(&backend, &record("/f", 1, &[b"good"]), &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, BackupError::DigestMismatch { .. }));
    }

    #[tokio::test]
    async fn latest_record_wins() {
        let (_dir, backend) = backend_with(&[]).await;
        backend.store_file_metadata("h", &record("/a", 1, &[b"v1"])).await.unwrap();
        backend.store_file_metadata("h", &record("/b", 2, &[b"other"])).await.unwrap();
        backend.store_file_metadata("h", &record("/a", 3, &[b"v2"])).await.unwrap();

        let latest = find_latest(&backend, "h", "/a").await.unwrap().unwrap();
        assert_eq!(latest.mtime, 3);
        assert!(find_latest(&backend, "h", "/missing").await.unwrap().is_none());
    }
}
