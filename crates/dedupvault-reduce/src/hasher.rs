//! Fixed-size block hashing.
//!
//! A file is read in `block_size` pieces starting at sequence index 0. Each
//! piece is hashed on its own (digests are not cumulative). Every block but
//! the last is exactly `block_size` bytes; a read returning zero bytes ends
//! the stream and never produces a block.

use crate::error::{BackupError, BackupResult};
use crate::fingerprint::BlockDigest;
use crate::metadata::FileMetadata;
use bytes::Bytes;
use nix::fcntl::OFlag;
use std::fs::{File, OpenOptions};
use std::io::{ErrorKind, Read};
use std::os::unix::fs::OpenOptionsExt;
use std::path::{Path, PathBuf};
use tracing::trace;

/// Default block size in bytes
pub const DEFAULT_BLOCK_SIZE: usize = 32 * 1024;

/// One fixed-size slice of a file, hashed and ready for the dedup index
#[derive(Debug, Clone)]
pub struct Block {
    /// Position of this block within its file, starting at 0
    pub sequence_index: u64,
    /// BLAKE3 digest of `payload`
    pub digest: BlockDigest,
    /// Block content
    pub payload: Bytes,
}

impl Block {
    /// Hash `payload` into a block at `sequence_index`
    pub fn new(sequence_index: u64, payload: Bytes) -> Self {
        Self {
            sequence_index,
            digest: BlockDigest::of(&payload),
            payload,
        }
    }

    /// Payload length in bytes
    pub fn len(&self) -> usize {
        self.payload.len()
    }

    /// Never true for blocks produced by a [`BlockReader`]
    pub fn is_empty(&self) -> bool {
        self.payload.is_empty()
    }
}

/// Iterator splitting any reader into hashed blocks.
///
/// After the first error the iterator is fused and yields `None`.
pub struct BlockReader<R> {
    reader: R,
    block_size: usize,
    next_index: u64,
    done: bool,
}

impl<R: Read> BlockReader<R> {
    /// Wrap `reader`; a zero block size is treated as the default
    pub fn new(reader: R, block_size: usize) -> Self {
        Self {
            reader,
            block_size: if block_size == 0 { DEFAULT_BLOCK_SIZE } else { block_size },
            next_index: 0,
            done: false,
        }
    }

    /// Read until the buffer is full or the reader is exhausted
    fn fill(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let mut filled = 0;
        while filled < buf.len() {
            match self.reader.read(&mut buf[filled..]) {
                Ok(0) => break,
                Ok(n) => filled += n,
                Err(e) if e.kind() == ErrorKind::Interrupted => continue,
                Err(e) => return Err(e),
            }
        }
        Ok(filled)
    }
}

impl<R: Read> Iterator for BlockReader<R> {
    type Item = BackupResult<Block>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        let mut buf = vec![0u8; self.block_size];
        match self.fill(&mut buf) {
            Ok(0) => {
                self.done = true;
                None
            }
            Ok(n) => {
                buf.truncate(n);
                let block = Block::new(self.next_index, Bytes::from(buf));
                self.next_index += 1;
                Some(Ok(block))
            }
            Err(e) => {
                self.done = true;
                Some(Err(BackupError::Io(e)))
            }
        }
    }
}

/// A regular file opened for hashing, with its metadata captured at open time
pub struct OpenedFile {
    /// Path as given by the caller
    pub path: PathBuf,
    /// Metadata with an empty digest list
    pub metadata: FileMetadata,
    /// Block stream over the file contents
    pub blocks: BlockReader<File>,
}

/// Opens files and produces their block streams. Holds no cross-file state.
#[derive(Debug, Clone, Copy)]
pub struct BlockHasher {
    block_size: usize,
}

impl Default for BlockHasher {
    fn default() -> Self {
        Self::new(DEFAULT_BLOCK_SIZE)
    }
}

impl BlockHasher {
    /// Create a hasher with the given block size
    pub fn new(block_size: usize) -> Self {
        Self {
            block_size: if block_size == 0 { DEFAULT_BLOCK_SIZE } else { block_size },
        }
    }

    /// Configured block size
    pub fn block_size(&self) -> usize {
        self.block_size
    }

    /// Open `path` for hashing. Fails unless it resolves to a readable regular file.
    ///
    /// The path is checked before opening and opened non-blocking, so a FIFO
    /// or device never parks the calling thread.
    pub fn open(&self, path: &Path) -> BackupResult<OpenedFile> {
        let pre = std::fs::metadata(path).map_err(|e| BackupError::path_io(path, e))?;
        if !pre.is_file() {
            return Err(BackupError::NotRegularFile(path.to_path_buf()));
        }
        let file = OpenOptions::new()
            .read(true)
            .custom_flags(OFlag::O_NONBLOCK.bits())
            .open(path)
            .map_err(|e| BackupError::path_io(path, e))?;
        // the path may have been swapped between stat and open
        let stat = file.metadata().map_err(|e| BackupError::path_io(path, e))?;
        if !stat.is_file() {
            return Err(BackupError::NotRegularFile(path.to_path_buf()));
        }
        trace!(path = %path.display(), size = stat.len(), "opened for hashing");
        Ok(OpenedFile {
            path: path.to_path_buf(),
            metadata: FileMetadata::from_fs(path, &stat),
            blocks: BlockReader::new(file, self.block_size),
        })
    }

    /// Hash a whole file, returning its metadata with the digest list filled in
    /// and the blocks in order. Convenience for callers outside the pipeline.
    pub fn hash_file(&self, path: &Path) -> BackupResult<(FileMetadata, Vec<Block>)> {
        let opened = self.open(path)?;
        let blocks = opened
            .blocks
            .collect::<BackupResult<Vec<_>>>()
            .map_err(|e| match e {
                BackupError::Io(source) => BackupError::path_io(path, source),
                other => other,
            })?;
        let digests = blocks.iter().map(|b| b.digest).collect();
        Ok((opened.metadata.with_digests(digests), blocks))
    }
}
