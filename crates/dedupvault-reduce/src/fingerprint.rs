//! Block fingerprinting: BLAKE3 digests used as content addresses

use crate::error::BackupError;
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Length of a digest in bytes
pub const DIGEST_LEN: usize = 32;

/// A 32-byte BLAKE3 hash identifying a block's content. Used as the CAS key.
///
/// Ordering is lexicographic over the raw bytes, which is the order the dedup
/// index keeps its entries in. Two blocks with the same digest are assumed to
/// hold the same bytes: collisions are not detected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockDigest(pub [u8; DIGEST_LEN]);

impl BlockDigest {
    /// Compute the digest of a block's bytes
    pub fn of(data: &[u8]) -> Self {
        BlockDigest(*blake3::hash(data).as_bytes())
    }

    /// Return the hash as a lowercase hex string
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Parse a 64-character hex string
    pub fn from_hex(s: &str) -> Result<Self, BackupError> {
        let mut out = [0u8; DIGEST_LEN];
        hex::decode_to_slice(s, &mut out).map_err(|_| BackupError::InvalidDigest(s.to_string()))?;
        Ok(BlockDigest(out))
    }

    /// Return the raw bytes
    pub fn as_bytes(&self) -> &[u8; DIGEST_LEN] {
        &self.0
    }
}

impl std::fmt::Display for BlockDigest {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl FromStr for BlockDigest {
    type Err = BackupError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::from_hex(s)
    }
}
