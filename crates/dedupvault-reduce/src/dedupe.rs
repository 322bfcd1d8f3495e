//! In-memory deduplication index.
//!
//! The index is owned by exactly one consumer and `observe` takes
//! `&mut self`. Readers that only need the byte counters go through the
//! shared [`DedupMetrics`].

use crate::fingerprint::BlockDigest;
use crate::hasher::Block;
use crate::metrics::DedupMetrics;
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::trace;

/// Classification of an observed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Observation {
    /// First time this digest was seen; the block must be stored
    New,
    /// Digest already indexed; the block must not be stored again
    Duplicate,
}

/// Durability of the stored copy of an indexed block
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StoreState {
    /// Classified new, store call not yet confirmed
    Pending,
    /// Backend confirmed the write (or found it already present)
    Durable,
    /// Backend write failed; a caller may retry
    Failed,
}

/// Per-digest bookkeeping
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DedupEntry {
    /// Length of the block in bytes
    pub byte_length: usize,
    /// Number of times the digest has been observed
    pub references: u64,
    /// Whether the stored copy is known durable
    pub state: StoreState,
}

/// Ordered map from digest to entry, with running byte counters
#[derive(Debug, Default)]
pub struct DedupIndex {
    entries: BTreeMap<BlockDigest, DedupEntry>,
    metrics: Arc<DedupMetrics>,
}

impl DedupIndex {
    /// Create an empty index with its own counters
    pub fn new() -> Self {
        Self::default()
    }

    /// Create an empty index reporting into shared counters
    pub fn with_metrics(metrics: Arc<DedupMetrics>) -> Self {
        Self {
            entries: BTreeMap::new(),
            metrics,
        }
    }

    /// Classify a block and update the counters.
    ///
    /// On `New` the entry is inserted in the `Pending` state and both
    /// counters grow by the block length; the caller forwards the block to
    /// storage. On `Duplicate` only the total grows.
    pub fn observe(&mut self, block: &Block) -> Observation {
        let len = block.len() as u64;
        if let Some(entry) = self.entries.get_mut(&block.digest) {
            entry.references += 1;
            self.metrics.record_duplicate_block(len);
            trace!(digest = %block.digest, refs = entry.references, "duplicate block");
            return Observation::Duplicate;
        }
        self.entries.insert(
            block.digest,
            DedupEntry {
                byte_length: block.len(),
                references: 1,
                state: StoreState::Pending,
            },
        );
        self.metrics.record_new_block(len);
        trace!(digest = %block.digest, len, "new block");
        Observation::New
    }

    /// Record that the backend persisted `digest`
    pub fn mark_durable(&mut self, digest: &BlockDigest) {
        if let Some(entry) = self.entries.get_mut(digest) {
            entry.state = StoreState::Durable;
        }
    }

    /// Record that persisting `digest` failed
    pub fn mark_store_failed(&mut self, digest: &BlockDigest) {
        if let Some(entry) = self.entries.get_mut(digest) {
            entry.state = StoreState::Failed;
        }
        self.metrics.record_store_failure();
    }

    /// Digests whose write failed, in digest order
    pub fn pending_retry(&self) -> Vec<BlockDigest> {
        self.entries
            .iter()
            .filter(|(_, e)| e.state == StoreState::Failed)
            .map(|(d, _)| *d)
            .collect()
    }

    /// Look up an entry
    pub fn get(&self, digest: &BlockDigest) -> Option<&DedupEntry> {
        self.entries.get(digest)
    }

    /// True if `digest` has been observed
    pub fn contains(&self, digest: &BlockDigest) -> bool {
        self.entries.contains_key(digest)
    }

    /// Entries in ascending digest order
    pub fn iter(&self) -> impl Iterator<Item = (&BlockDigest, &DedupEntry)> {
        self.entries.iter()
    }

    /// Number of distinct digests
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Is the index empty?
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Shared counters
    pub fn metrics(&self) -> &Arc<DedupMetrics> {
        &self.metrics
    }
}
