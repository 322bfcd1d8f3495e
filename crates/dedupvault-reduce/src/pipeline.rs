//! Backup pipeline: parallel block hashing feeding a single index consumer.
//!
//! ```text
//! submit(path) ──► [semaphore] ──► hasher (blocking pool) ──┐
//! submit(path) ──► [semaphore] ──► hasher (blocking pool) ──┼──► mpsc ──► IndexConsumer
//!                                                           ┘            ├─ DedupIndex
//!                                                                        ├─ StorageBackend
//!                                                                        └─ FileCache
//! ```
//!
//! The consumer task is the only owner of the dedup index and the only
//! caller of `store_file_metadata`, which gives the single-writer guarantees
//! both require without a lock. Its throughput bounds the whole pipeline.

use crate::backend::{open_backend, BlockWrite, StorageBackend};
use crate::config::PipelineConfig;
use crate::dedupe::{DedupIndex, Observation, StoreState};
use crate::error::{BackupError, BackupResult};
use crate::file_cache::{open_or_disabled, FileCache, FileIdentity};
use crate::fingerprint::BlockDigest;
use crate::hasher::{Block, BlockHasher};
use crate::metadata::FileMetadata;
use crate::metrics::{DedupMetrics, MetricsSnapshot};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Semaphore};
use tokio::task::JoinHandle;
use tracing::{debug, info, instrument, warn};

/// Message from a hasher to the index consumer. Events of one file arrive
/// in the order they were sent.
#[derive(Debug)]
enum HashEvent {
    Opened {
        file: u64,
        identity: FileIdentity,
        metadata: FileMetadata,
    },
    Block {
        file: u64,
        block: Block,
    },
    Finished {
        file: u64,
    },
    Failed {
        file: u64,
        path: PathBuf,
        error: BackupError,
    },
}

/// What happened to a submitted path
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Submission {
    /// Handed to a hasher
    Queued,
    /// Unchanged since it was last processed
    Skipped,
    /// Missing, unreadable or not a regular file; recorded as a failed file
    Rejected,
}

/// A file that was abandoned
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FailedFile {
    /// Path as submitted
    pub path: PathBuf,
    /// Error description
    pub error: String,
}

/// Statistics published by the index consumer.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PipelineStats {
    /// Files whose metadata was appended
    pub files_completed: u64,
    /// Files abandoned after an error
    pub files_failed: u64,
    /// Blocks written by the backend
    pub blocks_written: u64,
    /// New blocks the backend already had on disk
    pub blocks_already_present: u64,
    /// Block writes that failed
    pub store_failures: u64,
    /// Every abandoned file, in the order it failed
    pub failed: Vec<FailedFile>,
}

/// Final result of a pipeline run
#[derive(Debug, Clone)]
pub struct PipelineReport {
    /// Consumer statistics
    pub stats: PipelineStats,
    /// Byte and file counters
    pub metrics: MetricsSnapshot,
    /// Digests whose write failed and were never stored
    pub pending_retry: Vec<BlockDigest>,
}

/// Builder for a running pipeline
pub struct BackupPipeline {
    config: PipelineConfig,
    backend: Option<Arc<dyn StorageBackend>>,
    cache: Option<Arc<dyn FileCache>>,
    record_sink: Option<mpsc::UnboundedSender<FileMetadata>>,
}

impl BackupPipeline {
    /// Pipeline using the configured backend and the SQLite file cache
    pub fn new(config: PipelineConfig) -> Self {
        Self {
            config,
            backend: None,
            cache: None,
            record_sink: None,
        }
    }

    /// Use a specific backend instead of the configured one
    pub fn with_backend(mut self, backend: Arc<dyn StorageBackend>) -> Self {
        self.backend = Some(backend);
        self
    }

    /// Use a specific file cache
    pub fn with_cache(mut self, cache: Arc<dyn FileCache>) -> Self {
        self.cache = Some(cache);
        self
    }

    /// Also forward every completed file record to `sink` (for a transport layer)
    pub fn with_record_sink(mut self, sink: mpsc::UnboundedSender<FileMetadata>) -> Self {
        self.record_sink = Some(sink);
        self
    }

    /// Initialize storage and start the index consumer.
    ///
    /// Must run inside a tokio runtime. Fails only if the backend cannot be
    /// initialized.
    pub async fn start(self) -> BackupResult<PipelineHandle> {
        let mut config = self.config;
        config.sanitize();

        let backend = self.backend.unwrap_or_else(|| open_backend(&config));
        backend.initialize().await?;
        let cache = self
            .cache
            .unwrap_or_else(|| open_or_disabled(&config.resolved_cache_path()));

        let host = config.resolved_host_identity();
        let metrics = Arc::new(DedupMetrics::new());
        let (events_tx, events_rx) = mpsc::channel(config.channel_capacity);
        let (stats_tx, stats_rx) = watch::channel(PipelineStats::default());

        let consumer = IndexConsumer {
            index: DedupIndex::with_metrics(Arc::clone(&metrics)),
            backend,
            cache: Arc::clone(&cache),
            host: host.clone(),
            in_flight: HashMap::new(),
            stats: PipelineStats::default(),
            stats_tx,
            record_sink: self.record_sink,
        };
        let consumer = tokio::spawn(consumer.run(events_rx));

        info!(
            host = %host,
            root = %config.storage_root.display(),
            block_size = config.block_size,
            workers = config.max_parallel_hashers,
            "backup pipeline started"
        );

        Ok(PipelineHandle {
            hasher: BlockHasher::new(config.block_size),
            workers: config.max_parallel_hashers,
            slots: Arc::new(Semaphore::new(config.max_parallel_hashers)),
            events_tx,
            stats_rx,
            cache,
            metrics,
            next_file: AtomicU64::new(0),
            consumer,
        })
    }
}

/// Handle for submitting files to a running pipeline.
///
/// The pipeline stays up and accepts work until [`PipelineHandle::shutdown`]
/// is called.
pub struct PipelineHandle {
    hasher: BlockHasher,
    workers: usize,
    slots: Arc<Semaphore>,
    events_tx: mpsc::Sender<HashEvent>,
    stats_rx: watch::Receiver<PipelineStats>,
    cache: Arc<dyn FileCache>,
    metrics: Arc<DedupMetrics>,
    next_file: AtomicU64,
    consumer: JoinHandle<ConsumerOutcome>,
}

impl PipelineHandle {
    /// Offer one file to the pipeline.
    ///
    /// Waits while every worker is busy, so at most `max_parallel_hashers`
    /// files are open at once. Per-file failures are not returned here; they
    /// are logged and collected in [`PipelineStats::failed`].
    #[instrument(skip(self, path), fields(path = %path.as_ref().display()))]
    pub async fn submit(&self, path: impl AsRef<Path>) -> BackupResult<Submission> {
        let path = path.as_ref().to_path_buf();
        let file = self.next_file.fetch_add(1, Ordering::Relaxed);

        let inspected = match tokio::fs::metadata(&path).await {
            Ok(meta) if meta.is_file() => Ok(FileIdentity::from_metadata(&path, &meta)),
            Ok(_) => Err(BackupError::NotRegularFile(path.clone())),
            Err(e) => Err(BackupError::path_io(&path, e)),
        };
        let identity = match inspected {
            Ok(identity) => identity,
            Err(error) => {
                self.events_tx
                    .send(HashEvent::Failed { file, path, error })
                    .await
                    .map_err(|_| BackupError::PipelineClosed)?;
                return Ok(Submission::Rejected);
            }
        };

        if self.is_processed(&identity).await {
            debug!("unchanged since last run, skipping");
            self.metrics.record_file_skipped();
            return Ok(Submission::Skipped);
        }

        let permit = Arc::clone(&self.slots)
            .acquire_owned()
            .await
            .map_err(|_| BackupError::PipelineClosed)?;
        let hasher = self.hasher;
        let tx = self.events_tx.clone();
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            hash_one(hasher, file, path, identity, tx);
        });
        Ok(Submission::Queued)
    }

    /// Cache lookup off the async workers; the SQLite cache blocks on a mutex
    async fn is_processed(&self, identity: &FileIdentity) -> bool {
        let cache = Arc::clone(&self.cache);
        let identity = identity.clone();
        tokio::task::spawn_blocking(move || cache.is_processed(&identity))
            .await
            .unwrap_or(false)
    }

    /// Latest statistics published by the consumer
    pub fn stats(&self) -> PipelineStats {
        self.stats_rx.borrow().clone()
    }

    /// Receiver notified whenever the consumer publishes new statistics
    pub fn subscribe(&self) -> watch::Receiver<PipelineStats> {
        self.stats_rx.clone()
    }

    /// Shared byte and file counters; readable without blocking the pipeline
    pub fn metrics(&self) -> Arc<DedupMetrics> {
        Arc::clone(&self.metrics)
    }

    /// Number of hashers currently running
    pub fn busy_workers(&self) -> usize {
        self.workers - self.slots.available_permits()
    }

    /// Stop accepting work, wait for in-flight files, drain the consumer.
    pub async fn shutdown(self) -> BackupResult<PipelineReport> {
        let PipelineHandle {
            workers,
            slots,
            events_tx,
            metrics,
            consumer,
            ..
        } = self;

        // every permit back means every hasher has exited
        let all = slots
            .acquire_many(workers as u32)
            .await
            .map_err(|_| BackupError::PipelineClosed)?;
        slots.close();
        drop(all);
        drop(events_tx);

        let outcome = consumer
            .await
            .map_err(|e| BackupError::Io(std::io::Error::other(e)))?;
        let report = PipelineReport {
            stats: outcome.stats,
            metrics: metrics.snapshot(),
            pending_retry: outcome.pending_retry,
        };
        info!(
            completed = report.stats.files_completed,
            failed = report.stats.files_failed,
            skipped = report.metrics.files_skipped,
            dedup_ratio = report.metrics.dedup_ratio,
            "backup pipeline stopped"
        );
        Ok(report)
    }
}

/// Hash one file on a blocking thread and stream its events to the consumer
fn hash_one(
    hasher: BlockHasher,
    file: u64,
    path: PathBuf,
    identity: FileIdentity,
    tx: mpsc::Sender<HashEvent>,
) {
    let opened = match hasher.open(&path) {
        Ok(opened) => opened,
        Err(error) => {
            let _ = tx.blocking_send(HashEvent::Failed { file, path, error });
            return;
        }
    };
    let opened_event = HashEvent::Opened {
        file,
        identity,
        metadata: opened.metadata,
    };
    if tx.blocking_send(opened_event).is_err() {
        return;
    }
    for block in opened.blocks {
        let event = match block {
            Ok(block) => HashEvent::Block { file, block },
            Err(error) => {
                let error = match error {
                    BackupError::Io(source) => BackupError::path_io(&path, source),
                    other => other,
                };
                let _ = tx.blocking_send(HashEvent::Failed { file, path, error });
                return;
            }
        };
        if tx.blocking_send(event).is_err() {
            return;
        }
    }
    let _ = tx.blocking_send(HashEvent::Finished { file });
}

/// Per-file state while its blocks are arriving
struct FileAssembly {
    identity: FileIdentity,
    metadata: FileMetadata,
    digests: Vec<BlockDigest>,
    store_failures: u64,
}

struct ConsumerOutcome {
    stats: PipelineStats,
    pending_retry: Vec<BlockDigest>,
}

/// Sole owner of the dedup index and the metadata write path
struct IndexConsumer {
    index: DedupIndex,
    backend: Arc<dyn StorageBackend>,
    cache: Arc<dyn FileCache>,
    host: String,
    in_flight: HashMap<u64, FileAssembly>,
    stats: PipelineStats,
    stats_tx: watch::Sender<PipelineStats>,
    record_sink: Option<mpsc::UnboundedSender<FileMetadata>>,
}

impl IndexConsumer {
    async fn run(mut self, mut rx: mpsc::Receiver<HashEvent>) -> ConsumerOutcome {
        while let Some(event) = rx.recv().await {
            match event {
                HashEvent::Opened {
                    file,
                    identity,
                    metadata,
                } => {
                    self.in_flight.insert(
                        file,
                        FileAssembly {
                            identity,
                            metadata,
                            digests: Vec::new(),
                            store_failures: 0,
                        },
                    );
                }
                HashEvent::Block { file, block } => self.on_block(file, block).await,
                HashEvent::Finished { file } => {
                    self.on_finished(file).await;
                    self.publish();
                }
                HashEvent::Failed { file, path, error } => {
                    self.in_flight.remove(&file);
                    self.fail(path, error);
                    self.publish();
                }
            }
        }
        if !self.in_flight.is_empty() {
            warn!(files = self.in_flight.len(), "consumer stopped with unfinished files");
        }
        ConsumerOutcome {
            pending_retry: self.index.pending_retry(),
            stats: self.stats,
        }
    }

    async fn on_block(&mut self, file: u64, block: Block) {
        let Some(assembly) = self.in_flight.get_mut(&file) else {
            return;
        };
        let expected = assembly.digests.len() as u64;
        if block.sequence_index != expected {
            let path = assembly.identity.path.clone();
            self.in_flight.remove(&file);
            self.fail(
                path,
                BackupError::Io(std::io::Error::other(format!(
                    "block {} arrived, expected {}",
                    block.sequence_index, expected
                ))),
            );
            return;
        }
        assembly.digests.push(block.digest);

        if self.index.observe(&block) == Observation::Duplicate {
            let state = self.index.get(&block.digest).map(|entry| entry.state);
            if state != Some(StoreState::Failed) {
                return;
            }
            // an earlier write of this digest failed; this file needs it too
            debug!(digest = %block.digest, "retrying failed block");
        }
        match self.backend.store_block(&block.digest, &block.payload).await {
            Ok(write) => {
                self.index.mark_durable(&block.digest);
                match write {
                    BlockWrite::Written => self.stats.blocks_written += 1,
                    BlockWrite::AlreadyPresent => self.stats.blocks_already_present += 1,
                }
            }
            Err(e) => {
                warn!(digest = %block.digest, error = %e, "block store failed");
                self.index.mark_store_failed(&block.digest);
                self.stats.store_failures += 1;
                if let Some(assembly) = self.in_flight.get_mut(&file) {
                    assembly.store_failures += 1;
                }
            }
        }
    }

    async fn on_finished(&mut self, file: u64) {
        let Some(assembly) = self.in_flight.remove(&file) else {
            return;
        };
        let FileAssembly {
            identity,
            metadata,
            digests,
            store_failures,
        } = assembly;
        let metadata = metadata.with_digests(digests);

        if let Err(e) = self.backend.store_file_metadata(&self.host, &metadata).await {
            self.index.metrics().record_metadata_failure();
            self.fail(identity.path, e);
            return;
        }

        // a file with unstored blocks must be re-read on the next run
        if store_failures == 0 {
            if let Err(e) = self.cache.mark_processed(&identity, &metadata.digests) {
                warn!(path = %identity.path.display(), error = %e, "could not record file in cache");
            }
        } else {
            warn!(path = %identity.path.display(), store_failures, "file has unstored blocks, not caching");
        }

        debug!(path = %identity.path.display(), blocks = metadata.block_count(), "file complete");
        self.stats.files_completed += 1;
        self.index.metrics().record_file_processed();
        if let Some(sink) = &self.record_sink {
            let _ = sink.send(metadata);
        }
    }

    fn fail(&mut self, path: PathBuf, error: BackupError) {
        warn!(path = %path.display(), error = %error, "file abandoned");
        self.stats.files_failed += 1;
        self.index.metrics().record_file_failed();
        self.stats.failed.push(FailedFile {
            path,
            error: error.to_string(),
        });
    }

    fn publish(&self) {
        self.stats_tx.send_replace(self.stats.clone());
    }
}
