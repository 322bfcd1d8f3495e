//! Argument parsing and the backup, restore and verify modes

use crate::config::{Overrides, VaultConfig};
use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use dedupvault_reduce::{
    find_latest, open_backend, restore_file, BackupPipeline, FileTreeBackend, PipelineConfig,
    PipelineHandle, StorageBackend, Submission,
};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn};

/// Command line of `dvault`
#[derive(Parser)]
#[command(name = "dvault")]
#[command(about = "Deduplicating block-level backup", long_about = None)]
pub struct Cli {
    /// Configuration file (.toml or .json)
    #[arg(short, long, env = "DVAULT_CONFIG", global = true)]
    pub config: Option<PathBuf>,

    /// Root directory of the block store
    #[arg(short = 'r', long, env = "DVAULT_ROOT", global = true)]
    pub storage_root: Option<PathBuf>,

    /// Metadata log to write to or read from (defaults to the hostname)
    #[arg(long, env = "DVAULT_HOST", global = true)]
    pub host: Option<String>,

    /// File change cache database
    #[arg(long, global = true)]
    pub cache: Option<PathBuf>,

    /// Log as JSON lines
    #[arg(long, global = true)]
    pub json_logs: bool,

    /// Backup mode arguments, used when no subcommand is given
    #[command(flatten)]
    pub backup: BackupArgs,

    /// Restore or verify instead of backing up
    #[command(subcommand)]
    pub command: Option<Command>,
}

/// Arguments of the default backup mode
#[derive(Args, Debug, Default)]
pub struct BackupArgs {
    /// Files to back up
    pub paths: Vec<PathBuf>,

    /// Block size in bytes
    #[arg(short = 'b', long = "blocksize")]
    pub block_size: Option<usize>,

    /// Maximum number of files hashed at once
    #[arg(short = 't', long = "max-threads")]
    pub max_threads: Option<usize>,

    /// Read further paths from stdin, one per line
    #[arg(long)]
    pub stdin: bool,

    /// Exit once the given paths (and stdin) are done instead of waiting for Ctrl-C
    #[arg(long)]
    pub oneshot: bool,

    /// Print Prometheus-style counters on exit
    #[arg(long)]
    pub print_metrics: bool,
}

/// Subcommands other than backup
#[derive(Subcommand)]
pub enum Command {
    /// Rebuild a file from the newest record in a metadata log
    Restore {
        /// Name of the file as recorded at backup time
        name: PathBuf,
        /// Write here instead of stdout
        #[arg(short, long)]
        output: Option<PathBuf>,
    },
    /// Re-hash every stored block
    Verify,
}

impl Cli {
    /// Merge the config file with flags
    pub fn load_config(&self) -> Result<VaultConfig> {
        let mut config = VaultConfig::load(self.config.as_deref())?;
        config.apply(&Overrides {
            storage_root: self.storage_root.clone(),
            block_size: self.backup.block_size,
            max_threads: self.backup.max_threads,
            host: self.host.clone(),
            cache_path: self.cache.clone(),
            json_logs: self.json_logs,
        });
        Ok(config)
    }

    /// Execute the selected mode with an already merged configuration
    pub async fn run(self, config: PipelineConfig) -> Result<()> {
        match self.command {
            Some(Command::Restore { ref name, ref output }) => restore(&config, name, output.as_deref()).await,
            Some(Command::Verify) => verify(&config).await,
            None => self.backup.run(config).await,
        }
    }
}

impl BackupArgs {
    async fn run(&self, config: PipelineConfig) -> Result<()> {
        if self.paths.is_empty() && !self.stdin {
            anyhow::bail!("nothing to back up: give paths or --stdin");
        }

        let handle = BackupPipeline::new(config)
            .start()
            .await
            .context("cannot start backup pipeline")?;
        let metrics = handle.metrics();
        let progress = spawn_progress_log(&handle);

        for path in &self.paths {
            submit(&handle, path).await?;
        }

        let mut interrupted = false;
        if self.stdin {
            let mut lines = BufReader::new(tokio::io::stdin()).lines();
            loop {
                tokio::select! {
                    line = lines.next_line() => match line? {
                        Some(line) => {
                            let line = line.trim();
                            if !line.is_empty() {
                                submit(&handle, Path::new(line)).await?;
                            }
                        }
                        None => break,
                    },
                    _ = tokio::signal::ctrl_c() => {
                        interrupted = true;
                        break;
                    }
                }
            }
        }
        if !self.oneshot && !interrupted {
            info!("initial batch dispatched, waiting for Ctrl-C");
            tokio::signal::ctrl_c().await?;
        }

        info!("shutting down");
        let report = handle.shutdown().await?;
        let _ = progress.await;

        println!("Files completed: {}", report.stats.files_completed);
        println!("Files skipped:   {}", report.metrics.files_skipped);
        println!("Files failed:    {}", report.stats.files_failed);
        println!("Bytes seen:      {}", report.metrics.total_bytes_seen);
        println!("Bytes stored:    {}", report.metrics.unique_bytes_stored);
        println!("Dedup ratio:     {:.4}", report.metrics.dedup_ratio);
        for failed in &report.stats.failed {
            println!("  FAILED {}: {}", failed.path.display(), failed.error);
        }
        if !report.pending_retry.is_empty() {
            println!("Blocks not stored: {}", report.pending_retry.len());
        }
        if self.print_metrics {
            print!("{}", metrics.to_prometheus());
        }
        Ok(())
    }
}

async fn submit(handle: &PipelineHandle, path: &Path) -> Result<()> {
    match handle.submit(path).await? {
        Submission::Queued => debug!(path = %path.display(), "queued"),
        Submission::Skipped => debug!(path = %path.display(), "unchanged"),
        Submission::Rejected => warn!(path = %path.display(), "rejected"),
    }
    Ok(())
}

/// Log consumer progress until the pipeline stops publishing
fn spawn_progress_log(handle: &PipelineHandle) -> tokio::task::JoinHandle<()> {
    let mut rx = handle.subscribe();
    tokio::spawn(async move {
        while rx.changed().await.is_ok() {
            let stats = rx.borrow_and_update().clone();
            debug!(
                completed = stats.files_completed,
                failed = stats.files_failed,
                written = stats.blocks_written,
                "progress"
            );
        }
    })
}

async fn restore(config: &PipelineConfig, name: &Path, output: Option<&Path>) -> Result<()> {
    let backend = open_backend(config);
    backend.initialize().await?;
    let host = config.resolved_host_identity();
    let record = find_latest(backend.as_ref(), &host, name)
        .await?
        .with_context(|| format!("no record of {} in the log of {}", name.display(), host))?;

    match output {
        Some(path) => {
            let mut file = tokio::fs::File::create(path)
                .await
                .with_context(|| format!("creating {}", path.display()))?;
            let bytes = restore_file(backend.as_ref(), &record, &mut file).await?;
            tokio::fs::set_permissions(path, std::fs::Permissions::from_mode(record.mode & 0o7777)).await?;
            info!(output = %path.display(), bytes, "restored");
        }
        None => {
            let mut stdout = tokio::io::stdout();
            restore_file(backend.as_ref(), &record, &mut stdout).await?;
        }
    }
    Ok(())
}

async fn verify(config: &PipelineConfig) -> Result<()> {
    let backend = FileTreeBackend::new(&config.storage_root).with_shard_depth(config.shard_depth);
    let report = backend.verify().await?;

    println!("Blocks OK:     {}", report.blocks_ok);
    println!("Bytes checked: {}", report.bytes_checked);
    for path in &report.stray {
        println!("  STRAY   {}", path.display());
    }
    for path in &report.corrupt {
        println!("  CORRUPT {}", path.display());
    }
    if !report.is_clean() {
        anyhow::bail!("{} corrupt blocks", report.corrupt.len());
    }
    Ok(())
}
