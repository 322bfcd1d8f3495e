#![warn(missing_docs)]

//! `dvault`: back up files into a deduplicated block store.

use anyhow::{Context, Result};
use clap::Parser;
use dedupvault_cli::cli::Cli;
use dedupvault_cli::config::LoggingConfig;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

/// Blocking threads the runtime may keep besides the hashers
const EXTRA_BLOCKING_THREADS: usize = 64;

fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = cli.load_config()?;
    init_tracing(&config.logging);

    tracing::info!("DedupVault starting...");
    config.pipeline.sanitize();

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("dvault")
        .max_blocking_threads(config.pipeline.max_parallel_hashers + EXTRA_BLOCKING_THREADS)
        .build()
        .context("cannot create worker pool")?;

    runtime.block_on(cli.run(config.pipeline))
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&logging.filter));
    let (text, json) = if logging.json {
        (None, Some(fmt::layer().json().with_writer(std::io::stderr)))
    } else {
        (Some(fmt::layer().with_writer(std::io::stderr)), None)
    };
    tracing_subscriber::registry().with(filter).with(text).with(json).init();
}
