//! `dvault` configuration file

use dedupvault_reduce::PipelineConfig;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// On-disk configuration: pipeline settings plus logging
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct VaultConfig {
    /// Engine settings, `[pipeline]`
    pub pipeline: PipelineConfig,
    /// Log output, `[logging]`
    pub logging: LoggingConfig,
}

/// Log filter and format
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// `EnvFilter` directive used when `RUST_LOG` is unset
    pub filter: String,
    /// Emit one JSON object per event instead of text
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            filter: String::from("info"),
            json: false,
        }
    }
}

impl VaultConfig {
    /// Parse a `.toml` or `.json` file
    pub fn from_file(path: &Path) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let ext = path
            .extension()
            .and_then(|e| e.to_str())
            .unwrap_or_default();

        match ext.to_lowercase().as_str() {
            "toml" => Ok(toml::from_str(&contents)?),
            "json" => Ok(serde_json::from_str(&contents)?),
            _ => anyhow::bail!("Unsupported config file extension: {}", ext),
        }
    }

    /// Load `path` if given and present, defaults otherwise
    pub fn load(path: Option<&Path>) -> anyhow::Result<Self> {
        match path {
            Some(p) if p.exists() => Self::from_file(p),
            Some(p) => {
                anyhow::bail!("config file not found: {}", p.display())
            }
            None => Ok(Self::default()),
        }
    }

    /// Apply command line values on top of the file
    pub fn apply(&mut self, overrides: &Overrides) {
        let p = &mut self.pipeline;
        if let Some(root) = &overrides.storage_root {
            p.storage_root = root.clone();
        }
        if let Some(size) = overrides.block_size {
            p.block_size = size;
        }
        if let Some(threads) = overrides.max_threads {
            p.max_parallel_hashers = threads;
        }
        if let Some(host) = &overrides.host {
            p.host_identity = Some(host.clone());
        }
        if let Some(cache) = &overrides.cache_path {
            p.cache_path = Some(cache.clone());
        }
        if overrides.json_logs {
            self.logging.json = true;
        }
    }
}

/// Values taken from flags or the environment
#[derive(Debug, Clone, Default)]
pub struct Overrides {
    /// `--storage-root`
    pub storage_root: Option<PathBuf>,
    /// `--blocksize`
    pub block_size: Option<usize>,
    /// `--max-threads`
    pub max_threads: Option<usize>,
    /// `--host`
    pub host: Option<String>,
    /// `--cache`
    pub cache_path: Option<PathBuf>,
    /// `--json-logs`
    pub json_logs: bool,
}
