use std::path::{Path, PathBuf};
use std::time::Duration;

use clap::ValueEnum;
use serde::{Deserialize, Serialize};

use crate::error::{IoResultExt, PatchError, Phase, Result};

pub const MIB: u64 = 1024 * 1024;

/// How changed files are packaged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Mode {
    /// Raw changed and new files, no delta encoding.
    File,
    /// Per-file binary deltas.
    Binary,
}

/// What to do with a changed file above the large-file threshold.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LargeFileStrategy {
    Copy,
    Split,
    Skip,
    External,
}

/// Settings threaded through every build and apply entry point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct Config {
    pub mode: Mode,
    pub large_file_strategy: LargeFileStrategy,
    pub split_chunk_size_mb: u64,
    pub large_file_threshold_mb: u64,
    pub make_backup: bool,
    pub verbose: bool,
    /// Treat files with equal size and mtime as unchanged without reading them.
    pub shallow_compare: bool,
    /// Worker pool size; 0 uses the available hardware parallelism.
    pub threads: usize,
    pub external_tool: PathBuf,
    pub external_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            mode: Mode::Binary,
            large_file_strategy: LargeFileStrategy::Copy,
            split_chunk_size_mb: 16,
            large_file_threshold_mb: 32,
            make_backup: false,
            verbose: false,
            shallow_compare: true,
            threads: 0,
            external_tool: PathBuf::from("xdelta3"),
            external_timeout_secs: 3600,
        }
    }
}

impl Config {
    /// Read a TOML config file. Unknown keys and unknown strategy names are rejected here.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).at(Phase::Config, path)?;
        let config: Config = toml::from_str(&text)
            .map_err(|e| PatchError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.split_chunk_size_mb == 0 {
            return Err(PatchError::Config(
                "split_chunk_size_mb must be greater than zero".into(),
            ));
        }
        if self.split_chunk_size_mb.checked_mul(MIB).is_none()
            || self.large_file_threshold_mb.checked_mul(MIB).is_none()
        {
            return Err(PatchError::Config("size option overflows".into()));
        }
        if self.external_timeout_secs == 0 {
            return Err(PatchError::Config(
                "external_timeout_secs must be greater than zero".into(),
            ));
        }
        if self.large_file_strategy == LargeFileStrategy::External
            && self.external_tool.as_os_str().is_empty()
        {
            return Err(PatchError::Config(
                "large_file_strategy 'external' requires external_tool".into(),
            ));
        }
        Ok(())
    }

    pub fn threshold_bytes(&self) -> u64 {
        self.large_file_threshold_mb.saturating_mul(MIB)
    }

    pub fn chunk_size_bytes(&self) -> u64 {
        self.split_chunk_size_mb.saturating_mul(MIB)
    }

    pub fn external_timeout(&self) -> Duration {
        Duration::from_secs(self.external_timeout_secs)
    }

    pub(crate) fn worker_pool(&self) -> Result<rayon::ThreadPool> {
        rayon::ThreadPoolBuilder::new()
            .num_threads(self.threads)
            .thread_name(|i| format!("deltapack-worker-{i}"))
            .build()
            .map_err(|e| PatchError::Config(format!("cannot start worker pool: {e}")))
    }
}
