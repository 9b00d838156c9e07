use crate::config::{Config, LargeFileStrategy, Mode};

/// How one changed file is packaged, decided once per file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FilePlan {
    /// Whole-file in-memory delta.
    Delta,
    /// Chunked in-memory deltas of `chunk_size` bytes.
    Split { chunk_size: u64 },
    /// One delta from the external tool.
    External,
    /// Target content embedded as-is.
    Verbatim,
    /// Left out of the archive.
    Skip,
}

/// Size thresholds and strategy, extracted from [`Config`] so workers copy only this.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Selector {
    mode: Mode,
    strategy: LargeFileStrategy,
    threshold: u64,
    chunk_size: u64,
}

impl Selector {
    pub fn new(config: &Config) -> Self {
        Self {
            mode: config.mode,
            strategy: config.large_file_strategy,
            threshold: config.threshold_bytes(),
            chunk_size: config.chunk_size_bytes(),
        }
    }

    /// Plan for a changed file. A file is large when either side exceeds the threshold.
    pub fn plan(&self, base_len: u64, target_len: u64) -> FilePlan {
        if self.mode == Mode::File {
            return FilePlan::Verbatim;
        }
        if base_len.max(target_len) <= self.threshold {
            return FilePlan::Delta;
        }
        match self.strategy {
            LargeFileStrategy::Copy => FilePlan::Verbatim,
            LargeFileStrategy::Skip => FilePlan::Skip,
            LargeFileStrategy::Split => FilePlan::Split {
                chunk_size: self.chunk_size,
            },
            LargeFileStrategy::External => FilePlan::External,
        }
    }
}

/// Number of chunks a split file is cut into; always at least one so empty targets
/// still produce an entry.
pub fn chunk_count(target_len: u64, chunk_size: u64) -> u64 {
    target_len.div_ceil(chunk_size).max(1)
}
