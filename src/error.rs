use std::fmt;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;

pub type Result<T, E = PatchError> = std::result::Result<T, E>;

/// Stage of an operation an error was raised in, reported alongside the path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Config,
    Diff,
    Build,
    Validate,
    Apply,
    Backup,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Config => "config",
            Phase::Diff => "diff",
            Phase::Build => "build",
            Phase::Validate => "validate",
            Phase::Apply => "apply",
            Phase::Backup => "backup",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("{phase}: I/O error on {}: {source}", .path.display())]
    Io {
        phase: Phase,
        path: PathBuf,
        #[source]
        source: io::Error,
    },

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("{phase}: corrupt patch for {path}: {reason}")]
    CorruptPatch {
        phase: Phase,
        path: String,
        reason: String,
    },

    #[error("{phase}: external delta tool failed for {}: {reason}", .path.display())]
    ExternalTool {
        phase: Phase,
        path: PathBuf,
        reason: String,
    },

    #[error(
        "patch {} does not apply to {}: missing base files {missing:?}",
        .archive.display(),
        .target.display()
    )]
    Validation {
        archive: PathBuf,
        target: PathBuf,
        missing: Vec<String>,
    },

    #[error("operation cancelled")]
    Cancelled,

    #[error("worker task failed: {0}")]
    Task(#[from] tokio::task::JoinError),
}

impl PatchError {
    pub fn io(phase: Phase, path: impl Into<PathBuf>, source: io::Error) -> Self {
        PatchError::Io {
            phase,
            path: path.into(),
            source,
        }
    }

    pub fn corrupt(phase: Phase, path: impl Into<String>, reason: impl fmt::Display) -> Self {
        PatchError::CorruptPatch {
            phase,
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

/// Attach a phase and path to a raw `io::Result`.
pub trait IoResultExt<T> {
    fn at(self, phase: Phase, path: &Path) -> Result<T>;
}

impl<T> IoResultExt<T> for io::Result<T> {
    fn at(self, phase: Phase, path: &Path) -> Result<T> {
        self.map_err(|source| PatchError::io(phase, path, source))
    }
}
