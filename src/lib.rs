//! Delta patch archives for directory trees.
//!
//! [`create_patch`] compares a base and a target tree and writes a zip archive of
//! per-file deltas; [`apply_patch`] validates such an archive against a tree, applies
//! it all-or-nothing and can write a reverse archive that undoes it.

pub mod apply;
pub mod archive;
pub mod config;
pub mod create;
pub mod delta;
pub mod error;
pub mod patch_format;
pub mod strategy;
pub mod tree_diff;
pub mod util;

pub use apply::{apply_patch, missing_base_files, validate_patch};
pub use archive::{default_patch_path, find_patches};
pub use config::{Config, LargeFileStrategy, Mode};
pub use create::create_patch;
pub use error::{PatchError, Phase, Result};
pub use patch_format::{ApplySummary, BuildSummary};
pub use util::CancelToken;
