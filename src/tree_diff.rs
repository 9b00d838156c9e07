use std::collections::BTreeMap;
use std::fs::{self, Metadata};
use std::io::{self, Read};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;
use walkdir::WalkDir;

use crate::error::{IoResultExt, PatchError, Phase, Result};
use crate::util;

/// Files that differ between a base and a target tree.
///
/// Paths are relative with `/` separators. Order is unspecified.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct TreeDiff {
    /// In both trees with different content.
    pub changed: Vec<String>,
    /// Only in the target tree, or replacing a directory/file of the other type.
    pub new: Vec<String>,
}

impl TreeDiff {
    fn merge(&mut self, other: TreeDiff) {
        self.changed.extend(other.changed);
        self.new.extend(other.new);
    }

    pub fn is_empty(&self) -> bool {
        self.changed.is_empty() && self.new.is_empty()
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DiffOptions {
    /// Equal size and mtime count as unchanged without reading content.
    pub shallow: bool,
}

impl Default for DiffOptions {
    fn default() -> Self {
        Self { shallow: true }
    }
}

struct Listed {
    path: PathBuf,
    meta: Metadata,
}

/// Compare two trees. Must be called from inside the worker pool that should run the
/// per-file comparisons.
pub fn diff_trees(base_root: &Path, target_root: &Path, options: DiffOptions) -> Result<TreeDiff> {
    let base_meta = fs::metadata(base_root).at(Phase::Diff, base_root)?;
    let target_meta = fs::metadata(target_root).at(Phase::Diff, target_root)?;
    for (root, meta) in [(base_root, &base_meta), (target_root, &target_meta)] {
        if !meta.is_dir() {
            return Err(PatchError::io(
                Phase::Diff,
                root,
                io::Error::new(io::ErrorKind::InvalidInput, "not a directory"),
            ));
        }
    }
    diff_level(base_root, target_root, "", options)
}

fn diff_level(base: &Path, target: &Path, prefix: &str, options: DiffOptions) -> Result<TreeDiff> {
    let base_entries = list_dir(base)?;
    let target_entries = list_dir(target)?;

    let mut result = TreeDiff::default();
    let mut file_pairs: Vec<(String, &Listed, &Listed)> = Vec::new();
    let mut subdirs: Vec<(String, &Listed, &Listed)> = Vec::new();

    for (name, t) in &target_entries {
        let rel = util::join_relative(prefix, name);
        match base_entries.get(name) {
            None => collect_new(t, rel, &mut result.new)?,
            Some(b) => match (b.meta.is_dir(), t.meta.is_dir()) {
                (true, true) => subdirs.push((rel, b, t)),
                (false, false) => file_pairs.push((rel, b, t)),
                // Type replacement: everything on the target side is written fresh.
                _ => collect_new(t, rel, &mut result.new)?,
            },
        }
    }

    let changed: Vec<Option<String>> = file_pairs
        .par_iter()
        .map(|(rel, b, t)| {
            files_differ(b, t, options)
                .at(Phase::Diff, &t.path)
                .map(|differ| differ.then(|| rel.clone()))
        })
        .collect::<Result<_>>()?;
    result.changed.extend(changed.into_iter().flatten());

    for (rel, b, t) in subdirs {
        result.merge(diff_level(&b.path, &t.path, &rel, options)?);
    }

    let dir = if prefix.is_empty() { "." } else { prefix };
    debug!(
        dir,
        changed = result.changed.len(),
        new = result.new.len(),
        "compared directory"
    );
    Ok(result)
}

fn list_dir(dir: &Path) -> Result<BTreeMap<String, Listed>> {
    let mut entries = BTreeMap::new();
    for entry in fs::read_dir(dir).at(Phase::Diff, dir)? {
        let entry = entry.at(Phase::Diff, dir)?;
        let path = entry.path();
        let name = entry
            .file_name()
            .into_string()
            .map_err(|raw| {
                io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("non-UTF-8 file name: {}", raw.to_string_lossy()),
                )
            })
            .at(Phase::Diff, &path)?;
        // Follow symlinks; the tree is compared by content.
        let meta = fs::metadata(&path).at(Phase::Diff, &path)?;
        entries.insert(name, Listed { path, meta });
    }
    Ok(entries)
}

/// Record a target-only entry; directories contribute every file beneath them.
fn collect_new(entry: &Listed, rel: String, out: &mut Vec<String>) -> Result<()> {
    if !entry.meta.is_dir() {
        out.push(rel);
        return Ok(());
    }
    for item in WalkDir::new(&entry.path).min_depth(1).follow_links(true) {
        let item = item
            .map_err(io::Error::from)
            .at(Phase::Diff, &entry.path)?;
        if item.file_type().is_dir() {
            continue;
        }
        let sub = item
            .path()
            .strip_prefix(&entry.path)
            .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
            .and_then(util::to_relative_string)
            .at(Phase::Diff, item.path())?;
        out.push(util::join_relative(&rel, &sub));
    }
    Ok(())
}

fn files_differ(base: &Listed, target: &Listed, options: DiffOptions) -> io::Result<bool> {
    if base.meta.len() != target.meta.len() {
        return Ok(true);
    }
    if options.shallow {
        if let (Ok(a), Ok(b)) = (base.meta.modified(), target.meta.modified()) {
            if a == b {
                return Ok(false);
            }
        }
    }
    contents_differ(&base.path, &target.path)
}

fn contents_differ(a: &Path, b: &Path) -> io::Result<bool> {
    const BUF: usize = 256 * 1024;
    let mut ra = io::BufReader::with_capacity(BUF, fs::File::open(a)?);
    let mut rb = io::BufReader::with_capacity(BUF, fs::File::open(b)?);
    let mut buf_a = vec![0u8; BUF];
    let mut buf_b = vec![0u8; BUF];

    loop {
        let n = read_full(&mut ra, &mut buf_a)?;
        let m = read_full(&mut rb, &mut buf_b)?;
        if n != m || buf_a[..n] != buf_b[..m] {
            return Ok(true);
        }
        if n == 0 {
            return Ok(false);
        }
    }
}

/// Fill `buf` unless the reader hits end of file first.
fn read_full(reader: &mut impl Read, buf: &mut [u8]) -> io::Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        match reader.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(n) => filled += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(e),
        }
    }
    Ok(filled)
}
