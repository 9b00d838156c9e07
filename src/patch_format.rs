use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Tag of an in-memory full-file delta.
pub const DELTA_MAGIC: &[u8; 8] = b"DPKDLT01";
/// Tag of one chunk of a split large file.
pub const CHUNK_MAGIC: &[u8; 8] = b"DPKCHK01";
/// Tag of a delta produced by the external tool.
pub const EXTERNAL_MAGIC: &[u8; 8] = b"DPKXDL01";
pub const TAG_LEN: usize = 8;

pub const PATCH_SUFFIX: &str = ".patch";
pub const PART_MARKER: &str = ".part_";
pub const PATCH_ARCHIVE_SUFFIX: &str = "_patch.zip";
pub const REVERT_ARCHIVE_SUFFIX: &str = "_revertpatch.zip";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum DiffOp {
    Copy { offset: u64, length: u64 },
    Insert { data: Vec<u8> },
}

/// Body of a full delta. The base fields pin the exact base the delta applies to.
#[derive(Debug, Serialize, Deserialize)]
pub struct DeltaBody {
    pub base_len: u64,
    pub base_hash: [u8; 32],
    pub target_len: u64,
    pub target_hash: [u8; 32],
    pub ops: Vec<DiffOp>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChunkHeader {
    pub index: u32,
    pub total: u32,
    pub chunk_size: u64,
    /// Length of the whole reconstructed file.
    pub target_len: u64,
}

impl ChunkHeader {
    pub fn offset(&self) -> u64 {
        self.index as u64 * self.chunk_size
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExternalHeader {
    pub base_len: u64,
    pub base_hash: [u8; 32],
    pub target_len: u64,
    pub target_hash: [u8; 32],
}

#[derive(Debug)]
pub enum VerbatimSource {
    Bytes(Vec<u8>),
    File(PathBuf),
}

/// One unit of work inside a patch archive.
#[derive(Debug)]
pub enum PatchEntry {
    FullDelta {
        relative_path: String,
        delta_bytes: Vec<u8>,
    },
    ChunkedDelta {
        relative_path: String,
        header: ChunkHeader,
        delta_bytes: Vec<u8>,
    },
    ExternalDelta {
        relative_path: String,
        delta_bytes: Vec<u8>,
    },
    VerbatimFile {
        relative_path: String,
        source: VerbatimSource,
    },
}

impl PatchEntry {
    pub fn entry_name(&self) -> String {
        match self {
            PatchEntry::FullDelta { relative_path, .. }
            | PatchEntry::ExternalDelta { relative_path, .. } => delta_entry_name(relative_path),
            PatchEntry::ChunkedDelta {
                relative_path,
                header,
                ..
            } => chunk_entry_name(relative_path, header.index),
            PatchEntry::VerbatimFile { relative_path, .. } => relative_path.clone(),
        }
    }
}

pub fn delta_entry_name(relative_path: &str) -> String {
    format!("{relative_path}{PATCH_SUFFIX}")
}

pub fn chunk_entry_name(relative_path: &str, index: u32) -> String {
    format!("{relative_path}{PART_MARKER}{index}{PATCH_SUFFIX}")
}

/// Kind of an archive entry, decided from its name and leading tag bytes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EntryKind {
    Full { path: String },
    Chunk { path: String, index: u32 },
    External { path: String },
    Verbatim { path: String },
}

impl EntryKind {
    pub fn classify(name: &str, head: &[u8]) -> EntryKind {
        let tag = head.get(..TAG_LEN);
        if let Some(stem) = name.strip_suffix(PATCH_SUFFIX) {
            if tag == Some(&DELTA_MAGIC[..]) {
                return EntryKind::Full { path: stem.to_string() };
            }
            if tag == Some(&EXTERNAL_MAGIC[..]) {
                return EntryKind::External { path: stem.to_string() };
            }
            if tag == Some(&CHUNK_MAGIC[..]) {
                if let Some((path, index)) = split_part_index(stem) {
                    return EntryKind::Chunk {
                        path: path.to_string(),
                        index,
                    };
                }
            }
        }
        EntryKind::Verbatim {
            path: name.to_string(),
        }
    }

    pub fn path(&self) -> &str {
        match self {
            EntryKind::Full { path }
            | EntryKind::Chunk { path, .. }
            | EntryKind::External { path }
            | EntryKind::Verbatim { path } => path,
        }
    }

    pub fn needs_base(&self) -> bool {
        !matches!(self, EntryKind::Verbatim { .. })
    }
}

fn split_part_index(stem: &str) -> Option<(&str, u32)> {
    let at = stem.rfind(PART_MARKER)?;
    let digits = &stem[at + PART_MARKER.len()..];
    if digits.is_empty() || !digits.bytes().all(|b| b.is_ascii_digit()) {
        return None;
    }
    Some((&stem[..at], digits.parse().ok()?))
}

/// Name of the reverse archive written next to `patch`.
pub fn revert_archive_path(patch: &std::path::Path) -> PathBuf {
    let name = patch
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    let stem = name
        .strip_suffix(PATCH_ARCHIVE_SUFFIX)
        .or_else(|| name.strip_suffix(".zip"))
        .unwrap_or(&name);
    patch.with_file_name(format!("{stem}{REVERT_ARCHIVE_SUFFIX}"))
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct BuildSummary {
    pub files_changed: usize,
    pub files_new: usize,
    pub full_deltas: usize,
    pub chunked_files: usize,
    pub chunk_entries: usize,
    pub external_deltas: usize,
    pub verbatim_files: usize,
    pub skipped_files: usize,
    pub archive_bytes: u64,
}

#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct ApplySummary {
    pub full_deltas: usize,
    pub chunked_files: usize,
    pub external_deltas: usize,
    pub files_written: usize,
    pub bytes_processed: u64,
    pub reverse_archive: Option<PathBuf>,
}
