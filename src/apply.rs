use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, File};
use std::io::{self, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use rayon::prelude::*;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::archive::{ArchiveEntry, ArchiveWriter, PatchArchive, ZipReader};
use crate::config::Config;
use crate::delta::{self, ExternalTool};
use crate::error::{IoResultExt, PatchError, Phase, Result};
use crate::patch_format::{
    revert_archive_path, ApplySummary, ChunkHeader, EntryKind, PatchEntry, VerbatimSource,
    TAG_LEN,
};
use crate::strategy;
use crate::util::{self, CancelToken};

/// Prefix of the per-run staging directory created inside the target root.
pub const STAGING_PREFIX: &str = ".deltapack-staging";

/// Enough leading bytes of a chunk entry to hold its tag and header.
const CHUNK_HEAD_LEN: u64 = TAG_LEN as u64 + 64;

/// All entries that produce one destination file.
#[derive(Debug)]
enum UnitKind {
    Full(ArchiveEntry),
    Chunked {
        header: ChunkHeader,
        /// Sorted by index, `0..header.total` without gaps.
        parts: Vec<ArchiveEntry>,
    },
    External(ArchiveEntry),
    Verbatim(ArchiveEntry),
}

#[derive(Debug)]
struct Unit {
    rel: String,
    dest: PathBuf,
    kind: UnitKind,
}

/// A fully decoded file waiting in the staging directory.
struct Staged {
    rel: String,
    staged: PathBuf,
    dest: PathBuf,
    permissions: Option<fs::Permissions>,
}

struct ApplyContext<'a> {
    archive: &'a PatchArchive,
    staging: &'a Path,
    tool: ExternalTool,
    reverse: Option<&'a ArchiveWriter>,
    cancel: &'a CancelToken,
}

/// Whether every delta entry of `archive` finds its base file under `target`.
pub fn validate_patch(archive: &Path, target: &Path) -> Result<bool> {
    Ok(missing_base_files(archive, target)?.is_empty())
}

/// Delta entries whose base file does not exist under `target`, sorted.
pub fn missing_base_files(archive: &Path, target: &Path) -> Result<Vec<String>> {
    let patch = PatchArchive::open(archive)?;
    let mut zip = patch.reader()?;
    let entries = patch.entries(&mut zip)?;
    Ok(missing_bases(&entries, target))
}

fn missing_bases(entries: &[ArchiveEntry], target: &Path) -> Vec<String> {
    let missing: BTreeSet<&str> = entries
        .iter()
        .filter(|e| e.kind.needs_base())
        .map(|e| e.kind.path())
        .filter(|rel| !util::resolve_under(target, rel).is_some_and(|p| p.is_file()))
        .collect();
    missing.into_iter().map(str::to_string).collect()
}

/// Apply `archive` to the tree at `target_dir`.
///
/// Nothing in the tree is touched unless validation passes and every entry decoded
/// into the staging directory; staged files are then renamed over their destinations.
/// With `make_backup` the reverse archive is written next to `archive` before that.
pub async fn apply_patch(
    archive: &Path,
    target_dir: &Path,
    config: &Config,
    cancel: &CancelToken,
) -> Result<ApplySummary> {
    config.validate()?;

    let target = target_dir.canonicalize().at(Phase::Apply, target_dir)?;
    let archive = archive.to_path_buf();
    let config = config.clone();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || apply_blocking(&archive, &target, &config, &cancel))
        .await?
}

fn apply_blocking(
    archive_path: &Path,
    target: &Path,
    config: &Config,
    cancel: &CancelToken,
) -> Result<ApplySummary> {
    let archive = PatchArchive::open(archive_path)?;
    let mut zip = archive.reader()?;
    let entries = archive.entries(&mut zip)?;

    let missing = missing_bases(&entries, target);
    if !missing.is_empty() {
        return Err(PatchError::Validation {
            archive: archive_path.to_path_buf(),
            target: target.to_path_buf(),
            missing,
        });
    }

    let bytes_processed: u64 = entries.iter().map(|e| e.size).sum();
    let units = plan_units(&archive, &mut zip, entries, target)?;
    info!(
        archive = %archive_path.display(),
        target = %target.display(),
        files = units.len(),
        "patch validated"
    );
    cancel.check()?;

    let mut summary = ApplySummary {
        bytes_processed,
        ..ApplySummary::default()
    };
    if units.is_empty() {
        return Ok(summary);
    }

    let staging = tempfile::Builder::new()
        .prefix(STAGING_PREFIX)
        .tempdir_in(target)
        .at(Phase::Apply, target)?;
    let reverse = if config.make_backup {
        Some(ArchiveWriter::create(
            &revert_archive_path(archive_path),
            Phase::Backup,
        )?)
    } else {
        None
    };

    if let Some(writer) = &reverse {
        back_up_displaced(target, &units, writer)?;
    }

    let ctx = ApplyContext {
        archive: &archive,
        staging: staging.path(),
        tool: ExternalTool::from_config(config),
        reverse: reverse.as_ref(),
        cancel,
    };

    let pool = config.worker_pool()?;
    let staged: Vec<Staged> = pool.install(|| {
        units
            .par_iter()
            .enumerate()
            .map_init(
                || zip.clone(),
                |zip, (slot, unit)| {
                    cancel.check()?;
                    stage_unit(&ctx, zip, slot, unit)
                },
            )
            .collect::<Result<_>>()
    })?;
    cancel.check()?;

    if let Some(writer) = &reverse {
        let bytes = writer.finish()?;
        info!(
            path = %writer.path().display(),
            entries = writer.entry_count(),
            bytes,
            "reverse archive written"
        );
        summary.reverse_archive = Some(writer.path().to_path_buf());
    }

    for file in &staged {
        commit(target, file)?;
    }
    drop(staging);

    for unit in &units {
        match unit.kind {
            UnitKind::Full(_) => summary.full_deltas += 1,
            UnitKind::Chunked { .. } => summary.chunked_files += 1,
            UnitKind::External(_) => summary.external_deltas += 1,
            UnitKind::Verbatim(_) => {}
        }
    }
    summary.files_written = staged.len();
    info!(
        files = summary.files_written,
        bytes = summary.bytes_processed,
        "patch applied"
    );
    Ok(summary)
}

/// Group entries per destination and reject archives that cannot be applied as a whole.
fn plan_units(
    archive: &PatchArchive,
    zip: &mut ZipReader<'_>,
    entries: Vec<ArchiveEntry>,
    target: &Path,
) -> Result<Vec<Unit>> {
    let mut singles: BTreeMap<String, UnitKind> = BTreeMap::new();
    let mut chunks: BTreeMap<String, Vec<(ChunkHeader, ArchiveEntry)>> = BTreeMap::new();

    for entry in entries {
        let rel = entry.kind.path().to_string();
        if util::resolve_under(target, &rel).is_none() {
            return Err(PatchError::corrupt(
                Phase::Validate,
                entry.name.as_str(),
                "entry path is absolute or leaves the target directory",
            ));
        }
        let kind = match entry.kind {
            EntryKind::Chunk { index, .. } => {
                let head = archive.read_prefix(zip, &entry, CHUNK_HEAD_LEN)?;
                let (header, _) = delta::decode_chunk(&head)
                    .map_err(|e| PatchError::corrupt(Phase::Validate, entry.name.as_str(), e))?;
                if header.index != index {
                    return Err(PatchError::corrupt(
                        Phase::Validate,
                        entry.name.as_str(),
                        format!("entry name says part {index}, header says {}", header.index),
                    ));
                }
                chunks.entry(rel).or_default().push((header, entry));
                continue;
            }
            EntryKind::Full { .. } => UnitKind::Full(entry),
            EntryKind::External { .. } => UnitKind::External(entry),
            EntryKind::Verbatim { .. } => UnitKind::Verbatim(entry),
        };
        if singles.insert(rel.clone(), kind).is_some() {
            return Err(duplicate_path(&rel));
        }
    }

    let mut units = Vec::with_capacity(singles.len() + chunks.len());
    for (rel, mut parts) in chunks {
        if singles.contains_key(&rel) {
            return Err(duplicate_path(&rel));
        }
        parts.sort_by_key(|(h, _)| h.index);
        let header = parts[0].0;
        let consistent = parts.iter().all(|(h, _)| {
            h.total == header.total
                && h.chunk_size == header.chunk_size
                && h.target_len == header.target_len
        });
        if !consistent {
            return Err(PatchError::corrupt(
                Phase::Validate,
                rel,
                "chunks disagree on total count, chunk size or file length",
            ));
        }
        let contiguous = parts.len() as u64 == u64::from(header.total)
            && parts.iter().enumerate().all(|(i, (h, _))| h.index as usize == i)
            && strategy::chunk_count(header.target_len, header.chunk_size)
                == u64::from(header.total);
        if !contiguous {
            return Err(PatchError::corrupt(
                Phase::Validate,
                rel,
                format!(
                    "expected chunks 0..{} but the archive holds {} of them",
                    header.total,
                    parts.len()
                ),
            ));
        }
        let dest = target.join(&rel);
        units.push(Unit {
            rel,
            dest,
            kind: UnitKind::Chunked {
                header,
                parts: parts.into_iter().map(|(_, e)| e).collect(),
            },
        });
    }
    for (rel, kind) in singles {
        let dest = target.join(&rel);
        units.push(Unit { rel, dest, kind });
    }
    Ok(units)
}

fn duplicate_path(rel: &str) -> PatchError {
    PatchError::corrupt(Phase::Validate, rel, "more than one entry targets this path")
}

/// Decode one unit into the staging directory, adding its reverse entries on the way.
fn stage_unit(
    ctx: &ApplyContext<'_>,
    zip: &mut ZipReader<'_>,
    slot: usize,
    unit: &Unit,
) -> Result<Staged> {
    let staged = ctx.staging.join(slot.to_string());
    let rel = unit.rel.as_str();
    let dest = unit.dest.as_path();
    debug!(path = %rel, "staging");

    match &unit.kind {
        UnitKind::Full(entry) => {
            let delta_bytes = ctx.archive.read_entry(zip, entry)?;
            let new = {
                let old = util::map_file(dest).at(Phase::Apply, dest)?;
                let new = delta::decode(&old, &delta_bytes)
                    .map_err(|e| e.for_file(Phase::Apply, rel, dest))?;
                if let Some(reverse) = ctx.reverse {
                    let back =
                        delta::encode(&new, &old).map_err(|e| e.for_file(Phase::Backup, rel, dest))?;
                    reverse.write_entry(&PatchEntry::FullDelta {
                        relative_path: rel.to_string(),
                        delta_bytes: back,
                    })?;
                }
                new
            };
            fs::write(&staged, &new).at(Phase::Apply, &staged)?;
        }
        UnitKind::Chunked { header, parts } => {
            stage_chunks(ctx, zip, unit, header, parts, &staged)?;
        }
        UnitKind::External(entry) => {
            let delta_bytes = ctx.archive.read_entry(zip, entry)?;
            delta::decode_external(&ctx.tool, dest, &delta_bytes, &staged)
                .map_err(|e| e.for_file(Phase::Apply, rel, dest))?;
            if let Some(reverse) = ctx.reverse {
                let back = delta::encode_external(&ctx.tool, &staged, dest)
                    .map_err(|e| e.for_file(Phase::Backup, rel, dest))?;
                reverse.write_entry(&PatchEntry::ExternalDelta {
                    relative_path: rel.to_string(),
                    delta_bytes: back,
                })?;
            }
        }
        UnitKind::Verbatim(entry) => {
            if let Some(reverse) = ctx.reverse {
                match fs::metadata(dest) {
                    Ok(meta) if meta.is_file() => {
                        reverse.write_entry(&PatchEntry::VerbatimFile {
                            relative_path: rel.to_string(),
                            source: VerbatimSource::File(dest.to_path_buf()),
                        })?;
                    }
                    // Files under a replaced directory were saved by back_up_displaced.
                    Ok(_) => {}
                    Err(_) => warn!(
                        path = %rel,
                        "patch creates a new file; the reverse archive cannot remove it"
                    ),
                }
            }
            let mut out = File::create(&staged).at(Phase::Apply, &staged)?;
            ctx.archive.copy_entry(zip, entry, &mut out)?;
            out.flush().at(Phase::Apply, &staged)?;
        }
    }

    let permissions = fs::metadata(dest)
        .ok()
        .filter(|m| m.is_file())
        .map(|m| m.permissions());
    Ok(Staged {
        rel: unit.rel.clone(),
        staged,
        dest: unit.dest.clone(),
        permissions,
    })
}

/// Save base files that committing `units` removes without replacing them in place:
/// regular files standing where a parent directory has to go, and the files beneath
/// a directory that a new file replaces.
///
/// Delta units always find their base file at `dest`, so only verbatim units can
/// displace anything.
fn back_up_displaced(target: &Path, units: &[Unit], reverse: &ArchiveWriter) -> Result<()> {
    let mut saved: BTreeSet<String> = BTreeSet::new();

    for unit in units {
        if !matches!(unit.kind, UnitKind::Verbatim(_)) {
            continue;
        }

        let mut cursor = target.to_path_buf();
        let mut ancestor = String::new();
        let parents = Path::new(&unit.rel).parent().into_iter().flat_map(Path::components);
        for component in parents {
            cursor.push(component);
            let name = component.as_os_str().to_string_lossy();
            ancestor = util::join_relative(&ancestor, &name);
            if fs::metadata(&cursor).is_ok_and(|m| m.is_file()) && saved.insert(ancestor.clone()) {
                debug!(path = %ancestor, "saving file displaced by a directory");
                reverse.write_entry(&PatchEntry::VerbatimFile {
                    relative_path: ancestor.clone(),
                    source: VerbatimSource::File(cursor.clone()),
                })?;
            }
        }

        if !fs::symlink_metadata(&unit.dest).is_ok_and(|m| m.is_dir()) {
            continue;
        }
        let mut files = 0usize;
        for item in WalkDir::new(&unit.dest).min_depth(1) {
            let item = item
                .map_err(io::Error::from)
                .at(Phase::Backup, &unit.dest)?;
            if !item.file_type().is_file() {
                continue;
            }
            let sub = item
                .path()
                .strip_prefix(&unit.dest)
                .map_err(|e| io::Error::new(io::ErrorKind::InvalidData, e.to_string()))
                .and_then(util::to_relative_string)
                .at(Phase::Backup, item.path())?;
            let rel = util::join_relative(&unit.rel, &sub);
            if saved.insert(rel.clone()) {
                reverse.write_entry(&PatchEntry::VerbatimFile {
                    relative_path: rel,
                    source: VerbatimSource::File(item.path().to_path_buf()),
                })?;
                files += 1;
            }
        }
        debug!(path = %unit.rel, files, "saving directory replaced by a file");
        if files == 0 {
            warn!(
                path = %unit.rel,
                "patch replaces a directory without files; reverting will not recreate it"
            );
        }
    }
    Ok(())
}

/// Rebuild a split file chunk by chunk into a preallocated staging file.
///
/// Chunk `i` decodes against base bytes `[i*cs, (i+1)*cs)`; reverse chunks are cut
/// from the base length so they rebuild the old file from the new one the same way.
fn stage_chunks(
    ctx: &ApplyContext<'_>,
    zip: &mut ZipReader<'_>,
    unit: &Unit,
    header: &ChunkHeader,
    parts: &[ArchiveEntry],
    staged: &Path,
) -> Result<()> {
    let rel = unit.rel.as_str();
    let dest = unit.dest.as_path();
    let cs = header.chunk_size;

    let mut base = File::open(dest).at(Phase::Apply, dest)?;
    let base_len = base.metadata().at(Phase::Apply, dest)?.len();
    let reverse_total = strategy::chunk_count(base_len, cs);
    let reverse_total = match ctx.reverse {
        Some(_) => Some(u32::try_from(reverse_total).map_err(|_| {
            PatchError::corrupt(Phase::Backup, rel, "base file has too many chunks to reverse")
        })?),
        None => None,
    };

    let mut out = File::create(staged).at(Phase::Apply, staged)?;
    out.set_len(header.target_len).at(Phase::Apply, staged)?;

    for part in parts {
        ctx.cancel.check()?;
        let data = ctx.archive.read_entry(zip, part)?;
        let (chunk, inner) = delta::decode_chunk(&data)
            .map_err(|e| PatchError::corrupt(Phase::Apply, part.name.as_str(), e))?;
        let offset = chunk.offset();

        let old = read_at(&mut base, offset, cs).at(Phase::Apply, dest)?;
        let new = delta::decode(&old, inner).map_err(|e| e.for_file(Phase::Apply, rel, dest))?;
        let expected = cs.min(header.target_len.saturating_sub(offset));
        if new.len() as u64 != expected {
            return Err(PatchError::corrupt(
                Phase::Apply,
                part.name.as_str(),
                format!("chunk rebuilt to {} bytes, expected {expected}", new.len()),
            ));
        }
        out.seek(SeekFrom::Start(offset)).at(Phase::Apply, staged)?;
        out.write_all(&new).at(Phase::Apply, staged)?;

        if let (Some(reverse), Some(total)) = (ctx.reverse, reverse_total) {
            if chunk.index < total {
                let back = ChunkHeader {
                    index: chunk.index,
                    total,
                    chunk_size: cs,
                    target_len: base_len,
                };
                write_reverse_chunk(reverse, rel, back, &new, &old)?;
            }
        }
    }

    // Base longer than the target: the tail chunks rebuild from nothing.
    if let (Some(reverse), Some(total)) = (ctx.reverse, reverse_total) {
        for index in header.total..total {
            ctx.cancel.check()?;
            let back = ChunkHeader {
                index,
                total,
                chunk_size: cs,
                target_len: base_len,
            };
            let old = read_at(&mut base, back.offset(), cs).at(Phase::Apply, dest)?;
            write_reverse_chunk(reverse, rel, back, &[], &old)?;
        }
    }

    out.flush().at(Phase::Apply, staged)?;
    Ok(())
}

fn read_at(file: &mut File, offset: u64, limit: u64) -> io::Result<Vec<u8>> {
    file.seek(SeekFrom::Start(offset))?;
    util::read_chunk(file, limit)
}

/// Reverse chunk: rebuilds the old bytes of one chunk from the new ones.
fn write_reverse_chunk(
    reverse: &ArchiveWriter,
    rel: &str,
    header: ChunkHeader,
    new: &[u8],
    old: &[u8],
) -> Result<()> {
    let delta_bytes =
        delta::encode(new, old).map_err(|e| PatchError::corrupt(Phase::Backup, rel, e))?;
    reverse.write_entry(&PatchEntry::ChunkedDelta {
        relative_path: rel.to_string(),
        header,
        delta_bytes,
    })?;
    Ok(())
}

/// Move one staged file over its destination, replacing whatever is in the way.
fn commit(target: &Path, file: &Staged) -> Result<()> {
    let dest = file.dest.as_path();

    // A file where a parent directory should be is replaced by that directory.
    if let Some(parent) = dest.parent() {
        let mut cursor = target.to_path_buf();
        if let Ok(rest) = parent.strip_prefix(target) {
            for component in rest.components() {
                cursor.push(component);
                if fs::metadata(&cursor).is_ok_and(|m| !m.is_dir()) {
                    debug!(path = %cursor.display(), "removing file in the way of a directory");
                    fs::remove_file(&cursor).at(Phase::Apply, &cursor)?;
                }
            }
        }
        fs::create_dir_all(parent).at(Phase::Apply, parent)?;
    }

    if fs::symlink_metadata(dest).is_ok_and(|m| m.is_dir()) {
        debug!(path = %file.rel, "removing directory in the way of a file");
        fs::remove_dir_all(dest).at(Phase::Apply, dest)?;
    }

    if let Some(permissions) = &file.permissions {
        fs::set_permissions(&file.staged, permissions.clone()).at(Phase::Apply, &file.staged)?;
    }
    fs::rename(&file.staged, dest).at(Phase::Apply, dest)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{LargeFileStrategy, MIB};
    use crate::create::create_patch;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        fs::create_dir_all(path.parent().unwrap()).unwrap();
        fs::write(path, data).unwrap();
    }

    fn archive_with(dir: &Path, entries: Vec<PatchEntry>) -> PathBuf {
        let path = dir.join("manual_patch.zip");
        let writer = ArchiveWriter::create(&path, Phase::Build).unwrap();
        for entry in &entries {
            writer.write_entry(entry).unwrap();
        }
        writer.finish().unwrap();
        path
    }

    fn staging_dirs(target: &Path) -> usize {
        fs::read_dir(target)
            .unwrap()
            .filter(|e| {
                e.as_ref()
                    .unwrap()
                    .file_name()
                    .to_string_lossy()
                    .starts_with(STAGING_PREFIX)
            })
            .count()
    }

    fn chunk_entry(header: ChunkHeader, old: &[u8], new: &[u8]) -> PatchEntry {
        PatchEntry::ChunkedDelta {
            relative_path: "big.bin".into(),
            header,
            delta_bytes: delta::encode(old, new).unwrap(),
        }
    }

    fn part(index: u32, total: u32, target_len: u64) -> ChunkHeader {
        ChunkHeader {
            index,
            total,
            chunk_size: 10,
            target_len,
        }
    }

    #[test]
    fn test_validate_reports_missing_bases() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write(target.path(), "present.txt", b"here");

        let archive = archive_with(
            work.path(),
            vec![
                PatchEntry::FullDelta {
                    relative_path: "present.txt".into(),
                    delta_bytes: delta::encode(b"here", b"there").unwrap(),
                },
                PatchEntry::FullDelta {
                    relative_path: "gone/missing.txt".into(),
                    delta_bytes: delta::encode(b"a", b"b").unwrap(),
                },
                PatchEntry::VerbatimFile {
                    relative_path: "brand_new.txt".into(),
                    source: VerbatimSource::Bytes(b"new".to_vec()),
                },
            ],
        );

        assert!(!validate_patch(&archive, target.path()).unwrap());
        assert_eq!(
            missing_base_files(&archive, target.path()).unwrap(),
            vec!["gone/missing.txt"]
        );

        write(target.path(), "gone/missing.txt", b"a");
        assert!(validate_patch(&archive, target.path()).unwrap());
    }

    #[tokio::test]
    async fn test_corrupt_entry_leaves_tree_untouched() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write(target.path(), "a.txt", b"actual content");

        let archive = archive_with(
            work.path(),
            vec![
                PatchEntry::FullDelta {
                    relative_path: "a.txt".into(),
                    delta_bytes: delta::encode(b"other base", b"other target").unwrap(),
                },
                PatchEntry::VerbatimFile {
                    relative_path: "c.txt".into(),
                    source: VerbatimSource::Bytes(b"new".to_vec()),
                },
            ],
        );

        let config = Config {
            make_backup: true,
            ..Config::default()
        };
        let err = apply_patch(&archive, target.path(), &config, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::CorruptPatch { phase: Phase::Apply, .. }));

        assert_eq!(fs::read(target.path().join("a.txt")).unwrap(), b"actual content");
        assert!(!target.path().join("c.txt").exists());
        assert_eq!(staging_dirs(target.path()), 0);
        assert!(!revert_archive_path(&archive).exists());
    }

    #[tokio::test]
    async fn test_chunks_written_out_of_order() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let old: Vec<u8> = (0..25u8).collect();
        let mut new = old.clone();
        new[3] = 200;
        new[21] = 201;
        write(target.path(), "big.bin", &old);

        // Written last chunk first.
        let entries = (0..3u32)
            .rev()
            .map(|i| {
                let lo = i as usize * 10;
                let hi = (lo + 10).min(25);
                chunk_entry(part(i, 3, 25), &old[lo..hi], &new[lo..hi])
            })
            .collect();
        let archive = archive_with(work.path(), entries);

        let summary = apply_patch(&archive, target.path(), &Config::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.chunked_files, 1);
        assert_eq!(summary.files_written, 1);
        assert_eq!(fs::read(target.path().join("big.bin")).unwrap(), new);
    }

    #[tokio::test]
    async fn test_gap_in_chunks_is_corrupt() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write(target.path(), "big.bin", &[1u8; 30]);

        let archive = archive_with(
            work.path(),
            vec![
                chunk_entry(part(0, 3, 30), &[1u8; 10], &[2u8; 10]),
                chunk_entry(part(2, 3, 30), &[1u8; 10], &[2u8; 10]),
            ],
        );

        let err = apply_patch(&archive, target.path(), &Config::default(), &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::CorruptPatch { phase: Phase::Validate, .. }));
        assert_eq!(fs::read(target.path().join("big.bin")).unwrap(), vec![1u8; 30]);
    }

    #[tokio::test]
    async fn test_chunks_disagreeing_on_total_are_corrupt() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write(target.path(), "big.bin", &[1u8; 20]);

        let archive = archive_with(
            work.path(),
            vec![
                chunk_entry(part(0, 2, 20), &[1u8; 10], &[2u8; 10]),
                chunk_entry(part(1, 3, 20), &[1u8; 10], &[2u8; 10]),
            ],
        );

        assert!(matches!(
            apply_patch(&archive, target.path(), &Config::default(), &CancelToken::new()).await,
            Err(PatchError::CorruptPatch { .. })
        ));
    }

    #[tokio::test]
    async fn test_escaping_entry_rejected() {
        let work = tempfile::tempdir().unwrap();
        let root = tempfile::tempdir().unwrap();
        let target = root.path().join("tree");
        fs::create_dir(&target).unwrap();

        let archive = archive_with(
            work.path(),
            vec![PatchEntry::VerbatimFile {
                relative_path: "../evil.txt".into(),
                source: VerbatimSource::Bytes(b"x".to_vec()),
            }],
        );

        assert!(matches!(
            apply_patch(&archive, &target, &Config::default(), &CancelToken::new()).await,
            Err(PatchError::CorruptPatch { .. })
        ));
        assert!(!root.path().join("evil.txt").exists());
    }

    #[tokio::test]
    async fn test_verbatim_replaces_directories_and_files() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        write(target.path(), "x/inner.txt", b"dir in the way");
        write(target.path(), "y", b"file in the way");

        let archive = archive_with(
            work.path(),
            vec![
                PatchEntry::VerbatimFile {
                    relative_path: "x".into(),
                    source: VerbatimSource::Bytes(b"now a file".to_vec()),
                },
                PatchEntry::VerbatimFile {
                    relative_path: "y/inner.txt".into(),
                    source: VerbatimSource::Bytes(b"now in a dir".to_vec()),
                },
            ],
        );

        let summary = apply_patch(&archive, target.path(), &Config::default(), &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.files_written, 2);
        assert_eq!(fs::read(target.path().join("x")).unwrap(), b"now a file");
        assert_eq!(
            fs::read(target.path().join("y/inner.txt")).unwrap(),
            b"now in a dir"
        );
        assert_eq!(staging_dirs(target.path()), 0);
    }

    #[tokio::test]
    async fn test_cancelled_apply_writes_nothing() {
        let work = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let archive = archive_with(
            work.path(),
            vec![PatchEntry::VerbatimFile {
                relative_path: "c.txt".into(),
                source: VerbatimSource::Bytes(b"new".to_vec()),
            }],
        );

        let cancel = CancelToken::new();
        cancel.cancel();
        assert!(matches!(
            apply_patch(&archive, target.path(), &Config::default(), &cancel).await,
            Err(PatchError::Cancelled)
        ));
        assert!(!target.path().join("c.txt").exists());
    }

    #[tokio::test]
    async fn test_reverse_of_split_file_with_shrinking_target() {
        let work = tempfile::tempdir().unwrap();
        let base = tempfile::tempdir().unwrap();
        let target = tempfile::tempdir().unwrap();
        let applied = tempfile::tempdir().unwrap();

        let old: Vec<u8> = (0..(2 * MIB + 100)).map(|i| (i % 241) as u8).collect();
        let new = old[..(MIB as usize + 5)].to_vec();
        write(base.path(), "big.bin", &old);
        write(applied.path(), "big.bin", &old);
        write(target.path(), "big.bin", &new);

        let config = Config {
            large_file_strategy: LargeFileStrategy::Split,
            large_file_threshold_mb: 0,
            split_chunk_size_mb: 1,
            shallow_compare: false,
            make_backup: true,
            ..Config::default()
        };
        let patch = work.path().join("shrink_patch.zip");
        let cancel = CancelToken::new();
        create_patch(base.path(), target.path(), &patch, &config, &cancel)
            .await
            .unwrap();

        let summary = apply_patch(&patch, applied.path(), &config, &cancel).await.unwrap();
        assert_eq!(fs::read(applied.path().join("big.bin")).unwrap(), new);
        let reverse = summary.reverse_archive.unwrap();
        assert_eq!(reverse, work.path().join("shrink_revertpatch.zip"));

        let no_backup = Config {
            make_backup: false,
            ..config
        };
        apply_patch(&reverse, applied.path(), &no_backup, &cancel)
            .await
            .unwrap();
        assert_eq!(fs::read(applied.path().join("big.bin")).unwrap(), old);
    }

    /// Apply the `base` -> `target` patch with a backup to a copy of `base`, check
    /// the result, then apply the reverse archive and return the reverted tree.
    async fn apply_then_revert(
        base: &[(&str, &str)],
        target: &[(&str, &str)],
    ) -> tempfile::TempDir {
        let work = tempfile::tempdir().unwrap();
        let base_dir = tempfile::tempdir().unwrap();
        let target_dir = tempfile::tempdir().unwrap();
        let applied = tempfile::tempdir().unwrap();
        for (rel, data) in base {
            write(base_dir.path(), rel, data.as_bytes());
            write(applied.path(), rel, data.as_bytes());
        }
        for (rel, data) in target {
            write(target_dir.path(), rel, data.as_bytes());
        }

        let config = Config {
            shallow_compare: false,
            make_backup: true,
            ..Config::default()
        };
        let cancel = CancelToken::new();
        let patch = work.path().join("retype_patch.zip");
        create_patch(base_dir.path(), target_dir.path(), &patch, &config, &cancel)
            .await
            .unwrap();

        let summary = apply_patch(&patch, applied.path(), &config, &cancel)
            .await
            .unwrap();
        for (rel, data) in target {
            assert_eq!(fs::read_to_string(applied.path().join(rel)).unwrap(), *data, "{rel}");
        }

        let no_backup = Config {
            make_backup: false,
            ..config
        };
        apply_patch(&summary.reverse_archive.unwrap(), applied.path(), &no_backup, &cancel)
            .await
            .unwrap();
        applied
    }

    #[tokio::test]
    async fn test_reverse_restores_file_displaced_by_directory() {
        let applied = apply_then_revert(
            &[("keep.txt", "keep"), ("y", "important base file")],
            &[("keep.txt", "keep"), ("y/inner.txt", "inner")],
        )
        .await;

        let y = applied.path().join("y");
        assert!(y.is_file());
        assert_eq!(fs::read(&y).unwrap(), b"important base file");
        assert_eq!(fs::read(applied.path().join("keep.txt")).unwrap(), b"keep");
    }

    #[tokio::test]
    async fn test_reverse_restores_nested_file_displaced_by_directory() {
        let applied = apply_then_revert(
            &[("a/b", "was a file")],
            &[("a/b/c/d.txt", "deep"), ("a/b/e.txt", "sibling")],
        )
        .await;

        assert_eq!(fs::read(applied.path().join("a/b")).unwrap(), b"was a file");
    }

    #[tokio::test]
    async fn test_reverse_restores_directory_replaced_by_file() {
        let applied = apply_then_revert(
            &[("d/a.txt", "first"), ("d/sub/b.txt", "second")],
            &[("d", "now a file")],
        )
        .await;

        assert!(applied.path().join("d").is_dir());
        assert_eq!(fs::read(applied.path().join("d/a.txt")).unwrap(), b"first");
        assert_eq!(fs::read(applied.path().join("d/sub/b.txt")).unwrap(), b"second");
    }
}
