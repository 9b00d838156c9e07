use std::path::Path;

use rayon::prelude::*;
use tracing::{debug, info};

use crate::archive::ArchiveWriter;
use crate::config::Config;
use crate::delta::{self, ExternalTool};
use crate::error::{IoResultExt, PatchError, Phase, Result};
use crate::patch_format::{BuildSummary, ChunkHeader, PatchEntry, VerbatimSource};
use crate::strategy::{self, FilePlan, Selector};
use crate::tree_diff::{self, DiffOptions};
use crate::util::{self, CancelToken};

/// What happened to one changed file.
enum Packaged {
    Full,
    Chunked(usize),
    External,
    Verbatim,
    Skipped,
}

/// Shared, read-only inputs of the per-file workers.
struct BuildContext<'a> {
    base_root: &'a Path,
    target_root: &'a Path,
    selector: Selector,
    tool: ExternalTool,
    writer: &'a ArchiveWriter,
    cancel: &'a CancelToken,
}

/// Build a patch archive at `output` that turns `base_dir` into `target_dir`.
///
/// The tree comparison and every per-file delta run on the worker pool inside
/// `spawn_blocking`; the archive is only moved to `output` when everything succeeded.
pub async fn create_patch(
    base_dir: &Path,
    target_dir: &Path,
    output: &Path,
    config: &Config,
    cancel: &CancelToken,
) -> Result<BuildSummary> {
    config.validate()?;

    let base = base_dir.canonicalize().at(Phase::Build, base_dir)?;
    let target = target_dir.canonicalize().at(Phase::Build, target_dir)?;
    let output = output.to_path_buf();
    let config = config.clone();
    let cancel = cancel.clone();

    tokio::task::spawn_blocking(move || build_blocking(&base, &target, &output, &config, &cancel))
        .await?
}

fn build_blocking(
    base: &Path,
    target: &Path,
    output: &Path,
    config: &Config,
    cancel: &CancelToken,
) -> Result<BuildSummary> {
    let pool = config.worker_pool()?;
    pool.install(|| {
        info!(base = %base.display(), target = %target.display(), "comparing trees");
        let diff = tree_diff::diff_trees(
            base,
            target,
            DiffOptions {
                shallow: config.shallow_compare,
            },
        )?;
        info!(
            changed = diff.changed.len(),
            new = diff.new.len(),
            "tree comparison finished"
        );
        if diff.is_empty() {
            info!("trees are identical, writing an empty patch");
        }
        cancel.check()?;

        let writer = ArchiveWriter::create(output, Phase::Build)?;
        let ctx = BuildContext {
            base_root: base,
            target_root: target,
            selector: Selector::new(config),
            tool: ExternalTool::from_config(config),
            writer: &writer,
            cancel,
        };

        // Fail-fast: the first error wins, the others are discarded with the archive.
        let changed: Vec<Packaged> = diff
            .changed
            .par_iter()
            .map(|rel| {
                cancel.check()?;
                package_changed(&ctx, rel)
            })
            .collect::<Result<_>>()?;

        diff.new.par_iter().try_for_each(|rel| -> Result<()> {
            cancel.check()?;
            let path = target.join(rel);
            debug!(path = %rel, "embedding new file");
            writer.write_entry(&PatchEntry::VerbatimFile {
                relative_path: rel.clone(),
                source: VerbatimSource::File(path),
            })?;
            Ok(())
        })?;

        cancel.check()?;

        let mut summary = BuildSummary {
            files_changed: diff.changed.len(),
            files_new: diff.new.len(),
            verbatim_files: diff.new.len(),
            ..BuildSummary::default()
        };
        for outcome in changed {
            match outcome {
                Packaged::Full => summary.full_deltas += 1,
                Packaged::Chunked(parts) => {
                    summary.chunked_files += 1;
                    summary.chunk_entries += parts;
                }
                Packaged::External => summary.external_deltas += 1,
                Packaged::Verbatim => summary.verbatim_files += 1,
                Packaged::Skipped => summary.skipped_files += 1,
            }
        }

        summary.archive_bytes = writer.finish()?;
        info!(
            output = %output.display(),
            entries = summary.full_deltas + summary.chunk_entries + summary.external_deltas + summary.verbatim_files,
            bytes = summary.archive_bytes,
            "patch archive written"
        );
        Ok(summary)
    })
}

fn package_changed(ctx: &BuildContext<'_>, rel: &str) -> Result<Packaged> {
    let base_path = ctx.base_root.join(rel);
    let target_path = ctx.target_root.join(rel);
    let base_len = std::fs::metadata(&base_path).at(Phase::Build, &base_path)?.len();
    let target_len = std::fs::metadata(&target_path).at(Phase::Build, &target_path)?.len();

    let plan = ctx.selector.plan(base_len, target_len);
    debug!(path = %rel, base_len, target_len, ?plan, "packaging changed file");

    match plan {
        FilePlan::Delta => {
            let delta_bytes = {
                let old = util::map_file(&base_path).at(Phase::Build, &base_path)?;
                let new = util::map_file(&target_path).at(Phase::Build, &target_path)?;
                delta::encode(&old, &new).map_err(|e| e.for_file(Phase::Build, rel, &target_path))?
            };
            ctx.writer.write_entry(&PatchEntry::FullDelta {
                relative_path: rel.to_string(),
                delta_bytes,
            })?;
            Ok(Packaged::Full)
        }
        FilePlan::Split { chunk_size } => {
            let parts = package_split(ctx, rel, &base_path, &target_path, target_len, chunk_size)?;
            Ok(Packaged::Chunked(parts))
        }
        FilePlan::External => {
            let delta_bytes = delta::encode_external(&ctx.tool, &base_path, &target_path)
                .map_err(|e| e.for_file(Phase::Build, rel, &target_path))?;
            ctx.writer.write_entry(&PatchEntry::ExternalDelta {
                relative_path: rel.to_string(),
                delta_bytes,
            })?;
            Ok(Packaged::External)
        }
        FilePlan::Verbatim => {
            ctx.writer.write_entry(&PatchEntry::VerbatimFile {
                relative_path: rel.to_string(),
                source: VerbatimSource::File(target_path),
            })?;
            Ok(Packaged::Verbatim)
        }
        FilePlan::Skip => {
            debug!(path = %rel, "large file skipped");
            Ok(Packaged::Skipped)
        }
    }
}

/// Chunk both files sequentially and write one delta per chunk pair.
///
/// Chunk `i` of the target is encoded against base bytes `[i*cs, (i+1)*cs)`, which is
/// empty once the base is exhausted; base bytes past the target's last chunk are
/// not needed to rebuild the target.
fn package_split(
    ctx: &BuildContext<'_>,
    rel: &str,
    base_path: &Path,
    target_path: &Path,
    target_len: u64,
    chunk_size: u64,
) -> Result<usize> {
    let total = strategy::chunk_count(target_len, chunk_size);
    let total = u32::try_from(total).map_err(|_| {
        PatchError::Config(format!(
            "{rel}: {total} chunks exceed the chunk index range; raise split_chunk_size_mb"
        ))
    })?;

    let mut base = open_buffered(base_path)?;
    let mut target = open_buffered(target_path)?;

    for index in 0..total {
        ctx.cancel.check()?;
        let old = util::read_chunk(&mut base, chunk_size).at(Phase::Build, base_path)?;
        let new = util::read_chunk(&mut target, chunk_size).at(Phase::Build, target_path)?;
        let delta_bytes =
            delta::encode(&old, &new).map_err(|e| e.for_file(Phase::Build, rel, target_path))?;
        ctx.writer.write_entry(&PatchEntry::ChunkedDelta {
            relative_path: rel.to_string(),
            header: ChunkHeader {
                index,
                total,
                chunk_size,
                target_len,
            },
            delta_bytes,
        })?;
    }
    Ok(total as usize)
}

fn open_buffered(path: &Path) -> Result<std::io::BufReader<std::fs::File>> {
    let file = std::fs::File::open(path).at(Phase::Build, path)?;
    Ok(std::io::BufReader::with_capacity(256 * 1024, file))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::archive::PatchArchive;
    use crate::config::{LargeFileStrategy, Mode, MIB};
    use crate::patch_format::EntryKind;

    fn write(root: &Path, rel: &str, data: &[u8]) {
        let path = root.join(rel);
        std::fs::create_dir_all(path.parent().unwrap()).unwrap();
        std::fs::write(path, data).unwrap();
    }

    fn entry_kinds(archive: &Path) -> Vec<EntryKind> {
        let archive = PatchArchive::open(archive).unwrap();
        let mut zip = archive.reader().unwrap();
        let mut kinds: Vec<_> = archive
            .entries(&mut zip)
            .unwrap()
            .into_iter()
            .map(|e| e.kind)
            .collect();
        kinds.sort_by_key(|k| (k.path().to_string(), format!("{k:?}")));
        kinds
    }

    fn deep_config() -> Config {
        Config {
            shallow_compare: false,
            threads: 2,
            ..Config::default()
        }
    }

    #[tokio::test]
    async fn test_binary_mode_entries() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        write(&base, "a.txt", b"hello");
        write(&base, "same.txt", b"same");
        write(&target, "a.txt", b"hello world");
        write(&target, "same.txt", b"same");
        write(&target, "nested/c.txt", b"new");

        let out = dir.path().join("t_patch.zip");
        let summary = create_patch(&base, &target, &out, &deep_config(), &CancelToken::new())
            .await
            .unwrap();

        assert_eq!(summary.files_changed, 1);
        assert_eq!(summary.full_deltas, 1);
        assert_eq!(summary.files_new, 1);
        assert_eq!(
            entry_kinds(&out),
            vec![
                EntryKind::Full { path: "a.txt".into() },
                EntryKind::Verbatim {
                    path: "nested/c.txt".into()
                },
            ]
        );
    }

    #[tokio::test]
    async fn test_file_mode_embeds_raw_files() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        write(&base, "a.txt", b"hello");
        write(&target, "a.txt", b"hello world");
        write(&target, "b.txt", b"b");

        let out = dir.path().join("f_patch.zip");
        let config = Config {
            mode: Mode::File,
            ..deep_config()
        };
        let summary = create_patch(&base, &target, &out, &config, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.verbatim_files, 2);
        assert_eq!(
            entry_kinds(&out),
            vec![
                EntryKind::Verbatim { path: "a.txt".into() },
                EntryKind::Verbatim { path: "b.txt".into() },
            ]
        );
    }

    #[tokio::test]
    async fn test_split_emits_contiguous_parts() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        let old: Vec<u8> = (0..(MIB as usize + 10)).map(|i| (i % 253) as u8).collect();
        let mut new = old.clone();
        new.extend_from_slice(&vec![7u8; MIB as usize]);
        write(&base, "big.bin", &old);
        write(&target, "big.bin", &new);

        let out = dir.path().join("s_patch.zip");
        let config = Config {
            large_file_strategy: LargeFileStrategy::Split,
            large_file_threshold_mb: 0,
            split_chunk_size_mb: 1,
            ..deep_config()
        };
        let summary = create_patch(&base, &target, &out, &config, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.chunked_files, 1);
        assert_eq!(summary.chunk_entries, 3);

        let indices: Vec<u32> = entry_kinds(&out)
            .into_iter()
            .map(|k| match k {
                EntryKind::Chunk { index, .. } => index,
                other => panic!("unexpected entry {other:?}"),
            })
            .collect();
        let mut sorted = indices.clone();
        sorted.sort();
        assert_eq!(sorted, vec![0, 1, 2]);
    }

    #[tokio::test]
    async fn test_skip_and_copy_strategies() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        write(&base, "big.bin", b"old large");
        write(&target, "big.bin", b"new large file");

        let skip_out = dir.path().join("skip_patch.zip");
        let skip = Config {
            large_file_strategy: LargeFileStrategy::Skip,
            large_file_threshold_mb: 0,
            ..deep_config()
        };
        let summary = create_patch(&base, &target, &skip_out, &skip, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(summary.skipped_files, 1);
        assert!(entry_kinds(&skip_out).is_empty());

        let copy_out = dir.path().join("copy_patch.zip");
        let copy = Config {
            large_file_strategy: LargeFileStrategy::Copy,
            ..skip
        };
        create_patch(&base, &target, &copy_out, &copy, &CancelToken::new())
            .await
            .unwrap();
        assert_eq!(
            entry_kinds(&copy_out),
            vec![EntryKind::Verbatim {
                path: "big.bin".into()
            }]
        );
    }

    #[tokio::test]
    async fn test_invalid_config_touches_nothing() {
        let dir = tempfile::tempdir().unwrap();
        let out = dir.path().join("bad_patch.zip");
        let config = Config {
            split_chunk_size_mb: 0,
            ..Config::default()
        };
        let err = create_patch(dir.path(), dir.path(), &out, &config, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Config(_)));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_cancelled_build_leaves_no_archive() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        write(&base, "a.txt", b"a");
        write(&target, "a.txt", b"ab");

        let out = dir.path().join("c_patch.zip");
        let cancel = CancelToken::new();
        cancel.cancel();
        let err = create_patch(&base, &target, &out, &deep_config(), &cancel)
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::Cancelled));
        assert!(!out.exists());
    }

    #[tokio::test]
    async fn test_missing_external_tool_fails_build() {
        let dir = tempfile::tempdir().unwrap();
        let (base, target) = (dir.path().join("base"), dir.path().join("target"));
        write(&base, "v.img", b"version one");
        write(&target, "v.img", b"version two!");

        let out = dir.path().join("x_patch.zip");
        let config = Config {
            large_file_strategy: LargeFileStrategy::External,
            large_file_threshold_mb: 0,
            external_tool: dir.path().join("missing-xdelta3"),
            ..deep_config()
        };
        let err = create_patch(&base, &target, &out, &config, &CancelToken::new())
            .await
            .unwrap_err();
        assert!(matches!(err, PatchError::ExternalTool { .. }), "{err}");
        assert!(!out.exists());
    }
}
