use std::path::{Path, PathBuf};
use std::time::Instant;

use anyhow::{bail, Context};
use clap::{Args, Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use deltapack::util::format_bytes;
use deltapack::{
    apply_patch, create_patch, default_patch_path, find_patches, missing_base_files,
    ApplySummary, CancelToken, Config, LargeFileStrategy, Mode,
};

#[derive(Parser)]
#[command(
    name = "deltapack",
    version,
    about = "Delta patch archives for directory trees"
)]
struct Cli {
    /// TOML configuration file; command-line flags override its values
    #[arg(long, global = true)]
    config: Option<PathBuf>,
    /// Debug-level diagnostics on stderr
    #[arg(long, short, global = true)]
    verbose: bool,
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a patch archive that turns the base tree into the target tree
    Create {
        /// Path to the base (original) directory
        #[arg(long)]
        base: PathBuf,
        /// Path to the target (updated) directory
        #[arg(long)]
        target: PathBuf,
        /// Output archive, defaults to `<target>_patch.zip`
        #[arg(long, short)]
        output: Option<PathBuf>,
        #[arg(long, value_enum)]
        mode: Option<Mode>,
        /// Handling of changed files above the large-file threshold
        #[arg(long, value_enum)]
        large_file_strategy: Option<LargeFileStrategy>,
        #[arg(long)]
        large_file_threshold_mb: Option<u64>,
        #[arg(long)]
        split_chunk_size_mb: Option<u64>,
        /// Compare file contents even when size and mtime match
        #[arg(long)]
        full_compare: bool,
        #[command(flatten)]
        workers: WorkerArgs,
    },
    /// Apply a patch archive to a directory
    Apply {
        /// Directory to patch
        #[arg(long)]
        target: PathBuf,
        /// Patch archive; without it every `*_patch.zip` in --patch-dir is applied in order
        #[arg(long, short)]
        patch: Option<PathBuf>,
        /// Where to look for patches when --patch is not given (default: current directory)
        #[arg(long)]
        patch_dir: Option<PathBuf>,
        /// Write a `<stem>_revertpatch.zip` that undoes the patch
        #[arg(long)]
        backup: bool,
        #[command(flatten)]
        workers: WorkerArgs,
    },
    /// Check that every file a patch modifies exists in a directory
    Validate {
        #[arg(long)]
        target: PathBuf,
        #[arg(long, short)]
        patch: PathBuf,
    },
}

#[derive(Args)]
struct WorkerArgs {
    /// Worker threads (0 = one per core)
    #[arg(long)]
    threads: Option<usize>,
    /// xdelta3-compatible executable for the `external` strategy
    #[arg(long)]
    external_tool: Option<PathBuf>,
    /// Seconds before an external tool run is killed
    #[arg(long)]
    external_timeout_secs: Option<u64>,
}

impl WorkerArgs {
    fn apply_to(self, config: &mut Config) {
        if let Some(threads) = self.threads {
            config.threads = threads;
        }
        if let Some(tool) = self.external_tool {
            config.external_tool = tool;
        }
        if let Some(secs) = self.external_timeout_secs {
            config.external_timeout_secs = secs;
        }
    }
}

fn init_tracing(verbose: bool) {
    let default = if verbose { "deltapack=debug" } else { "deltapack=info" };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .with_target(false)
        .init();
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let mut config = match &cli.config {
        Some(path) => Config::load(path)
            .with_context(|| format!("Failed to load config: {}", path.display()))?,
        None => Config::default(),
    };
    config.verbose |= cli.verbose;
    init_tracing(config.verbose);

    let cancel = CancelToken::new();
    let on_interrupt = cancel.clone();
    ctrlc::set_handler(move || {
        eprintln!("\nInterrupted, stopping after the current files...");
        on_interrupt.cancel();
    })
    .context("Failed to set Ctrl-C handler")?;

    match cli.command {
        Commands::Create {
            base,
            target,
            output,
            mode,
            large_file_strategy,
            large_file_threshold_mb,
            split_chunk_size_mb,
            full_compare,
            workers,
        } => {
            if let Some(mode) = mode {
                config.mode = mode;
            }
            if let Some(strategy) = large_file_strategy {
                config.large_file_strategy = strategy;
            }
            if let Some(mb) = large_file_threshold_mb {
                config.large_file_threshold_mb = mb;
            }
            if let Some(mb) = split_chunk_size_mb {
                config.split_chunk_size_mb = mb;
            }
            if full_compare {
                config.shallow_compare = false;
            }
            workers.apply_to(&mut config);
            config.validate().context("Invalid configuration")?;

            let output = match output {
                Some(path) => path,
                None => default_patch_path(&target.canonicalize().with_context(|| {
                    format!("Failed to resolve target: {}", target.display())
                })?),
            };

            println!("Creating patch...");
            println!("  Base: {}", base.display());
            println!("  Target: {}", target.display());
            println!("  Output: {}", output.display());

            let start = Instant::now();
            let summary = create_patch(&base, &target, &output, &config, &cancel)
                .await
                .context("Failed to create patch")?;
            let elapsed = start.elapsed();

            println!("\nPatch created successfully!");
            println!("  Files changed: {}", summary.files_changed);
            println!("  Files new: {}", summary.files_new);
            println!("  Full deltas: {}", summary.full_deltas);
            println!(
                "  Split files: {} ({} chunks)",
                summary.chunked_files, summary.chunk_entries
            );
            println!("  External deltas: {}", summary.external_deltas);
            println!("  Verbatim files: {}", summary.verbatim_files);
            println!("  Skipped large files: {}", summary.skipped_files);
            println!("  Archive size: {}", format_bytes(summary.archive_bytes));
            println!("  Time elapsed: {:.3}s", elapsed.as_secs_f64());
        }
        Commands::Apply {
            target,
            patch,
            patch_dir,
            backup,
            workers,
        } => {
            config.make_backup |= backup;
            workers.apply_to(&mut config);
            config.validate().context("Invalid configuration")?;

            let patches = match patch {
                Some(path) => vec![path],
                None => {
                    let dir = match patch_dir {
                        Some(dir) => dir,
                        None => std::env::current_dir().context("Failed to read current directory")?,
                    };
                    let found = find_patches(&dir)
                        .with_context(|| format!("Failed to list patches in {}", dir.display()))?;
                    if found.is_empty() {
                        bail!("No *_patch.zip files found in {}", dir.display());
                    }
                    found
                }
            };

            // Every patch must validate before the first one is applied.
            for patch in &patches {
                ensure_valid(patch, &target)?;
            }

            for patch in &patches {
                println!("Applying patch...");
                println!("  Target: {}", target.display());
                println!("  Patch: {}", patch.display());

                let start = Instant::now();
                let summary = apply_patch(patch, &target, &config, &cancel)
                    .await
                    .with_context(|| format!("Failed to apply {}", patch.display()))?;
                print_apply_summary(&summary, start);
            }
        }
        Commands::Validate { target, patch } => {
            ensure_valid(&patch, &target)?;
            println!("Patch {} is valid for {}", patch.display(), target.display());
        }
    }

    Ok(())
}

fn ensure_valid(patch: &Path, target: &Path) -> anyhow::Result<()> {
    let missing = missing_base_files(patch, target)
        .with_context(|| format!("Failed to read {}", patch.display()))?;
    if !missing.is_empty() {
        for path in &missing {
            eprintln!("  missing: {path}");
        }
        bail!(
            "Patch {} does not match {}: {} base file(s) missing",
            patch.display(),
            target.display(),
            missing.len()
        );
    }
    Ok(())
}

fn print_apply_summary(summary: &ApplySummary, start: Instant) {
    println!("\nPatch applied successfully!");
    println!("  Files written: {}", summary.files_written);
    println!("  Full deltas: {}", summary.full_deltas);
    println!("  Split files: {}", summary.chunked_files);
    println!("  External deltas: {}", summary.external_deltas);
    println!("  Processed: {}", format_bytes(summary.bytes_processed));
    if let Some(reverse) = &summary.reverse_archive {
        println!("  Reverse patch: {}", reverse.display());
    }
    println!("  Time elapsed: {:.3}s", start.elapsed().as_secs_f64());
}
