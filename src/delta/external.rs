//! xdelta3-compatible external delta tool, run as a subprocess.
//!
//! Encode: `tool -e -s <old> <new>` with the delta on stdout.
//! Decode: `tool -d -f -s <old> <patch> <out>`.

use std::ffi::OsString;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::process::{Output, Stdio};
use std::time::Duration;

use tracing::{debug, warn};

use crate::delta::DeltaError;
use crate::patch_format::{ExternalHeader, EXTERNAL_MAGIC, TAG_LEN};
use crate::util;

/// Prefix of the temporary file holding the tool's raw delta during a decode.
pub const SCRATCH_PREFIX: &str = ".deltapack-xdelta";

#[derive(Debug, Clone)]
pub struct ExternalTool {
    pub program: PathBuf,
    pub timeout: Duration,
}

impl ExternalTool {
    pub fn new(program: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            program: program.into(),
            timeout,
        }
    }

    pub fn from_config(config: &crate::config::Config) -> Self {
        Self::new(config.external_tool.clone(), config.external_timeout())
    }

    /// Tagged delta of `new_path` against `old_path`.
    pub fn encode(&self, old_path: &Path, new_path: &Path) -> Result<Vec<u8>, DeltaError> {
        let (base_len, base_hash) = util::hash_file(old_path)?;
        let (target_len, target_hash) = util::hash_file(new_path)?;
        let header = ExternalHeader {
            base_len,
            base_hash,
            target_len,
            target_hash,
        };

        let output = self.run(vec![
            "-e".into(),
            "-s".into(),
            old_path.into(),
            new_path.into(),
        ])?;

        let mut out = Vec::with_capacity(TAG_LEN + 80 + output.stdout.len());
        out.extend_from_slice(EXTERNAL_MAGIC);
        bincode::serialize_into(&mut out, &header)
            .map_err(|e| DeltaError::Corrupt(format!("cannot serialize external header: {e}")))?;
        out.extend_from_slice(&output.stdout);
        Ok(out)
    }

    /// Write the file reconstructed from `old_path` and `delta` to `out_path`.
    ///
    /// The tool reads the delta from a temporary file created next to `out_path`.
    /// Both are removed again if anything fails after the tool was started.
    pub fn decode(&self, old_path: &Path, delta: &[u8], out_path: &Path) -> Result<(), DeltaError> {
        let (header, raw) = split_external(delta)?;

        let (base_len, base_hash) = util::hash_file(old_path)?;
        if base_len != header.base_len || base_hash != header.base_hash {
            return Err(DeltaError::Corrupt(format!(
                "base does not match: delta expects {} bytes with a different hash, found {base_len} bytes",
                header.base_len
            )));
        }

        // Dropped (and deleted) on every return path.
        let scratch = match out_path.parent() {
            Some(dir) if !dir.as_os_str().is_empty() => dir,
            _ => Path::new("."),
        };
        let mut patch_file = tempfile::Builder::new()
            .prefix(SCRATCH_PREFIX)
            .tempfile_in(scratch)?;
        patch_file.write_all(raw)?;
        patch_file.flush()?;

        let result = self
            .run(vec![
                "-d".into(),
                "-f".into(),
                "-s".into(),
                old_path.into(),
                patch_file.path().into(),
                out_path.into(),
            ])
            .and_then(|_| {
                let (len, hash) = util::hash_file(out_path)?;
                if len != header.target_len || hash != header.target_hash {
                    return Err(DeltaError::Corrupt(
                        "external tool output hash mismatch".into(),
                    ));
                }
                Ok(())
            });

        if result.is_err() {
            match std::fs::remove_file(out_path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => warn!(
                    path = %out_path.display(),
                    error = %e,
                    "cannot remove partial external tool output"
                ),
            }
        }
        result
    }

    fn run(&self, args: Vec<OsString>) -> Result<Output, DeltaError> {
        debug!(tool = %self.program.display(), ?args, "running external delta tool");

        // block_on panics on a thread that already drives a runtime.
        let output = if tokio::runtime::Handle::try_current().is_ok() {
            std::thread::scope(|scope| -> Result<Output, DeltaError> {
                let runner = std::thread::Builder::new()
                    .name("deltapack-xdelta".into())
                    .spawn_scoped(scope, || self.wait_for(&args))?;
                runner.join().unwrap_or_else(|_| {
                    Err(DeltaError::External(format!(
                        "runner thread for {} panicked",
                        self.program.display()
                    )))
                })
            })
        } else {
            self.wait_for(&args)
        }?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(DeltaError::External(format!(
                "{} exited with {}: {}",
                self.program.display(),
                output.status,
                stderr.trim()
            )));
        }
        Ok(output)
    }

    /// Spawn the tool on a private current-thread runtime and wait for it under the timeout.
    fn wait_for(&self, args: &[OsString]) -> Result<Output, DeltaError> {
        let runtime = tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()?;

        runtime.block_on(async {
            let child = tokio::process::Command::new(&self.program)
                .args(args)
                .stdin(Stdio::null())
                .stdout(Stdio::piped())
                .stderr(Stdio::piped())
                .kill_on_drop(true)
                .spawn()
                .map_err(|e| {
                    DeltaError::External(format!(
                        "cannot start {}: {e}",
                        self.program.display()
                    ))
                })?;

            // On timeout the child is dropped, which kills it.
            match tokio::time::timeout(self.timeout, child.wait_with_output()).await {
                Ok(output) => output.map_err(|e| {
                    DeltaError::External(format!("waiting for {}: {e}", self.program.display()))
                }),
                Err(_) => Err(DeltaError::External(format!(
                    "{} timed out after {}s",
                    self.program.display(),
                    self.timeout.as_secs_f64()
                ))),
            }
        })
    }
}

/// Split an external delta entry into its header and the tool's raw bytes.
pub fn split_external(delta: &[u8]) -> Result<(ExternalHeader, &[u8]), DeltaError> {
    let mut rest = delta
        .strip_prefix(&EXTERNAL_MAGIC[..])
        .ok_or_else(|| DeltaError::Corrupt("missing external delta tag".into()))?;
    let header: ExternalHeader = bincode::deserialize_from(&mut rest)
        .map_err(|e| DeltaError::Corrupt(format!("cannot decode external header: {e}")))?;
    Ok((header, rest))
}
