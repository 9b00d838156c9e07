//! Zip container for patch archives.
//!
//! Writers are shared between workers; every entry is written under one lock and the
//! archive only appears at its final path once [`ArchiveWriter::finish`] succeeds.
//! Delta payloads are already zstd-compressed and are stored; verbatim files are deflated.

use std::collections::HashSet;
use std::fs::File;
use std::io::{self, Cursor, Read, Write};
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use tempfile::NamedTempFile;
use zip::result::ZipError;
use zip::write::SimpleFileOptions;
use zip::{CompressionMethod, ZipArchive, ZipWriter};

use crate::delta;
use crate::error::{IoResultExt, PatchError, Phase, Result};
use crate::patch_format::{EntryKind, PatchEntry, VerbatimSource, PATCH_ARCHIVE_SUFFIX, TAG_LEN};
use crate::util::{self, FileBytes};

/// Entries at or above this size are written with zip64 headers.
const ZIP64_THRESHOLD: u64 = u32::MAX as u64;

fn zip_error(phase: Phase, path: &Path, err: ZipError) -> PatchError {
    match err {
        ZipError::Io(e) => PatchError::io(phase, path, e),
        other => PatchError::corrupt(phase, path.display().to_string(), other),
    }
}

struct WriterState {
    zip: ZipWriter<NamedTempFile>,
    names: HashSet<String>,
}

pub struct ArchiveWriter {
    state: Mutex<Option<WriterState>>,
    dest: PathBuf,
    phase: Phase,
}

impl ArchiveWriter {
    /// Start an archive that will be renamed to `dest` on [`finish`](Self::finish).
    pub fn create(dest: &Path, phase: Phase) -> Result<Self> {
        let dir = match dest.parent() {
            Some(p) if !p.as_os_str().is_empty() => p.to_path_buf(),
            _ => PathBuf::from("."),
        };
        let tmp = tempfile::Builder::new()
            .prefix(".deltapack-archive")
            .tempfile_in(&dir)
            .at(phase, &dir)?;
        Ok(Self {
            state: Mutex::new(Some(WriterState {
                zip: ZipWriter::new(tmp),
                names: HashSet::new(),
            })),
            dest: dest.to_path_buf(),
            phase,
        })
    }

    pub fn path(&self) -> &Path {
        &self.dest
    }

    /// Write one entry. Returns the number of content bytes stored.
    pub fn write_entry(&self, entry: &PatchEntry) -> Result<u64> {
        let name = entry.entry_name();
        match entry {
            PatchEntry::FullDelta { delta_bytes, .. }
            | PatchEntry::ExternalDelta { delta_bytes, .. } => {
                self.write_bytes(&name, delta_bytes, CompressionMethod::Stored)
            }
            PatchEntry::ChunkedDelta {
                header,
                delta_bytes,
                relative_path,
            } => {
                let framed = delta::encode_chunk(header, delta_bytes)
                    .map_err(|e| PatchError::corrupt(self.phase, relative_path.as_str(), e))?;
                self.write_bytes(&name, &framed, CompressionMethod::Stored)
            }
            PatchEntry::VerbatimFile {
                source: VerbatimSource::Bytes(data),
                ..
            } => self.write_bytes(&name, data, CompressionMethod::Deflated),
            PatchEntry::VerbatimFile {
                source: VerbatimSource::File(path),
                ..
            } => self.write_file(&name, path),
        }
    }

    fn write_bytes(&self, name: &str, data: &[u8], method: CompressionMethod) -> Result<u64> {
        let mut guard = self.state.lock();
        let state = self.open_entry(&mut guard, name, data.len() as u64, method)?;
        state.zip.write_all(data).at(self.phase, &self.dest)?;
        Ok(data.len() as u64)
    }

    /// Stream a file into the archive without loading it whole.
    fn write_file(&self, name: &str, path: &Path) -> Result<u64> {
        let file = File::open(path).at(self.phase, path)?;
        let len = file.metadata().at(self.phase, path)?.len();
        let mut reader = io::BufReader::with_capacity(256 * 1024, file);

        let mut guard = self.state.lock();
        let state = self.open_entry(&mut guard, name, len, CompressionMethod::Deflated)?;
        let copied = io::copy(&mut reader, &mut state.zip).at(self.phase, path)?;
        Ok(copied)
    }

    fn open_entry<'a>(
        &self,
        guard: &'a mut Option<WriterState>,
        name: &str,
        size_hint: u64,
        method: CompressionMethod,
    ) -> Result<&'a mut WriterState> {
        let state = guard.as_mut().ok_or_else(|| {
            PatchError::io(
                self.phase,
                &self.dest,
                io::Error::new(io::ErrorKind::Other, "archive already finished"),
            )
        })?;
        if !state.names.insert(name.to_string()) {
            return Err(PatchError::corrupt(
                self.phase,
                name,
                "duplicate entry name in archive",
            ));
        }
        let options = SimpleFileOptions::default()
            .compression_method(method)
            .large_file(size_hint >= ZIP64_THRESHOLD);
        state
            .zip
            .start_file(name, options)
            .map_err(|e| zip_error(self.phase, &self.dest, e))?;
        Ok(state)
    }

    pub fn entry_count(&self) -> usize {
        self.state.lock().as_ref().map_or(0, |s| s.names.len())
    }

    /// Finalize the zip and move it to its destination. Returns the archive size.
    pub fn finish(&self) -> Result<u64> {
        let state = self.state.lock().take().ok_or_else(|| {
            PatchError::io(
                self.phase,
                &self.dest,
                io::Error::new(io::ErrorKind::Other, "archive already finished"),
            )
        })?;
        let mut tmp = state
            .zip
            .finish()
            .map_err(|e| zip_error(self.phase, &self.dest, e))?;
        tmp.flush().at(self.phase, &self.dest)?;
        tmp.as_file().sync_all().at(self.phase, &self.dest)?;
        let file = tmp
            .persist(&self.dest)
            .map_err(|e| PatchError::io(self.phase, &self.dest, e.error))?;
        Ok(file.metadata().at(self.phase, &self.dest)?.len())
    }
}

/// One classified archive entry.
#[derive(Debug, Clone)]
pub struct ArchiveEntry {
    pub index: usize,
    pub name: String,
    pub size: u64,
    pub kind: EntryKind,
}

/// Read-only view of a patch archive.
pub struct PatchArchive {
    path: PathBuf,
    bytes: FileBytes,
}

pub type ZipReader<'a> = ZipArchive<Cursor<&'a [u8]>>;

impl PatchArchive {
    pub fn open(path: &Path) -> Result<Self> {
        let bytes = util::map_file(path).at(Phase::Validate, path)?;
        Ok(Self {
            path: path.to_path_buf(),
            bytes,
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Zip handle over the mapped bytes; cheap to clone for each worker.
    pub fn reader(&self) -> Result<ZipReader<'_>> {
        ZipArchive::new(Cursor::new(&self.bytes[..]))
            .map_err(|e| zip_error(Phase::Validate, &self.path, e))
    }

    /// Classify every entry by name and leading tag bytes.
    pub fn entries(&self, zip: &mut ZipReader<'_>) -> Result<Vec<ArchiveEntry>> {
        let mut out = Vec::with_capacity(zip.len());
        for index in 0..zip.len() {
            let mut file = zip
                .by_index(index)
                .map_err(|e| zip_error(Phase::Validate, &self.path, e))?;
            if file.is_dir() {
                continue;
            }
            let name = file.name().to_string();
            let size = file.size();
            let mut head = Vec::with_capacity(TAG_LEN);
            (&mut file)
                .take(TAG_LEN as u64)
                .read_to_end(&mut head)
                .at(Phase::Validate, &self.path)?;
            let kind = EntryKind::classify(&name, &head);
            out.push(ArchiveEntry {
                index,
                name,
                size,
                kind,
            });
        }
        Ok(out)
    }

    /// Whole content of one entry.
    pub fn read_entry(&self, zip: &mut ZipReader<'_>, entry: &ArchiveEntry) -> Result<Vec<u8>> {
        let mut file = zip
            .by_index(entry.index)
            .map_err(|e| zip_error(Phase::Apply, &self.path, e))?;
        let mut data = Vec::with_capacity(entry.size.min(1 << 30) as usize);
        file.read_to_end(&mut data)
            .map_err(|e| PatchError::corrupt(Phase::Apply, entry.name.as_str(), e))?;
        Ok(data)
    }

    /// At most `limit` leading bytes of one entry.
    pub fn read_prefix(
        &self,
        zip: &mut ZipReader<'_>,
        entry: &ArchiveEntry,
        limit: u64,
    ) -> Result<Vec<u8>> {
        let file = zip
            .by_index(entry.index)
            .map_err(|e| zip_error(Phase::Validate, &self.path, e))?;
        let mut head = Vec::new();
        file.take(limit)
            .read_to_end(&mut head)
            .map_err(|e| PatchError::corrupt(Phase::Validate, entry.name.as_str(), e))?;
        Ok(head)
    }

    /// Stream one entry into `out`.
    pub fn copy_entry(
        &self,
        zip: &mut ZipReader<'_>,
        entry: &ArchiveEntry,
        out: &mut impl Write,
    ) -> Result<u64> {
        let mut file = zip
            .by_index(entry.index)
            .map_err(|e| zip_error(Phase::Apply, &self.path, e))?;
        io::copy(&mut file, out).map_err(|e| PatchError::corrupt(Phase::Apply, entry.name.as_str(), e))
    }
}

/// Patch archives (`*_patch.zip`) in `dir`, sorted by name.
pub fn find_patches(dir: &Path) -> Result<Vec<PathBuf>> {
    let mut found = Vec::new();
    for entry in std::fs::read_dir(dir).at(Phase::Validate, dir)? {
        let entry = entry.at(Phase::Validate, dir)?;
        let name = entry.file_name();
        let is_patch = name
            .to_str()
            .is_some_and(|n| n.ends_with(PATCH_ARCHIVE_SUFFIX));
        if is_patch && entry.path().is_file() {
            found.push(entry.path());
        }
    }
    found.sort();
    Ok(found)
}

/// Default archive path for a build of `target_root`: `<target_root>_patch.zip`.
pub fn default_patch_path(target_root: &Path) -> PathBuf {
    let mut name = target_root
        .components()
        .collect::<PathBuf>()
        .into_os_string();
    name.push(PATCH_ARCHIVE_SUFFIX);
    PathBuf::from(name)
}
