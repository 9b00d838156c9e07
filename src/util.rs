use std::io::{self, Read};
use std::ops::Deref;
use std::path::{Component, Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use memmap2::Mmap;

use crate::error::{PatchError, Result};

/// Read-only view of a whole file. Empty files are not mapped.
pub enum FileBytes {
    Mapped(Mmap),
    Empty,
}

impl Deref for FileBytes {
    type Target = [u8];

    fn deref(&self) -> &[u8] {
        match self {
            FileBytes::Mapped(map) => map,
            FileBytes::Empty => &[],
        }
    }
}

/// Memory-map a file for read-only access.
///
/// # Safety
/// The mapping is read-only. Callers must not concurrently truncate or replace
/// the underlying file while the mapping is live.
pub fn map_file(path: &Path) -> io::Result<FileBytes> {
    let file = std::fs::File::open(path)?;
    if file.metadata()?.len() == 0 {
        return Ok(FileBytes::Empty);
    }
    // SAFETY: read-only mapping; trees are not modified while a build or apply runs.
    let map = unsafe { Mmap::map(&file)? };
    Ok(FileBytes::Mapped(map))
}

pub fn hash_bytes(data: &[u8]) -> [u8; 32] {
    *blake3::hash(data).as_bytes()
}

/// Stream-hash a file with BLAKE3 through a 256 KB buffer. Returns (length, hash).
pub fn hash_file(path: &Path) -> io::Result<(u64, [u8; 32])> {
    let file = std::fs::File::open(path)?;
    let mut reader = io::BufReader::with_capacity(256 * 1024, file);
    let mut hasher = blake3::Hasher::new();
    let len = io::copy(&mut reader, &mut hasher)?;
    Ok((len, *hasher.finalize().as_bytes()))
}

/// Read up to `limit` bytes; shorter only at end of input.
pub fn read_chunk(reader: &mut impl Read, limit: u64) -> io::Result<Vec<u8>> {
    let mut buf = Vec::with_capacity(limit.min(64 * 1024 * 1024) as usize);
    reader.take(limit).read_to_end(&mut buf)?;
    Ok(buf)
}

/// Convert an OS path relative to a tree root into the archive form (`/` separators).
pub fn to_relative_string(rel: &Path) -> io::Result<String> {
    let s = rel.to_str().ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("non-UTF-8 path: {}", rel.display()),
        )
    })?;
    Ok(s.replace('\\', "/"))
}

pub fn join_relative(prefix: &str, name: &str) -> String {
    if prefix.is_empty() {
        name.to_string()
    } else {
        format!("{prefix}/{name}")
    }
}

/// Resolve an archive path under `root`, refusing anything that could escape it.
pub fn resolve_under(root: &Path, relative: &str) -> Option<PathBuf> {
    if relative.is_empty() {
        return None;
    }
    let rel = Path::new(relative);
    if !rel.components().all(|c| matches!(c, Component::Normal(_))) {
        return None;
    }
    Some(root.join(rel))
}

pub fn format_bytes(num: u64) -> String {
    const UNITS: [&str; 5] = ["bytes", "KB", "MB", "GB", "TB"];
    let mut value = num as f64;
    for unit in UNITS.iter().take(UNITS.len() - 1) {
        if value < 1024.0 {
            return format!("{value:.2} {unit}");
        }
        value /= 1024.0;
    }
    format!("{value:.2} {}", UNITS[UNITS.len() - 1])
}

/// Cooperative cancellation, checked between file units.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn check(&self) -> Result<()> {
        if self.is_cancelled() {
            Err(PatchError::Cancelled)
        } else {
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_map_empty_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("empty");
        std::fs::write(&path, b"").unwrap();
        assert!(map_file(&path).unwrap().is_empty());
    }

    #[test]
    fn test_hash_file_matches_hash_bytes() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("data");
        let data = vec![7u8; 300 * 1024];
        std::fs::write(&path, &data).unwrap();
        let (len, hash) = hash_file(&path).unwrap();
        assert_eq!(len, data.len() as u64);
        assert_eq!(hash, hash_bytes(&data));
    }

    #[test]
    fn test_read_chunk_stops_at_limit_and_eof() {
        let data = [1u8; 10];
        let mut reader = &data[..];
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 4);
        assert_eq!(read_chunk(&mut reader, 4).unwrap().len(), 2);
        assert!(read_chunk(&mut reader, 4).unwrap().is_empty());
    }

    #[test]
    fn test_resolve_under_rejects_escapes() {
        let root = Path::new("/tree");
        assert_eq!(
            resolve_under(root, "a/b.txt"),
            Some(PathBuf::from("/tree/a/b.txt"))
        );
        assert_eq!(resolve_under(root, "../etc/passwd"), None);
        assert_eq!(resolve_under(root, "/etc/passwd"), None);
        assert_eq!(resolve_under(root, "a/./b"), Some(PathBuf::from("/tree/a/b")));
        assert_eq!(resolve_under(root, ""), None);
    }

    #[test]
    fn test_format_bytes() {
        assert_eq!(format_bytes(512), "512.00 bytes");
        assert_eq!(format_bytes(2048), "2.00 KB");
        assert_eq!(format_bytes(3 * 1024 * 1024), "3.00 MB");
    }

    #[test]
    fn test_cancel_token_shared() {
        let token = CancelToken::new();
        let clone = token.clone();
        assert!(token.check().is_ok());
        clone.cancel();
        assert!(matches!(token.check(), Err(PatchError::Cancelled)));
    }
}
