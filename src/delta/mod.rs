//! Delta codec: in-memory block deltas and the external delta tool.

pub mod block_diff;
pub mod external;
pub mod rolling;

use std::path::Path;

use thiserror::Error;

use crate::error::{PatchError, Phase};
use crate::patch_format::{ChunkHeader, DeltaBody, CHUNK_MAGIC, DELTA_MAGIC, TAG_LEN};
use crate::util;

pub use external::ExternalTool;

const ZSTD_LEVEL: i32 = 3;

#[derive(Debug, Error)]
pub enum DeltaError {
    #[error("{0}")]
    Corrupt(String),
    #[error("{0}")]
    External(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl DeltaError {
    /// Attach the phase and the file the codec was working on.
    pub fn for_file(self, phase: Phase, relative_path: &str, path: &Path) -> PatchError {
        match self {
            DeltaError::Corrupt(reason) => PatchError::corrupt(phase, relative_path, reason),
            DeltaError::External(reason) => PatchError::ExternalTool {
                phase,
                path: path.to_path_buf(),
                reason,
            },
            DeltaError::Io(e) => PatchError::io(phase, path, e),
        }
    }
}

/// Encode the delta that turns `old` into `new`.
pub fn encode(old: &[u8], new: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let body = DeltaBody {
        base_len: old.len() as u64,
        base_hash: util::hash_bytes(old),
        target_len: new.len() as u64,
        target_hash: util::hash_bytes(new),
        ops: block_diff::diff(old, new),
    };
    let encoded = bincode::serialize(&body)
        .map_err(|e| DeltaError::Corrupt(format!("cannot serialize delta: {e}")))?;
    let compressed = zstd::bulk::compress(&encoded, ZSTD_LEVEL)?;

    let mut out = Vec::with_capacity(TAG_LEN + compressed.len());
    out.extend_from_slice(DELTA_MAGIC);
    out.extend_from_slice(&compressed);
    Ok(out)
}

/// Rebuild the new content from `old` and a delta produced by [`encode`].
///
/// Fails with [`DeltaError::Corrupt`] when the delta is malformed or `old` is not the
/// base it was computed against.
pub fn decode(old: &[u8], delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let payload = delta
        .strip_prefix(&DELTA_MAGIC[..])
        .ok_or_else(|| DeltaError::Corrupt("missing delta tag".into()))?;

    let decoder = zstd::Decoder::new(payload)
        .map_err(|e| DeltaError::Corrupt(format!("cannot open delta stream: {e}")))?;
    let body: DeltaBody = bincode::deserialize_from(decoder)
        .map_err(|e| DeltaError::Corrupt(format!("cannot decode delta: {e}")))?;

    if body.base_len != old.len() as u64 || body.base_hash != util::hash_bytes(old) {
        return Err(DeltaError::Corrupt(format!(
            "base does not match: delta expects {} bytes with a different hash, found {} bytes",
            body.base_len,
            old.len()
        )));
    }

    let new = block_diff::patch(old, &body.ops).map_err(|e| {
        DeltaError::Corrupt(format!(
            "copy of {} bytes at {} exceeds base of {} bytes",
            e.length, e.offset, e.base_len
        ))
    })?;

    if new.len() as u64 != body.target_len || util::hash_bytes(&new) != body.target_hash {
        return Err(DeltaError::Corrupt("reconstructed content hash mismatch".into()));
    }
    Ok(new)
}

/// Wrap a chunk delta with its position in the split file.
pub fn encode_chunk(header: &ChunkHeader, delta: &[u8]) -> Result<Vec<u8>, DeltaError> {
    let mut out = Vec::with_capacity(TAG_LEN + 32 + delta.len());
    out.extend_from_slice(CHUNK_MAGIC);
    bincode::serialize_into(&mut out, header)
        .map_err(|e| DeltaError::Corrupt(format!("cannot serialize chunk header: {e}")))?;
    out.extend_from_slice(delta);
    Ok(out)
}

/// Split a chunk entry into its header and the inner full delta.
pub fn decode_chunk(entry: &[u8]) -> Result<(ChunkHeader, &[u8]), DeltaError> {
    let mut rest = entry
        .strip_prefix(&CHUNK_MAGIC[..])
        .ok_or_else(|| DeltaError::Corrupt("missing chunk tag".into()))?;
    let header: ChunkHeader = bincode::deserialize_from(&mut rest)
        .map_err(|e| DeltaError::Corrupt(format!("cannot decode chunk header: {e}")))?;
    if header.chunk_size == 0 || header.index >= header.total {
        return Err(DeltaError::Corrupt(format!(
            "invalid chunk header: part {} of {}, size {}",
            header.index, header.total, header.chunk_size
        )));
    }
    Ok((header, rest))
}

/// Delta of `new_path` against `old_path` through the external tool.
pub fn encode_external(
    tool: &ExternalTool,
    old_path: &Path,
    new_path: &Path,
) -> Result<Vec<u8>, DeltaError> {
    tool.encode(old_path, new_path)
}

/// Reconstruct into `out_path` from `old_path` and an external delta.
pub fn decode_external(
    tool: &ExternalTool,
    old_path: &Path,
    delta: &[u8],
    out_path: &Path,
) -> Result<(), DeltaError> {
    tool.decode(old_path, delta, out_path)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample(len: usize, seed: u8) -> Vec<u8> {
        (0..len)
            .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
            .collect()
    }

    #[test]
    fn test_roundtrip() {
        let old = sample(20_000, 1);
        let mut new = old.clone();
        new.splice(5_000..5_010, b"inserted bytes".iter().copied());
        new.truncate(18_000);

        let delta = encode(&old, &new).unwrap();
        assert!(delta.starts_with(DELTA_MAGIC));
        assert_eq!(decode(&old, &delta).unwrap(), new);
    }

    #[test]
    fn test_roundtrip_empty_files() {
        let delta = encode(b"", b"").unwrap();
        assert_eq!(decode(b"", &delta).unwrap(), b"");

        let delta = encode(b"", b"grown").unwrap();
        assert_eq!(decode(b"", &delta).unwrap(), b"grown");
    }

    #[test]
    fn test_wrong_base_is_corrupt() {
        let old = b"hello".to_vec();
        let delta = encode(&old, b"hello world").unwrap();
        assert!(matches!(decode(b"hellp", &delta), Err(DeltaError::Corrupt(_))));
        assert!(matches!(
            decode(b"hello world", &delta),
            Err(DeltaError::Corrupt(_))
        ));
    }

    #[test]
    fn test_garbage_is_corrupt() {
        assert!(matches!(decode(b"x", b"nonsense"), Err(DeltaError::Corrupt(_))));

        let mut delta = encode(b"abc", b"abd").unwrap();
        delta.truncate(TAG_LEN + 4);
        assert!(matches!(decode(b"abc", &delta), Err(DeltaError::Corrupt(_))));
    }

    #[test]
    fn test_chunk_frame() {
        let header = ChunkHeader {
            index: 2,
            total: 3,
            chunk_size: 1024,
            target_len: 2500,
        };
        let inner = encode(b"old chunk", b"new chunk").unwrap();
        let framed = encode_chunk(&header, &inner).unwrap();

        let (parsed, delta) = decode_chunk(&framed).unwrap();
        assert_eq!(parsed, header);
        assert_eq!(decode(b"old chunk", delta).unwrap(), b"new chunk");
    }

    #[test]
    fn test_chunk_header_out_of_range() {
        let header = ChunkHeader {
            index: 3,
            total: 3,
            chunk_size: 1024,
            target_len: 2500,
        };
        let framed = encode_chunk(&header, &[]).unwrap();
        assert!(matches!(decode_chunk(&framed), Err(DeltaError::Corrupt(_))));
    }
}
