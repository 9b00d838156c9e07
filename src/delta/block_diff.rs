//! Block-matching byte diff (rsync-like).
//!
//! The base is cut into fixed-size blocks indexed by a weak rolling checksum and a
//! BLAKE3 strong hash. The new data is scanned with the rolling checksum; windows that
//! match a base block become `Copy` ops, everything else is gathered into `Insert` ops.

use std::collections::HashMap;

use crate::delta::rolling::WeakChecksum;
use crate::patch_format::DiffOp;

pub const BLOCK_SIZE: usize = 4096;

struct BlockSignature {
    strong: blake3::Hash,
    offset: u64,
}

struct BlockIndex {
    signatures: Vec<BlockSignature>,
    by_weak: HashMap<u32, Vec<usize>>,
}

impl BlockIndex {
    fn build(base: &[u8]) -> Self {
        let num_blocks = base.len().div_ceil(BLOCK_SIZE);
        let mut signatures = Vec::with_capacity(num_blocks);
        let mut by_weak: HashMap<u32, Vec<usize>> = HashMap::with_capacity(num_blocks);

        for (idx, block) in base.chunks(BLOCK_SIZE).enumerate() {
            by_weak
                .entry(WeakChecksum::over(block).value())
                .or_default()
                .push(idx);
            signatures.push(BlockSignature {
                strong: blake3::hash(block),
                offset: (idx * BLOCK_SIZE) as u64,
            });
        }

        Self { signatures, by_weak }
    }

    /// Base (offset, length) of a block equal to `window`, if any.
    fn find(&self, weak: u32, window: &[u8], base_len: usize) -> Option<(u64, u64)> {
        let candidates = self.by_weak.get(&weak)?;
        let strong = blake3::hash(window);
        candidates
            .iter()
            .map(|&i| &self.signatures[i])
            .find(|sig| sig.strong == strong)
            .map(|sig| {
                let end = (sig.offset as usize + BLOCK_SIZE).min(base_len);
                (sig.offset, (end - sig.offset as usize) as u64)
            })
    }
}

/// Compute the ops that rebuild `new` from `base`.
pub fn diff(base: &[u8], new: &[u8]) -> Vec<DiffOp> {
    if new.is_empty() {
        return Vec::new();
    }
    if base.is_empty() || new.len() < BLOCK_SIZE {
        return vec![DiffOp::Insert { data: new.to_vec() }];
    }

    let index = BlockIndex::build(base);
    let mut ops: Vec<DiffOp> = Vec::new();
    let mut pending: Vec<u8> = Vec::new();

    let mut weak = WeakChecksum::over(&new[..BLOCK_SIZE]);
    let mut pos: usize = 0;

    while pos + BLOCK_SIZE <= new.len() {
        let window = &new[pos..pos + BLOCK_SIZE];

        if let Some((offset, length)) = index.find(weak.value(), window, base.len()) {
            if !pending.is_empty() {
                ops.push(DiffOp::Insert {
                    data: std::mem::take(&mut pending),
                });
            }
            push_copy(&mut ops, offset, length);

            pos += length as usize;
            if pos + BLOCK_SIZE <= new.len() {
                weak = WeakChecksum::over(&new[pos..pos + BLOCK_SIZE]);
            }
        } else {
            pending.push(new[pos]);
            pos += 1;
            if pos + BLOCK_SIZE <= new.len() {
                weak.roll(new[pos - 1], new[pos + BLOCK_SIZE - 1]);
            }
        }
    }

    // Tail shorter than a block window
    if pos < new.len() {
        pending.extend_from_slice(&new[pos..]);
    }
    if !pending.is_empty() {
        ops.push(DiffOp::Insert { data: pending });
    }

    ops
}

/// Merge adjacent copies of consecutive base ranges into one op.
fn push_copy(ops: &mut Vec<DiffOp>, offset: u64, length: u64) {
    if let Some(DiffOp::Copy {
        offset: prev_offset,
        length: prev_length,
    }) = ops.last_mut()
    {
        if *prev_offset + *prev_length == offset {
            *prev_length += length;
            return;
        }
    }
    ops.push(DiffOp::Copy { offset, length });
}

/// A copy op pointing outside the base it is applied to.
#[derive(Debug, PartialEq, Eq)]
pub struct OutOfRange {
    pub offset: u64,
    pub length: u64,
    pub base_len: usize,
}

/// Rebuild the new data from `base` and `ops`.
pub fn patch(base: &[u8], ops: &[DiffOp]) -> Result<Vec<u8>, OutOfRange> {
    let estimated: u64 = ops
        .iter()
        .map(|op| match op {
            DiffOp::Copy { length, .. } => *length,
            DiffOp::Insert { data } => data.len() as u64,
        })
        .fold(0u64, u64::saturating_add);

    let mut out = Vec::with_capacity(estimated.min(1 << 30) as usize);

    for op in ops {
        match op {
            DiffOp::Copy { offset, length } => {
                let range = offset
                    .checked_add(*length)
                    .filter(|end| *end <= base.len() as u64)
                    .map(|end| *offset as usize..end as usize)
                    .ok_or(OutOfRange {
                        offset: *offset,
                        length: *length,
                        base_len: base.len(),
                    })?;
                out.extend_from_slice(&base[range]);
            }
            DiffOp::Insert { data } => out.extend_from_slice(data),
        }
    }

    Ok(out)
}
