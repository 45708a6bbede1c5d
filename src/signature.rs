//! Block signatures and the weak-hash lookup index.
//!
//! The receiver signs each block of its basis file with a weak rolling
//! checksum and a strong 128-bit hash. The sender builds a
//! [`SignatureIndex`] from those signatures and queries it at every byte
//! offset while scanning the source file.

use std::io::Read;

use rayon::prelude::*;
use rustc_hash::FxHashMap;

use crate::checksum::{weak_bucket, RollingChecksum};
use crate::error::Result;
use crate::hash::StrongHash;

/// Block size for a file of the given length.
///
/// Both peers evaluate this on the source size from the manifest, so the
/// result needs no negotiation. Files under 128 KiB are a single block.
#[must_use]
pub const fn block_size_for(file_size: u64) -> u64 {
    const KIB: u64 = 1024;
    const MIB: u64 = 1024 * KIB;
    const GIB: u64 = 1024 * MIB;

    if file_size < 128 * KIB {
        file_size
    } else if file_size < 16 * MIB {
        128 * KIB
    } else if file_size < 256 * MIB {
        MIB
    } else if file_size < 4 * GIB {
        16 * MIB
    } else if file_size < 64 * GIB {
        128 * MIB
    } else {
        GIB
    }
}

/// Signature of one basis-file block.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BlockSignature {
    /// Block index (0-based position in the basis file).
    pub index: u32,
    /// Byte offset of the block in the basis file.
    pub offset: u64,
    /// Block length. Less than the block size only for the final block.
    pub len: u32,
    /// Weak rolling checksum for candidate filtering.
    pub weak: u32,
    /// Strong hash confirming a weak hit.
    pub strong: StrongHash,
}

impl BlockSignature {
    /// Sign a block of data at the given index and offset.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn compute(index: u32, offset: u64, data: &[u8]) -> Self {
        Self {
            index,
            offset,
            len: data.len() as u32,
            weak: RollingChecksum::new(data).digest(),
            strong: StrongHash::compute(data),
        }
    }
}

/// Complete signature of a basis file: every block, in index order.
///
/// Built by the receiver when a file is classified for delta transfer and
/// dropped as soon as that file completes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
    /// Block size the basis was split with.
    pub block_size: u64,
    /// Total basis file size in bytes.
    pub file_size: u64,
    /// Per-block signatures, ascending index.
    pub blocks: Vec<BlockSignature>,
}

/// Batches this many bytes of small blocks for parallel hashing.
const PAR_BATCH_BYTES: usize = 16 * 1024 * 1024;

impl Signature {
    /// An empty signature for a zero-length basis.
    #[must_use]
    pub const fn empty(block_size: u64) -> Self {
        Self {
            block_size,
            file_size: 0,
            blocks: Vec::new(),
        }
    }

    /// Sign an in-memory basis.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_bytes(data: &[u8], block_size: u64) -> Self {
        let bs = (block_size as usize).max(1);
        if data.is_empty() {
            return Self::empty(block_size);
        }

        // Parallel hashing pays off once there are several blocks.
        let blocks: Vec<BlockSignature> = if data.len() > 64 * 1024 && data.len() > bs {
            data.par_chunks(bs)
                .enumerate()
                .map(|(i, chunk)| {
                    BlockSignature::compute(i as u32, (i * bs) as u64, chunk)
                })
                .collect()
        } else {
            data.chunks(bs)
                .enumerate()
                .map(|(i, chunk)| {
                    BlockSignature::compute(i as u32, (i * bs) as u64, chunk)
                })
                .collect()
        };

        Self {
            block_size,
            file_size: data.len() as u64,
            blocks,
        }
    }

    /// Sign a basis from a reader without holding more than one batch of
    /// blocks in memory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    #[allow(clippy::cast_possible_truncation)]
    pub fn from_reader<R: Read>(reader: &mut R, block_size: u64) -> Result<Self> {
        let bs = (block_size as usize).max(1);
        let batch_blocks = (PAR_BATCH_BYTES / bs).max(1);
        let mut buf = vec![0u8; bs.saturating_mul(batch_blocks)];

        let mut blocks = Vec::new();
        let mut file_size = 0u64;

        loop {
            let filled = read_full(reader, &mut buf)?;
            if filled == 0 {
                break;
            }

            let base_index = blocks.len() as u32;
            let base_offset = file_size;
            let batch: Vec<BlockSignature> = buf[..filled]
                .par_chunks(bs)
                .enumerate()
                .map(|(i, chunk)| {
                    BlockSignature::compute(
                        base_index + i as u32,
                        base_offset + (i * bs) as u64,
                        chunk,
                    )
                })
                .collect();
            blocks.extend(batch);
            file_size += filled as u64;

            if filled < buf.len() {
                break;
            }
        }

        Ok(Self {
            block_size,
            file_size,
            blocks,
        })
    }

    /// Number of blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.blocks.len()
    }

    /// Whether the basis had no content.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.blocks.is_empty()
    }

    /// Build the sender-side lookup index from this signature.
    #[must_use]
    pub fn into_index(self) -> SignatureIndex {
        SignatureIndex::from_signature(self)
    }
}

/// Read until `buf` is full or the reader is exhausted.
fn read_full<R: Read>(reader: &mut R, buf: &mut [u8]) -> Result<usize> {
    let mut filled = 0;
    while filled < buf.len() {
        let n = reader.read(&mut buf[filled..])?;
        if n == 0 {
            break;
        }
        filled += n;
    }
    Ok(filled)
}

/// Sender-side lookup table over a file's block signatures.
///
/// Buckets are keyed by the low 16 bits of the weak digest; each bucket
/// chains block indices in ascending order, so collision resolution is
/// linear and matches are deterministic. A hit requires the full weak
/// value, the window length, and the strong hash to agree.
#[derive(Debug)]
pub struct SignatureIndex {
    buckets: FxHashMap<u16, Vec<u32>>,
    signature: Signature,
}

impl SignatureIndex {
    /// Build the index from a complete signature.
    #[must_use]
    pub fn from_signature(signature: Signature) -> Self {
        let mut buckets: FxHashMap<u16, Vec<u32>> =
            FxHashMap::with_capacity_and_hasher(signature.blocks.len(), rustc_hash::FxBuildHasher);

        // Blocks arrive in ascending index order, so each chain is already
        // sorted and ties resolve to the earliest block.
        for block in &signature.blocks {
            buckets
                .entry(weak_bucket(block.weak))
                .or_default()
                .push(block.index);
        }

        Self { buckets, signature }
    }

    /// Whether any block shares this weak digest's bucket. Cheap pre-check
    /// before computing a strong hash.
    #[must_use]
    pub fn has_candidate(&self, weak: u32) -> bool {
        self.buckets.contains_key(&weak_bucket(weak))
    }

    /// Find the block matching a window of source bytes.
    ///
    /// Filters by bucket, then full weak value and window length, and only
    /// then computes the strong hash of the window, once. Returns the
    /// lowest-indexed matching block.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn find_match(&self, weak: u32, window: &[u8]) -> Option<&BlockSignature> {
        let chain = self.buckets.get(&weak_bucket(weak))?;
        let window_len = window.len() as u32;
        let mut strong: Option<StrongHash> = None;

        for &index in chain {
            let block = &self.signature.blocks[index as usize];
            if block.weak != weak || block.len != window_len {
                continue;
            }
            let computed = *strong.get_or_insert_with(|| StrongHash::compute(window));
            if block.strong == computed {
                return Some(block);
            }
        }
        None
    }

    /// The final block when it is shorter than the block size. The matcher
    /// probes it separately near the end of the source.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)]
    pub fn short_block(&self) -> Option<&BlockSignature> {
        let last = self.signature.blocks.last()?;
        (u64::from(last.len) < self.signature.block_size).then_some(last)
    }

    /// Block size the basis was signed with.
    #[must_use]
    pub const fn block_size(&self) -> u64 {
        self.signature.block_size
    }

    /// Basis file size.
    #[must_use]
    pub const fn file_size(&self) -> u64 {
        self.signature.file_size
    }

    /// Underlying signature.
    #[must_use]
    pub const fn signature(&self) -> &Signature {
        &self.signature
    }

    /// Number of indexed blocks.
    #[must_use]
    pub fn block_count(&self) -> usize {
        self.signature.blocks.len()
    }

    /// Whether the index holds no blocks.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.signature.blocks.is_empty()
    }
}
