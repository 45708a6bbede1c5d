//! Delta computation: turning a source file plus the receiver's block
//! signatures into a stream of copy/literal instructions.
//!
//! The matcher is greedy: the first block whose weak checksum, length and
//! strong hash all agree at the cursor is taken, with no lookahead for a
//! better match downstream. Strong hashes are computed only on weak hits,
//! and the working set stays bounded by one window plus one literal buffer
//! regardless of file size.

use std::io::Read;

use crate::checksum::RollingChecksum;
use crate::error::Result;
use crate::signature::SignatureIndex;

/// Maximum literal payload per instruction, pre-compression. Larger
/// mismatch regions are split so no frame exceeds the protocol cap.
pub const MAX_LITERAL: usize = 1024 * 1024;

/// One step of a file's instruction stream.
///
/// Applied in order against the receiver's basis file, the stream
/// reproduces the sender's file byte for byte.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Instruction {
    /// Copy one receiver-side block, identified by index.
    Copy {
        /// Index of the block in the receiver's signature.
        block_index: u32,
        /// Block length in bytes.
        len: u32,
    },
    /// Append these bytes verbatim.
    Literal(Vec<u8>),
}

impl Instruction {
    /// Whether this is a copy instruction.
    #[must_use]
    pub const fn is_copy(&self) -> bool {
        matches!(self, Self::Copy { .. })
    }

    /// Whether this is a literal instruction.
    #[must_use]
    pub const fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Bytes this instruction contributes to the reconstructed file.
    #[must_use]
    pub fn output_len(&self) -> u64 {
        match self {
            Self::Copy { len, .. } => u64::from(*len),
            Self::Literal(data) => data.len() as u64,
        }
    }
}

/// Counters from one file's delta computation.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DeltaStats {
    /// Copy instructions emitted.
    pub copy_ops: u64,
    /// Literal instructions emitted.
    pub literal_ops: u64,
    /// Bytes covered by copies (elided from the wire).
    pub bytes_matched: u64,
    /// Bytes sent verbatim.
    pub bytes_literal: u64,
}

impl DeltaStats {
    /// Fraction of the source covered by copies, in `[0, 1]`.
    #[must_use]
    #[allow(clippy::cast_precision_loss)]
    pub fn match_ratio(&self) -> f64 {
        let total = self.bytes_matched + self.bytes_literal;
        if total == 0 {
            return 1.0;
        }
        self.bytes_matched as f64 / total as f64
    }
}

/// Compute the instruction stream for `source` against the receiver's
/// signature index, handing each instruction to `emit` as soon as it is
/// final.
///
/// # Errors
///
/// Returns an error if reading the source fails or if `emit` fails
/// (typically a transport error while sending the instruction).
pub fn compute_delta<R, F>(source: &mut R, index: &SignatureIndex, mut emit: F) -> Result<DeltaStats>
where
    R: Read,
    F: FnMut(Instruction) -> Result<()>,
{
    let mut stats = DeltaStats::default();

    #[allow(clippy::cast_possible_truncation)]
    let block_size = index.block_size() as usize;
    if block_size == 0 || index.is_empty() {
        // Nothing to match against: the whole source goes out verbatim.
        stream_all_literal(source, &mut emit, &mut stats)?;
        return Ok(stats);
    }

    let mut matcher = Matcher {
        source,
        index,
        block_size,
        buf: Vec::new(),
        cursor: 0,
        eof: false,
        emit: &mut emit,
        stats: &mut stats,
    };
    matcher.run()?;
    Ok(stats)
}

/// Sliding-window state for one file's scan.
struct Matcher<'a, R, F>
where
    R: Read,
    F: FnMut(Instruction) -> Result<()>,
{
    source: &'a mut R,
    index: &'a SignatureIndex,
    block_size: usize,
    /// Pending bytes: `[0, cursor)` is the unmatched literal run,
    /// `[cursor, len)` is lookahead.
    buf: Vec<u8>,
    cursor: usize,
    eof: bool,
    emit: &'a mut F,
    stats: &'a mut DeltaStats,
}

impl<R, F> Matcher<'_, R, F>
where
    R: Read,
    F: FnMut(Instruction) -> Result<()>,
{
    fn run(&mut self) -> Result<()> {
        let mut rolling: Option<RollingChecksum> = None;

        loop {
            self.fill()?;
            let avail = self.buf.len() - self.cursor;
            if avail < self.block_size {
                break;
            }

            let window = &self.buf[self.cursor..self.cursor + self.block_size];
            let weak = rolling
                .get_or_insert_with(|| RollingChecksum::new(window))
                .digest();

            if self.index.has_candidate(weak) {
                if let Some(block) = self.index.find_match(weak, window) {
                    let (block_index, len) = (block.index, block.len);
                    self.flush_literal()?;
                    self.emit_copy(block_index, len)?;
                    self.buf.drain(..self.block_size);
                    self.cursor = 0;
                    // No roll across a copy: the rolling invariant needs
                    // the dropped byte, so restart at the new window.
                    rolling = None;
                    continue;
                }
            }

            if avail == self.block_size {
                // EOF with exactly one window left and no match at it;
                // only short-block matches remain possible.
                break;
            }

            // Miss: advance one byte, growing the literal run.
            if let Some(r) = rolling.as_mut() {
                r.roll(self.buf[self.cursor], self.buf[self.cursor + self.block_size]);
            }
            self.cursor += 1;

            if self.cursor >= MAX_LITERAL {
                self.flush_literal()?;
            }
        }

        self.scan_tail()?;

        // Whatever is left, literal run and unscanned tail alike, goes out
        // verbatim.
        self.cursor = self.buf.len();
        self.flush_literal()?;
        Ok(())
    }

    /// Probe the receiver's short final block against the remaining tail.
    fn scan_tail(&mut self) -> Result<()> {
        let Some(short) = self.index.short_block() else {
            return Ok(());
        };
        let (short_index, short_weak) = (short.index, short.weak);
        let short_len = short.len as usize;
        if short_len == 0 {
            return Ok(());
        }

        let mut rolling: Option<RollingChecksum> = None;
        while self.buf.len() - self.cursor >= short_len {
            let window = &self.buf[self.cursor..self.cursor + short_len];
            let weak = rolling
                .get_or_insert_with(|| RollingChecksum::new(window))
                .digest();

            if weak == short_weak {
                if let Some(block) = self.index.find_match(weak, window) {
                    if block.index == short_index {
                        let len = block.len;
                        self.flush_literal()?;
                        self.emit_copy(short_index, len)?;
                        self.buf.drain(..short_len);
                        self.cursor = 0;
                        rolling = None;
                        continue;
                    }
                }
            }

            if self.buf.len() - self.cursor == short_len {
                break;
            }
            if let Some(r) = rolling.as_mut() {
                r.roll(self.buf[self.cursor], self.buf[self.cursor + short_len]);
            }
            self.cursor += 1;

            if self.cursor >= MAX_LITERAL {
                self.flush_literal()?;
            }
        }
        Ok(())
    }

    /// Top up the lookahead to one window plus the roll byte, unless the
    /// source is exhausted.
    fn fill(&mut self) -> Result<()> {
        let want = self.block_size + 1;
        while !self.eof && self.buf.len() - self.cursor < want {
            let chunk = want.max(64 * 1024);
            let old = self.buf.len();
            self.buf.resize(old + chunk, 0);
            let mut filled = 0;
            while filled < chunk {
                let n = self.source.read(&mut self.buf[old + filled..])?;
                if n == 0 {
                    self.eof = true;
                    break;
                }
                filled += n;
            }
            self.buf.truncate(old + filled);
        }
        Ok(())
    }

    /// Emit the pending literal run `[0, cursor)` in bounded chunks.
    fn flush_literal(&mut self) -> Result<()> {
        while self.cursor > 0 {
            let take = self.cursor.min(MAX_LITERAL);
            let chunk: Vec<u8> = self.buf.drain(..take).collect();
            self.cursor -= take;
            self.stats.literal_ops += 1;
            self.stats.bytes_literal += chunk.len() as u64;
            (self.emit)(Instruction::Literal(chunk))?;
        }
        Ok(())
    }

    fn emit_copy(&mut self, block_index: u32, len: u32) -> Result<()> {
        self.stats.copy_ops += 1;
        self.stats.bytes_matched += u64::from(len);
        (self.emit)(Instruction::Copy { block_index, len })
    }
}

/// Send an entire source as literal instructions. Used when there is no
/// basis to match against and for the full-transfer fallback after a hash
/// mismatch.
pub(crate) fn stream_all_literal<R, F>(
    source: &mut R,
    emit: &mut F,
    stats: &mut DeltaStats,
) -> Result<()>
where
    R: Read,
    F: FnMut(Instruction) -> Result<()>,
{
    let mut buf = vec![0u8; MAX_LITERAL];
    loop {
        let mut filled = 0;
        while filled < buf.len() {
            let n = source.read(&mut buf[filled..])?;
            if n == 0 {
                break;
            }
            filled += n;
        }
        if filled == 0 {
            return Ok(());
        }
        stats.literal_ops += 1;
        stats.bytes_literal += filled as u64;
        emit(Instruction::Literal(buf[..filled].to_vec()))?;
        if filled < buf.len() {
            return Ok(());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;
    use std::io::Cursor;

    fn delta_ops(source: &[u8], basis: &[u8], block_size: u64) -> (Vec<Instruction>, DeltaStats) {
        let index = Signature::from_bytes(basis, block_size).into_index();
        let mut ops = Vec::new();
        let stats = compute_delta(&mut Cursor::new(source), &index, |op| {
            ops.push(op);
            Ok(())
        })
        .unwrap();
        (ops, stats)
    }

    /// Reference apply: replay instructions against the basis.
    fn apply(ops: &[Instruction], basis: &[u8], block_size: usize) -> Vec<u8> {
        let mut out = Vec::new();
        for op in ops {
            match op {
                Instruction::Copy { block_index, len } => {
                    let start = *block_index as usize * block_size;
                    out.extend_from_slice(&basis[start..start + *len as usize]);
                }
                Instruction::Literal(data) => out.extend_from_slice(data),
            }
        }
        out
    }

    // ==========================================================================
    // BASIC MATCHING
    // ==========================================================================

    #[test]
    fn identical_files_all_copies() {
        let data = vec![42u8; 4096];
        let (ops, stats) = delta_ops(&data, &data, 1024);

        assert_eq!(stats.bytes_matched, 4096);
        assert_eq!(stats.bytes_literal, 0);
        assert!(ops.iter().all(Instruction::is_copy));
        assert_eq!(apply(&ops, &data, 1024), data);
    }

    #[test]
    fn completely_different_all_literal() {
        let basis = vec![0u8; 2048];
        let source = vec![1u8; 2048];
        let (ops, stats) = delta_ops(&source, &basis, 1024);

        assert_eq!(stats.bytes_matched, 0);
        assert_eq!(stats.bytes_literal, 2048);
        assert_eq!(apply(&ops, &basis, 1024), source);
    }

    #[test]
    fn empty_basis_all_literal() {
        let source = b"new content with no basis".to_vec();
        let (ops, stats) = delta_ops(&source, b"", 1024);

        assert_eq!(stats.bytes_literal, source.len() as u64);
        assert_eq!(stats.copy_ops, 0);
        assert_eq!(apply(&ops, b"", 1024), source);
    }

    #[test]
    fn empty_source_no_ops() {
        let (ops, stats) = delta_ops(b"", &vec![1u8; 2048], 1024);
        assert!(ops.is_empty());
        assert_eq!(stats.bytes_literal, 0);
        assert_eq!(stats.bytes_matched, 0);
    }

    // ==========================================================================
    // STRUCTURED EDITS
    // ==========================================================================

    #[test]
    fn tail_append_copies_prefix() {
        // Old content plus an appended tail: every old block is a copy and
        // exactly the appended bytes travel as literal.
        let basis: Vec<u8> = (0u32..8192).map(|i| (i % 251) as u8).collect();
        let mut source = basis.clone();
        source.extend(std::iter::repeat_n(0xAB, 100));

        let (ops, stats) = delta_ops(&source, &basis, 1024);
        assert_eq!(stats.copy_ops, 8);
        assert_eq!(stats.bytes_literal, 100);
        assert_eq!(apply(&ops, &basis, 1024), source);
    }

    #[test]
    fn prepended_data_still_matches_blocks() {
        let basis: Vec<u8> = (0u32..4096).map(|i| (i % 241) as u8).collect();
        let mut source = b"prefix!".to_vec();
        source.extend_from_slice(&basis);

        let (ops, stats) = delta_ops(&source, &basis, 1024);
        assert_eq!(stats.bytes_matched, 4096);
        assert_eq!(stats.bytes_literal, 7);
        assert_eq!(apply(&ops, &basis, 1024), source);
    }

    #[test]
    fn middle_overwrite_bounded_literal() {
        // A 512-byte overwrite in the middle: unchanged blocks on both
        // sides are copied, and the literal region is at most one block
        // plus the overwrite minus one byte.
        let block = 1024usize;
        let basis: Vec<u8> = (0u32..8 * 1024).map(|i| (i % 239) as u8).collect();
        let mut source = basis.clone();
        for (i, byte) in source[4096 + 100..4096 + 612].iter_mut().enumerate() {
            *byte = (i % 7) as u8;
        }

        let (ops, stats) = delta_ops(&source, &basis, block as u64);
        assert!(stats.bytes_literal <= (block + 512 - 1) as u64);
        assert!(stats.bytes_matched >= (basis.len() - block - 512) as u64);
        assert_eq!(apply(&ops, &basis, block), source);
    }

    #[test]
    fn aligned_span_minimality_bound() {
        // A change confined to K block-aligned bytes produces at most
        // ceil(K/B) blocks of literal; the rest is copied.
        let block = 1024usize;
        let basis: Vec<u8> = (0u32..16 * 1024).map(|i| (i % 233) as u8).collect();
        let mut source = basis.clone();
        let k = 3 * block;
        for byte in &mut source[4 * block..4 * block + k] {
            *byte = 0xEE;
        }

        let (ops, stats) = delta_ops(&source, &basis, block as u64);
        assert!(stats.bytes_literal <= k as u64);
        assert_eq!(stats.copy_ops, (16 - 3) as u64);
        assert_eq!(apply(&ops, &basis, block), source);
    }

    // ==========================================================================
    // SHORT FINAL BLOCK
    // ==========================================================================

    #[test]
    fn short_tail_block_matched() {
        // Basis ends in a 452-byte short block; the source shifts it by a
        // small prefix. The short block must still be found.
        let basis: Vec<u8> = (0u32..2500).map(|i| (i % 229) as u8).collect();
        let mut source = b"0123456789".to_vec();
        source.extend_from_slice(&basis);

        let (ops, stats) = delta_ops(&source, &basis, 1024);
        // Two full blocks plus the short one.
        assert_eq!(stats.copy_ops, 3);
        assert_eq!(stats.bytes_matched, 2500);
        assert_eq!(stats.bytes_literal, 10);
        assert_eq!(apply(&ops, &basis, 1024), source);
    }

    #[test]
    fn short_block_not_matched_when_absent() {
        let basis: Vec<u8> = (0u32..2500).map(|i| (i % 229) as u8).collect();
        // Source is the two full blocks only; the short tail is gone.
        let source = basis[..2048].to_vec();

        let (ops, stats) = delta_ops(&source, &basis, 1024);
        assert_eq!(stats.copy_ops, 2);
        assert_eq!(stats.bytes_literal, 0);
        assert_eq!(apply(&ops, &basis, 1024), source);
    }

    // ==========================================================================
    // LITERAL CHUNKING
    // ==========================================================================

    #[test]
    fn oversized_literal_split() {
        let source = vec![0x5Au8; 2 * MAX_LITERAL + 123];
        let (ops, stats) = delta_ops(&source, b"", 1024);

        assert_eq!(ops.len(), 3);
        assert!(ops
            .iter()
            .all(|op| matches!(op, Instruction::Literal(d) if d.len() <= MAX_LITERAL)));
        assert_eq!(stats.bytes_literal, source.len() as u64);
        assert_eq!(apply(&ops, b"", 1024), source);
    }

    // ==========================================================================
    // STATS
    // ==========================================================================

    #[test]
    fn match_ratio_bounds() {
        let full = DeltaStats {
            bytes_matched: 100,
            ..Default::default()
        };
        assert!((full.match_ratio() - 1.0).abs() < f64::EPSILON);

        let none = DeltaStats {
            bytes_literal: 100,
            ..Default::default()
        };
        assert!(none.match_ratio().abs() < f64::EPSILON);

        let empty = DeltaStats::default();
        assert!((empty.match_ratio() - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn output_len_accounts_both_kinds() {
        assert_eq!(
            Instruction::Copy {
                block_index: 0,
                len: 512
            }
            .output_len(),
            512
        );
        assert_eq!(Instruction::Literal(vec![0; 7]).output_len(), 7);
    }
}
