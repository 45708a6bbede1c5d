//! Framed wire protocol.
//!
//! Every message on the stream is one frame: `tag (1 byte) ‖ length
//! (4 bytes, big-endian, at most 2^24) ‖ payload`. Frames are strictly
//! ordered per direction and never interleave across files. All integers
//! are unsigned big-endian; strings are UTF-8 with a u16 length prefix.

use std::io::{Read, Write};

use crate::error::{Result, SyncError};
use crate::hash::StrongHash;
use crate::manifest::{FileEntry, FileKind, Verdict};
use crate::signature::BlockSignature;
use crate::stats::SessionSummary;

/// Magic bytes opening a HELLO payload.
pub const WIRE_MAGIC: [u8; 4] = *b"PSYN";

/// Protocol version spoken by this implementation.
pub const WIRE_VERSION: u16 = 1;

/// Maximum frame payload length.
pub const MAX_PAYLOAD: usize = 1 << 24;

/// Feature bits announced in HELLO.
pub mod feature {
    /// Peer wants the adaptive compression layer.
    pub const COMPRESS: u32 = 1;
    /// Change filter compares whole-file hashes instead of size+mtime.
    pub const CHECKSUM: u32 = 1 << 1;
    /// Remove destination paths absent from the manifest.
    pub const DELETE: u32 = 1 << 2;
    /// Classify only; no file bytes follow the verdicts.
    pub const DRY_RUN: u32 = 1 << 3;
}

/// Frame tags, one byte on the wire.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FrameTag {
    /// Version and feature negotiation, both directions.
    Hello = 0x01,
    /// One manifest entry, sender to receiver.
    ManifestEntry = 0x02,
    /// End of manifest.
    ManifestEnd = 0x03,
    /// Per-entry classification, receiver to sender.
    Verdict = 0x04,
    /// One basis block signature, receiver to sender.
    SigBlock = 0x05,
    /// End of one file's signatures.
    SigEnd = 0x06,
    /// Copy one receiver-side block.
    InstrCopy = 0x07,
    /// Verbatim bytes.
    InstrLiteral = 0x08,
    /// End of one file's instruction stream, with its whole-file hash.
    FileEnd = 0x09,
    /// Receiver's verdict on a completed file.
    FileAck = 0x0A,
    /// End-of-session totals, both directions.
    Stats = 0x0B,
    /// Fatal error; terminates the session.
    Error = 0x0C,
    /// Compression level announcement.
    CompressionHint = 0x0D,
}

impl FrameTag {
    /// Decode a tag byte.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for a tag outside the closed set.
    pub fn from_u8(value: u8) -> Result<Self> {
        match value {
            0x01 => Ok(Self::Hello),
            0x02 => Ok(Self::ManifestEntry),
            0x03 => Ok(Self::ManifestEnd),
            0x04 => Ok(Self::Verdict),
            0x05 => Ok(Self::SigBlock),
            0x06 => Ok(Self::SigEnd),
            0x07 => Ok(Self::InstrCopy),
            0x08 => Ok(Self::InstrLiteral),
            0x09 => Ok(Self::FileEnd),
            0x0A => Ok(Self::FileAck),
            0x0B => Ok(Self::Stats),
            0x0C => Ok(Self::Error),
            0x0D => Ok(Self::CompressionHint),
            _ => Err(SyncError::Protocol(format!("invalid frame tag {value:#04x}"))),
        }
    }
}

/// Outcome flag in a FILE_END frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileEndStatus {
    /// Instruction stream complete; hash follows.
    Ok = 0,
    /// Sender lost the source mid-file; receiver discards the temp file.
    Failed = 1,
}

/// Receiver's response in a FILE_ACK frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum AckStatus {
    /// File committed.
    Ok = 0,
    /// Reconstruction hash mismatched; sender retries with a full stream.
    HashMismatch = 1,
    /// File abandoned; move on.
    Skipped = 2,
}

/// A decoded frame.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    /// Version/feature negotiation.
    Hello {
        /// Protocol version.
        version: u16,
        /// Feature bits, see [`feature`].
        features: u32,
    },
    /// One manifest entry.
    ManifestEntry(FileEntry),
    /// Manifest complete.
    ManifestEnd,
    /// Classification for one manifest entry.
    Verdict {
        /// Index of the entry in manifest order.
        entry: u32,
        /// The receiver's decision.
        verdict: Verdict,
    },
    /// One basis block signature.
    SigBlock(BlockSignature),
    /// Signatures complete for the current file.
    SigEnd {
        /// Number of SIG_BLOCK frames that preceded.
        block_count: u32,
        /// Size of the basis file they cover.
        basis_size: u64,
    },
    /// Copy a receiver-side block.
    InstrCopy {
        /// Block index in the receiver's signature.
        block_index: u32,
        /// Block length.
        len: u32,
    },
    /// Verbatim bytes.
    InstrLiteral(Vec<u8>),
    /// Instruction stream complete.
    FileEnd {
        /// Whether the sender finished the file.
        status: FileEndStatus,
        /// Whole-file strong hash of the sender's file.
        hash: StrongHash,
    },
    /// Receiver's verdict on the completed file.
    FileAck(AckStatus),
    /// End-of-session totals.
    Stats(SessionSummary),
    /// Fatal error.
    Error {
        /// Error kind code, see [`crate::SyncError::wire_code`].
        code: u8,
        /// Human-readable detail.
        message: String,
    },
    /// New compression level for the announcing direction.
    CompressionHint {
        /// zstd level in `[1, 19]`.
        level: u8,
    },
}

impl Frame {
    /// The tag this frame travels under.
    #[must_use]
    pub const fn tag(&self) -> FrameTag {
        match self {
            Self::Hello { .. } => FrameTag::Hello,
            Self::ManifestEntry(_) => FrameTag::ManifestEntry,
            Self::ManifestEnd => FrameTag::ManifestEnd,
            Self::Verdict { .. } => FrameTag::Verdict,
            Self::SigBlock(_) => FrameTag::SigBlock,
            Self::SigEnd { .. } => FrameTag::SigEnd,
            Self::InstrCopy { .. } => FrameTag::InstrCopy,
            Self::InstrLiteral(_) => FrameTag::InstrLiteral,
            Self::FileEnd { .. } => FrameTag::FileEnd,
            Self::FileAck(_) => FrameTag::FileAck,
            Self::Stats(_) => FrameTag::Stats,
            Self::Error { .. } => FrameTag::Error,
            Self::CompressionHint { .. } => FrameTag::CompressionHint,
        }
    }

    /// Encode the payload bytes (without the tag/length header).
    #[must_use]
    pub fn encode_payload(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        match self {
            Self::Hello { version, features } => {
                buf.extend_from_slice(&WIRE_MAGIC);
                buf.extend_from_slice(&version.to_be_bytes());
                buf.extend_from_slice(&features.to_be_bytes());
            }
            Self::ManifestEntry(entry) => {
                put_string(&mut buf, &entry.path);
                buf.push(entry.kind as u8);
                buf.extend_from_slice(&entry.size.to_be_bytes());
                buf.extend_from_slice(&entry.mtime_ns.to_be_bytes());
                buf.extend_from_slice(&entry.mode.to_be_bytes());
                put_string(&mut buf, entry.link_target.as_deref().unwrap_or(""));
                match entry.content_hash {
                    Some(hash) => {
                        buf.push(1);
                        buf.extend_from_slice(hash.as_bytes());
                    }
                    None => buf.push(0),
                }
            }
            Self::ManifestEnd => {}
            Self::Verdict { entry, verdict } => {
                buf.extend_from_slice(&entry.to_be_bytes());
                buf.push(*verdict as u8);
            }
            Self::SigBlock(block) => {
                buf.extend_from_slice(&block.index.to_be_bytes());
                buf.extend_from_slice(&block.offset.to_be_bytes());
                buf.extend_from_slice(&block.len.to_be_bytes());
                buf.extend_from_slice(&block.weak.to_be_bytes());
                buf.extend_from_slice(block.strong.as_bytes());
            }
            Self::SigEnd {
                block_count,
                basis_size,
            } => {
                buf.extend_from_slice(&block_count.to_be_bytes());
                buf.extend_from_slice(&basis_size.to_be_bytes());
            }
            Self::InstrCopy { block_index, len } => {
                buf.extend_from_slice(&block_index.to_be_bytes());
                buf.extend_from_slice(&len.to_be_bytes());
            }
            Self::InstrLiteral(data) => buf.extend_from_slice(data),
            Self::FileEnd { status, hash } => {
                buf.push(*status as u8);
                buf.extend_from_slice(hash.as_bytes());
            }
            Self::FileAck(status) => buf.push(*status as u8),
            Self::Stats(summary) => {
                buf.extend_from_slice(&summary.files_transferred.to_be_bytes());
                buf.extend_from_slice(&summary.files_skipped.to_be_bytes());
                buf.extend_from_slice(&summary.files_deleted.to_be_bytes());
                buf.extend_from_slice(&summary.bytes_literal.to_be_bytes());
                buf.extend_from_slice(&summary.bytes_matched.to_be_bytes());
                buf.extend_from_slice(&summary.file_errors.to_be_bytes());
            }
            Self::Error { code, message } => {
                buf.push(*code);
                put_string(&mut buf, message);
            }
            Self::CompressionHint { level } => buf.push(*level),
        }
        buf
    }

    /// Decode a payload under the given tag.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on truncated, oversized, or malformed payloads.
    pub fn decode_payload(tag: FrameTag, payload: &[u8]) -> Result<Self> {
        let mut reader = PayloadReader::new(payload);
        let frame = match tag {
            FrameTag::Hello => {
                let magic = reader.take_array::<4>()?;
                if magic != WIRE_MAGIC {
                    return Err(SyncError::Protocol(format!(
                        "bad hello magic {magic:02x?}"
                    )));
                }
                Self::Hello {
                    version: reader.take_u16()?,
                    features: reader.take_u32()?,
                }
            }
            FrameTag::ManifestEntry => {
                let path = reader.take_string()?;
                let kind_byte = reader.take_u8()?;
                let kind = FileKind::from_u8(kind_byte).ok_or_else(|| {
                    SyncError::Protocol(format!("invalid file kind {kind_byte}"))
                })?;
                let size = reader.take_u64()?;
                let mtime_ns = reader.take_i64()?;
                let mode = reader.take_u32()?;
                let target = reader.take_string()?;
                let content_hash = if reader.take_u8()? == 1 {
                    Some(StrongHash::from_bytes(reader.take_array::<16>()?))
                } else {
                    None
                };
                Self::ManifestEntry(FileEntry {
                    path,
                    kind,
                    size,
                    mtime_ns,
                    mode,
                    link_target: (!target.is_empty()).then_some(target),
                    content_hash,
                })
            }
            FrameTag::ManifestEnd => Self::ManifestEnd,
            FrameTag::Verdict => {
                let entry = reader.take_u32()?;
                let verdict_byte = reader.take_u8()?;
                let verdict = Verdict::from_u8(verdict_byte).ok_or_else(|| {
                    SyncError::Protocol(format!("invalid verdict {verdict_byte}"))
                })?;
                Self::Verdict { entry, verdict }
            }
            FrameTag::SigBlock => Self::SigBlock(BlockSignature {
                index: reader.take_u32()?,
                offset: reader.take_u64()?,
                len: reader.take_u32()?,
                weak: reader.take_u32()?,
                strong: StrongHash::from_bytes(reader.take_array::<16>()?),
            }),
            FrameTag::SigEnd => Self::SigEnd {
                block_count: reader.take_u32()?,
                basis_size: reader.take_u64()?,
            },
            FrameTag::InstrCopy => Self::InstrCopy {
                block_index: reader.take_u32()?,
                len: reader.take_u32()?,
            },
            FrameTag::InstrLiteral => {
                let data = payload.to_vec();
                reader.skip_rest();
                Self::InstrLiteral(data)
            }
            FrameTag::FileEnd => {
                let status = match reader.take_u8()? {
                    0 => FileEndStatus::Ok,
                    1 => FileEndStatus::Failed,
                    other => {
                        return Err(SyncError::Protocol(format!(
                            "invalid file-end status {other}"
                        )))
                    }
                };
                Self::FileEnd {
                    status,
                    hash: StrongHash::from_bytes(reader.take_array::<16>()?),
                }
            }
            FrameTag::FileAck => {
                let status = match reader.take_u8()? {
                    0 => AckStatus::Ok,
                    1 => AckStatus::HashMismatch,
                    2 => AckStatus::Skipped,
                    other => {
                        return Err(SyncError::Protocol(format!("invalid ack status {other}")))
                    }
                };
                Self::FileAck(status)
            }
            FrameTag::Stats => Self::Stats(SessionSummary {
                files_transferred: reader.take_u64()?,
                files_skipped: reader.take_u64()?,
                files_deleted: reader.take_u64()?,
                bytes_literal: reader.take_u64()?,
                bytes_matched: reader.take_u64()?,
                file_errors: reader.take_u64()?,
            }),
            FrameTag::Error => Self::Error {
                code: reader.take_u8()?,
                message: reader.take_string()?,
            },
            FrameTag::CompressionHint => Self::CompressionHint {
                level: reader.take_u8()?,
            },
        };
        reader.finish()?;
        Ok(frame)
    }

    /// Write this frame, header and payload, to a stream.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` if the payload exceeds the frame cap, or an I/O
    /// error from the stream.
    pub fn write_to<W: Write>(&self, writer: &mut W) -> Result<()> {
        let payload = self.encode_payload();
        write_raw_frame(writer, self.tag(), &payload)
    }

    /// Read and decode one frame from a stream.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` on malformed input or an I/O error from the
    /// stream (including EOF).
    pub fn read_from<R: Read>(reader: &mut R) -> Result<Self> {
        let (tag, payload) = read_raw_frame(reader)?;
        Self::decode_payload(tag, &payload)
    }

    /// On-wire size of this frame, header included.
    #[must_use]
    pub fn wire_len(&self) -> usize {
        5 + self.encode_payload().len()
    }
}

/// Write a raw frame: tag, big-endian length, payload.
///
/// # Errors
///
/// Returns `Protocol` if the payload exceeds [`MAX_PAYLOAD`].
pub fn write_raw_frame<W: Write>(writer: &mut W, tag: FrameTag, payload: &[u8]) -> Result<()> {
    if payload.len() > MAX_PAYLOAD {
        return Err(SyncError::Protocol(format!(
            "frame payload {} exceeds cap {MAX_PAYLOAD}",
            payload.len()
        )));
    }
    #[allow(clippy::cast_possible_truncation)]
    let len = payload.len() as u32;
    let mut header = [0u8; 5];
    header[0] = tag as u8;
    header[1..5].copy_from_slice(&len.to_be_bytes());
    writer.write_all(&header)?;
    writer.write_all(payload)?;
    Ok(())
}

/// Read a raw frame: tag, length, payload.
///
/// # Errors
///
/// Returns `Protocol` on a bad tag or oversized length, `Io` on stream
/// failure or truncation.
pub fn read_raw_frame<R: Read>(reader: &mut R) -> Result<(FrameTag, Vec<u8>)> {
    let mut header = [0u8; 5];
    reader.read_exact(&mut header)?;
    let tag = FrameTag::from_u8(header[0])?;
    let len = u32::from_be_bytes(header[1..5].try_into().expect("fixed slice")) as usize;
    if len > MAX_PAYLOAD {
        return Err(SyncError::Protocol(format!(
            "frame length {len} exceeds cap {MAX_PAYLOAD}"
        )));
    }
    let mut payload = vec![0u8; len];
    reader.read_exact(&mut payload)?;
    Ok((tag, payload))
}

fn put_string(buf: &mut Vec<u8>, value: &str) {
    let len = u16::try_from(value.len()).unwrap_or(u16::MAX);
    let value = &value.as_bytes()[..len as usize];
    buf.extend_from_slice(&len.to_be_bytes());
    buf.extend_from_slice(value);
}

/// Cursor over a payload with bounds-checked reads.
struct PayloadReader<'a> {
    buf: &'a [u8],
    pos: usize,
}

impl<'a> PayloadReader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf, pos: 0 }
    }

    fn take(&mut self, n: usize) -> Result<&'a [u8]> {
        if self.pos + n > self.buf.len() {
            return Err(SyncError::Protocol(format!(
                "truncated payload: wanted {n} bytes at offset {}, have {}",
                self.pos,
                self.buf.len() - self.pos
            )));
        }
        let slice = &self.buf[self.pos..self.pos + n];
        self.pos += n;
        Ok(slice)
    }

    fn take_array<const N: usize>(&mut self) -> Result<[u8; N]> {
        Ok(self.take(N)?.try_into().expect("exact length"))
    }

    fn take_u8(&mut self) -> Result<u8> {
        Ok(self.take(1)?[0])
    }

    fn take_u16(&mut self) -> Result<u16> {
        Ok(u16::from_be_bytes(self.take_array::<2>()?))
    }

    fn take_u32(&mut self) -> Result<u32> {
        Ok(u32::from_be_bytes(self.take_array::<4>()?))
    }

    fn take_u64(&mut self) -> Result<u64> {
        Ok(u64::from_be_bytes(self.take_array::<8>()?))
    }

    fn take_i64(&mut self) -> Result<i64> {
        Ok(i64::from_be_bytes(self.take_array::<8>()?))
    }

    fn take_string(&mut self) -> Result<String> {
        let len = self.take_u16()? as usize;
        let bytes = self.take(len)?;
        String::from_utf8(bytes.to_vec())
            .map_err(|_| SyncError::Protocol("invalid UTF-8 in string field".to_string()))
    }

    fn skip_rest(&mut self) {
        self.pos = self.buf.len();
    }

    fn finish(&self) -> Result<()> {
        if self.pos != self.buf.len() {
            return Err(SyncError::Protocol(format!(
                "{} trailing bytes in payload",
                self.buf.len() - self.pos
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    fn roundtrip(frame: &Frame) -> Frame {
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        Frame::read_from(&mut Cursor::new(buf)).unwrap()
    }

    fn sample_entry() -> FileEntry {
        FileEntry {
            path: "dir/file.bin".to_string(),
            kind: FileKind::Regular,
            size: 2 * 1024 * 1024,
            mtime_ns: 1_700_000_000_123_456_789,
            mode: 0o644,
            link_target: None,
            content_hash: None,
        }
    }

    // ==========================================================================
    // TAG CODES
    // ==========================================================================

    #[test]
    fn tags_exhaustive() {
        for value in 0x01..=0x0D_u8 {
            assert_eq!(FrameTag::from_u8(value).unwrap() as u8, value);
        }
    }

    #[test]
    fn tag_out_of_range_rejected() {
        assert!(FrameTag::from_u8(0x00).is_err());
        assert!(FrameTag::from_u8(0x0E).is_err());
        assert!(FrameTag::from_u8(0xFF).is_err());
    }

    // ==========================================================================
    // ROUNDTRIPS
    // ==========================================================================

    #[test]
    fn hello_roundtrip() {
        let frame = Frame::Hello {
            version: WIRE_VERSION,
            features: feature::COMPRESS | feature::DELETE,
        };
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn manifest_entry_roundtrip() {
        let frame = Frame::ManifestEntry(sample_entry());
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn manifest_entry_symlink_roundtrip() {
        let mut entry = sample_entry();
        entry.kind = FileKind::Symlink;
        entry.link_target = Some("../target".to_string());
        let frame = Frame::ManifestEntry(entry);
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn manifest_entry_with_hash_roundtrip() {
        let mut entry = sample_entry();
        entry.content_hash = Some(StrongHash::compute(b"content"));
        let frame = Frame::ManifestEntry(entry);
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn manifest_end_roundtrip() {
        assert_eq!(roundtrip(&Frame::ManifestEnd), Frame::ManifestEnd);
    }

    #[test]
    fn verdict_roundtrip() {
        for verdict in [Verdict::Skip, Verdict::Full, Verdict::Delta] {
            let frame = Frame::Verdict { entry: 7, verdict };
            assert_eq!(roundtrip(&frame), frame);
        }
    }

    #[test]
    fn sig_block_roundtrip() {
        let frame = Frame::SigBlock(BlockSignature {
            index: 3,
            offset: 3 * 128 * 1024,
            len: 128 * 1024,
            weak: 0xDEAD_BEEF,
            strong: StrongHash::compute(b"block content"),
        });
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn sig_end_roundtrip() {
        let frame = Frame::SigEnd {
            block_count: 16,
            basis_size: 2 * 1024 * 1024,
        };
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn instr_roundtrips() {
        let copy = Frame::InstrCopy {
            block_index: 9,
            len: 128 * 1024,
        };
        assert_eq!(roundtrip(&copy), copy);

        let literal = Frame::InstrLiteral(vec![0xAB; 1000]);
        assert_eq!(roundtrip(&literal), literal);

        let empty = Frame::InstrLiteral(Vec::new());
        assert_eq!(roundtrip(&empty), empty);
    }

    #[test]
    fn file_end_roundtrip() {
        let frame = Frame::FileEnd {
            status: FileEndStatus::Ok,
            hash: StrongHash::compute(b"whole file"),
        };
        assert_eq!(roundtrip(&frame), frame);

        let failed = Frame::FileEnd {
            status: FileEndStatus::Failed,
            hash: StrongHash::zero(),
        };
        assert_eq!(roundtrip(&failed), failed);
    }

    #[test]
    fn file_ack_roundtrip() {
        for status in [AckStatus::Ok, AckStatus::HashMismatch, AckStatus::Skipped] {
            let frame = Frame::FileAck(status);
            assert_eq!(roundtrip(&frame), frame);
        }
    }

    #[test]
    fn stats_roundtrip() {
        let frame = Frame::Stats(SessionSummary {
            files_transferred: 5,
            files_skipped: 3,
            files_deleted: 1,
            bytes_literal: 10_240,
            bytes_matched: 2 * 1024 * 1024,
            file_errors: 0,
        });
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn error_roundtrip() {
        let frame = Frame::Error {
            code: 6,
            message: "session timed out".to_string(),
        };
        assert_eq!(roundtrip(&frame), frame);
    }

    #[test]
    fn compression_hint_roundtrip() {
        let frame = Frame::CompressionHint { level: 11 };
        assert_eq!(roundtrip(&frame), frame);
    }

    // ==========================================================================
    // MALFORMED INPUT
    // ==========================================================================

    #[test]
    fn bad_tag_is_protocol_error() {
        let bytes = [0xEEu8, 0, 0, 0, 0];
        let err = Frame::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn oversized_length_is_protocol_error() {
        let mut bytes = vec![FrameTag::InstrLiteral as u8];
        bytes.extend_from_slice(&(MAX_PAYLOAD as u32 + 1).to_be_bytes());
        let err = Frame::read_from(&mut Cursor::new(bytes)).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn oversized_write_rejected() {
        let mut sink = Vec::new();
        let err =
            write_raw_frame(&mut sink, FrameTag::InstrLiteral, &vec![0u8; MAX_PAYLOAD + 1])
                .unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn truncated_payload_errors() {
        // Header promises 10 bytes, stream carries 4.
        let mut bytes = vec![FrameTag::SigEnd as u8];
        bytes.extend_from_slice(&10u32.to_be_bytes());
        bytes.extend_from_slice(&[1, 2, 3, 4]);
        assert!(Frame::read_from(&mut Cursor::new(bytes)).is_err());
    }

    #[test]
    fn short_payload_for_tag_errors() {
        // A SIG_END payload must be 12 bytes; deliver 2.
        let err = Frame::decode_payload(FrameTag::SigEnd, &[0, 0]).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn trailing_garbage_rejected() {
        let mut payload = Frame::CompressionHint { level: 3 }.encode_payload();
        payload.push(0xFF);
        let err = Frame::decode_payload(FrameTag::CompressionHint, &payload).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn bad_hello_magic_rejected() {
        let mut payload = Frame::Hello {
            version: 1,
            features: 0,
        }
        .encode_payload();
        payload[0] = b'X';
        let err = Frame::decode_payload(FrameTag::Hello, &payload).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn invalid_utf8_path_rejected() {
        let mut payload = Vec::new();
        payload.extend_from_slice(&2u16.to_be_bytes());
        payload.extend_from_slice(&[0xFF, 0xFE]);
        let err = Frame::decode_payload(FrameTag::ManifestEntry, &payload).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn multiple_frames_in_sequence() {
        let frames = vec![
            Frame::Hello {
                version: 1,
                features: 0,
            },
            Frame::ManifestEntry(sample_entry()),
            Frame::ManifestEnd,
            Frame::Verdict {
                entry: 0,
                verdict: Verdict::Delta,
            },
        ];

        let mut buf = Vec::new();
        for frame in &frames {
            frame.write_to(&mut buf).unwrap();
        }

        let mut cursor = Cursor::new(buf);
        for expected in &frames {
            assert_eq!(&Frame::read_from(&mut cursor).unwrap(), expected);
        }
    }

    #[test]
    fn wire_len_matches_encoding() {
        let frame = Frame::InstrLiteral(vec![1, 2, 3]);
        let mut buf = Vec::new();
        frame.write_to(&mut buf).unwrap();
        assert_eq!(frame.wire_len(), buf.len());
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use proptest::prelude::*;
    use std::io::Cursor;

    proptest! {
        /// Any legal frame survives encode/decode unchanged.
        #[test]
        fn literal_roundtrip(data in prop::collection::vec(any::<u8>(), 0..4096)) {
            let frame = Frame::InstrLiteral(data);
            let mut buf = Vec::new();
            frame.write_to(&mut buf).unwrap();
            prop_assert_eq!(Frame::read_from(&mut Cursor::new(buf)).unwrap(), frame);
        }

        #[test]
        fn copy_roundtrip(block_index in any::<u32>(), len in any::<u32>()) {
            let frame = Frame::InstrCopy { block_index, len };
            let mut buf = Vec::new();
            frame.write_to(&mut buf).unwrap();
            prop_assert_eq!(Frame::read_from(&mut Cursor::new(buf)).unwrap(), frame);
        }

        #[test]
        fn hello_roundtrip(version in any::<u16>(), features in any::<u32>()) {
            let frame = Frame::Hello { version, features };
            let mut buf = Vec::new();
            frame.write_to(&mut buf).unwrap();
            prop_assert_eq!(Frame::read_from(&mut Cursor::new(buf)).unwrap(), frame);
        }

        #[test]
        fn error_roundtrip(code in any::<u8>(), message in "[ -~]{0,200}") {
            let frame = Frame::Error { code, message };
            let mut buf = Vec::new();
            frame.write_to(&mut buf).unwrap();
            prop_assert_eq!(Frame::read_from(&mut Cursor::new(buf)).unwrap(), frame);
        }

        /// Truncating an encoded frame anywhere never panics and always
        /// errors.
        #[test]
        fn truncation_always_errors(
            cut in 0usize..20,
            data in prop::collection::vec(any::<u8>(), 1..64)
        ) {
            let frame = Frame::InstrLiteral(data);
            let mut buf = Vec::new();
            frame.write_to(&mut buf).unwrap();
            let cut = cut.min(buf.len() - 1);
            let truncated = &buf[..cut];
            prop_assert!(Frame::read_from(&mut Cursor::new(truncated)).is_err());
        }
    }
}
