//! File manifest model and the receiver-side change filter.
//!
//! A manifest is the ordered list of [`FileEntry`] records describing the
//! source tree. Paths are relative, forward-slash separated and unique;
//! lexicographic order guarantees every directory precedes its
//! descendants.

use std::fs::File;
use std::path::{Path, PathBuf};

use rustc_hash::FxHashMap;

use crate::error::Result;
use crate::hash::StrongHash;
use crate::signature::block_size_for;

/// Kind of filesystem object a manifest entry describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum FileKind {
    /// Regular file.
    Regular = 0,
    /// Directory.
    Directory = 1,
    /// Symbolic link.
    Symlink = 2,
}

impl FileKind {
    /// Decode from the wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Regular),
            1 => Some(Self::Directory),
            2 => Some(Self::Symlink),
            _ => None,
        }
    }
}

/// One logical filesystem object in the sync set.
///
/// Immutable for the duration of a session once produced by the walker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileEntry {
    /// Relative path, forward-slash separated.
    pub path: String,
    /// Object kind.
    pub kind: FileKind,
    /// Size in bytes (zero for directories and symlinks).
    pub size: u64,
    /// Modification time, nanoseconds since the epoch.
    pub mtime_ns: i64,
    /// Mode bits; the low 12 bits are meaningful.
    pub mode: u32,
    /// Symlink target, present only for symlinks.
    pub link_target: Option<String>,
    /// Whole-file strong hash, carried only in checksum mode.
    pub content_hash: Option<StrongHash>,
}

impl FileEntry {
    /// Whether this entry describes a regular file.
    #[must_use]
    pub const fn is_regular(&self) -> bool {
        matches!(self.kind, FileKind::Regular)
    }

    /// Resolve this entry against a root directory.
    #[must_use]
    pub fn resolve(&self, root: &Path) -> PathBuf {
        root.join(&self.path)
    }
}

/// Ordered collection of manifest entries.
#[derive(Debug, Clone, Default)]
pub struct Manifest {
    entries: Vec<FileEntry>,
}

impl Manifest {
    /// Empty manifest.
    #[must_use]
    pub const fn new() -> Self {
        Self {
            entries: Vec::new(),
        }
    }

    /// Build from entries, enforcing order and uniqueness.
    #[must_use]
    pub fn from_entries(mut entries: Vec<FileEntry>) -> Self {
        entries.sort_by(|a, b| a.path.cmp(&b.path));
        entries.dedup_by(|a, b| a.path == b.path);
        Self { entries }
    }

    /// Append an entry received in wire order.
    pub fn push(&mut self, entry: FileEntry) {
        debug_assert!(
            self.entries
                .last()
                .is_none_or(|prev| prev.path < entry.path),
            "manifest entries must arrive in ascending path order"
        );
        self.entries.push(entry);
    }

    /// Entries in manifest order.
    #[must_use]
    pub fn entries(&self) -> &[FileEntry] {
        &self.entries
    }

    /// Number of entries.
    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    /// Whether the manifest is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Index entries by path for O(1) lookup.
    #[must_use]
    pub fn by_path(&self) -> FxHashMap<&str, &FileEntry> {
        self.entries
            .iter()
            .map(|entry| (entry.path.as_str(), entry))
            .collect()
    }
}

/// The receiver's per-file decision, sent back in a VERDICT frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Verdict {
    /// Destination is already up to date.
    Skip = 0,
    /// Transfer the whole file; no usable basis.
    Full = 1,
    /// Run the signature/delta exchange.
    Delta = 2,
}

impl Verdict {
    /// Decode from the wire byte.
    #[must_use]
    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Self::Skip),
            1 => Some(Self::Full),
            2 => Some(Self::Delta),
            _ => None,
        }
    }
}

/// Receiver-side triage of manifest entries against the local tree.
///
/// The quick check follows the classic rule: equal sizes with a source no
/// newer than the destination mean the file is unchanged. Checksum mode
/// replaces the time comparison with a whole-file hash comparison against
/// the hash carried in the manifest.
#[derive(Debug)]
pub struct ChangeFilter {
    dest_root: PathBuf,
    checksum: bool,
    update: bool,
}

impl ChangeFilter {
    /// Build a filter rooted at the destination directory.
    #[must_use]
    pub fn new(dest_root: &Path, checksum: bool, update: bool) -> Self {
        Self {
            dest_root: dest_root.to_path_buf(),
            checksum,
            update,
        }
    }

    /// Classify one manifest entry against the local walker output.
    ///
    /// # Errors
    ///
    /// Returns an I/O error only in checksum mode, when hashing the local
    /// file fails.
    pub fn classify(&self, src: &FileEntry, local: Option<&FileEntry>) -> Result<Verdict> {
        let Some(dst) = local else {
            return Ok(Verdict::Full);
        };

        if dst.kind != src.kind {
            return Ok(Verdict::Full);
        }

        match src.kind {
            FileKind::Directory => Ok(Verdict::Skip),
            FileKind::Symlink => {
                if src.link_target == dst.link_target {
                    Ok(Verdict::Skip)
                } else {
                    Ok(Verdict::Full)
                }
            }
            FileKind::Regular => self.classify_regular(src, dst),
        }
    }

    fn classify_regular(&self, src: &FileEntry, dst: &FileEntry) -> Result<Verdict> {
        if self.update && dst.mtime_ns > src.mtime_ns {
            return Ok(Verdict::Skip);
        }

        if self.checksum {
            if let Some(expected) = src.content_hash {
                if src.size == dst.size && self.local_hash(&dst.path)? == expected {
                    return Ok(Verdict::Skip);
                }
            }
        } else if src.size == dst.size && src.mtime_ns <= dst.mtime_ns.saturating_add(1) {
            return Ok(Verdict::Skip);
        }

        let block = block_size_for(src.size);
        if block == 0 || dst.size < block {
            return Ok(Verdict::Full);
        }
        Ok(Verdict::Delta)
    }

    fn local_hash(&self, rel_path: &str) -> Result<StrongHash> {
        let mut file = File::open(self.dest_root.join(rel_path))?;
        Ok(StrongHash::compute_streaming(&mut file)?)
    }
}
