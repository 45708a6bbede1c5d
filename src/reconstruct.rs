//! File reconstruction on the receiver.
//!
//! Instructions are applied into a temporary file next to the target; the
//! atomic rename after a successful whole-file hash check is the single
//! commit point. A crash at any earlier moment leaves the previous version
//! of the target untouched, and stale temp files are garbage-collected at
//! session start.

use std::fs::{self, File, OpenOptions};
use std::io::{BufWriter, Read, Seek, SeekFrom, Write};
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};

use filetime::FileTime;
use tracing::debug;

use crate::error::{Result, SyncError};
use crate::hash::{FileHasher, StrongHash};
use crate::signature::Signature;

/// Infix marking psync temporary files.
pub const TMP_MARKER: &str = ".psync-tmp-";

static NONCE: AtomicU64 = AtomicU64::new(0);

fn next_nonce() -> u64 {
    let pid = u64::from(std::process::id());
    let seq = NONCE.fetch_add(1, Ordering::Relaxed);
    (pid << 32) ^ seq
}

/// Streaming reconstructor for one target file.
///
/// Copy instructions read from the preserved original through the block
/// table of the signature the receiver built for this file; literal
/// instructions append verbatim. Dropping an unfinished reconstructor
/// unlinks the temp file.
#[derive(Debug)]
pub struct Reconstructor {
    target: PathBuf,
    temp_path: PathBuf,
    writer: Option<BufWriter<File>>,
    basis: Option<BasisReader>,
    hasher: FileHasher,
    bytes_written: u64,
    committed: bool,
}

#[derive(Debug)]
struct BasisReader {
    file: File,
    /// (offset, len) per block index.
    blocks: Vec<(u64, u32)>,
}

impl Reconstructor {
    /// Open a reconstructor for `target`.
    ///
    /// `basis` supplies the preserved original and its signature for delta
    /// transfers; full transfers pass `None` and may only apply literals.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if the temp file cannot be created or the
    /// basis cannot be opened.
    pub fn new(target: &Path, basis: Option<(&Path, &Signature)>) -> Result<Self> {
        if let Some(parent) = target.parent() {
            if !parent.as_os_str().is_empty() {
                fs::create_dir_all(parent)?;
            }
        }

        let file_name = target
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| SyncError::Config(format!("unusable target {}", target.display())))?;
        let temp_path =
            target.with_file_name(format!("{file_name}{TMP_MARKER}{:016x}", next_nonce()));

        let temp = OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(&temp_path)?;

        let basis = match basis {
            Some((path, signature)) => Some(BasisReader {
                file: File::open(path)?,
                blocks: signature
                    .blocks
                    .iter()
                    .map(|block| (block.offset, block.len))
                    .collect(),
            }),
            None => None,
        };

        Ok(Self {
            target: target.to_path_buf(),
            temp_path,
            writer: Some(BufWriter::new(temp)),
            basis,
            hasher: FileHasher::new(),
            bytes_written: 0,
            committed: false,
        })
    }

    /// Apply a copy instruction: read block `block_index` from the basis
    /// and append it.
    ///
    /// # Errors
    ///
    /// Returns `Protocol` for an unknown block index or a length that does
    /// not match the receiver's own signature, `Io` on read/write failure.
    pub fn apply_copy(&mut self, block_index: u32, len: u32) -> Result<()> {
        let Some(basis) = self.basis.as_mut() else {
            return Err(SyncError::Protocol(
                "copy instruction without a basis file".to_string(),
            ));
        };
        let &(offset, block_len) = basis.blocks.get(block_index as usize).ok_or_else(|| {
            SyncError::Protocol(format!("copy references unknown block {block_index}"))
        })?;
        if len != block_len {
            return Err(SyncError::Protocol(format!(
                "copy length {len} does not match block {block_index} length {block_len}"
            )));
        }

        basis.file.seek(SeekFrom::Start(offset))?;
        let mut remaining = len as usize;
        let mut buf = vec![0u8; remaining.min(256 * 1024)];
        let writer = self.writer.as_mut().expect("reconstructor already finished");
        while remaining > 0 {
            let take = remaining.min(buf.len());
            basis.file.read_exact(&mut buf[..take])?;
            writer.write_all(&buf[..take])?;
            self.hasher.update(&buf[..take]);
            remaining -= take;
        }
        self.bytes_written += u64::from(len);
        Ok(())
    }

    /// Append literal bytes.
    ///
    /// # Errors
    ///
    /// Returns an I/O error on write failure.
    pub fn apply_literal(&mut self, data: &[u8]) -> Result<()> {
        let writer = self.writer.as_mut().expect("reconstructor already finished");
        writer.write_all(data)?;
        self.hasher.update(data);
        self.bytes_written += data.len() as u64;
        Ok(())
    }

    /// Bytes produced so far.
    #[must_use]
    pub const fn bytes_written(&self) -> u64 {
        self.bytes_written
    }

    /// Verify against the FILE_END hash and commit.
    ///
    /// On a hash match the temp file atomically replaces the target and
    /// receives the manifest mtime and mode. On a mismatch the temp file
    /// is deleted and the previous target version stays in place.
    ///
    /// # Errors
    ///
    /// Returns `HashMismatch` when verification fails, `Io` on
    /// flush/rename failure.
    pub fn finish(mut self, expected: StrongHash, mtime_ns: i64, mode: u32) -> Result<()> {
        let writer = self.writer.take().expect("reconstructor already finished");
        let file = writer
            .into_inner()
            .map_err(|e| SyncError::Io(e.into_error()))?;
        file.sync_all()?;
        drop(file);

        let actual = self.hasher.finish();
        if actual != expected {
            debug!(target = %self.target.display(), %expected, %actual, "hash mismatch");
            return Err(SyncError::HashMismatch {
                path: self.target.display().to_string(),
            });
        }

        // A directory occupying the target path would make the rename
        // fail; the change filter classifies kind swaps as Full, so this
        // is a normal outcome. Files and symlinks are replaced by the
        // rename itself.
        match fs::symlink_metadata(&self.target) {
            Ok(meta) if meta.is_dir() => fs::remove_dir_all(&self.target)?,
            _ => {}
        }
        fs::rename(&self.temp_path, &self.target)?;
        self.committed = true;

        fs::set_permissions(&self.target, fs::Permissions::from_mode(mode & 0o7777))?;
        let secs = mtime_ns.div_euclid(1_000_000_000);
        let nanos = mtime_ns.rem_euclid(1_000_000_000);
        #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
        filetime::set_file_mtime(&self.target, FileTime::from_unix_time(secs, nanos as u32))?;
        Ok(())
    }

    /// Drop the temp file without committing.
    pub fn abort(self) {
        // Drop handles the unlink.
    }
}

impl Drop for Reconstructor {
    fn drop(&mut self) {
        if !self.committed {
            drop(self.writer.take());
            let _ = fs::remove_file(&self.temp_path);
        }
    }
}

/// Create a directory for a manifest entry, replacing any non-directory
/// occupying the path.
///
/// # Errors
///
/// Returns an I/O error if creation fails.
pub fn materialize_directory(path: &Path, mode: u32) -> Result<()> {
    match fs::symlink_metadata(path) {
        Ok(meta) if !meta.is_dir() => fs::remove_file(path)?,
        _ => {}
    }
    fs::create_dir_all(path)?;
    fs::set_permissions(path, fs::Permissions::from_mode(mode & 0o7777))?;
    Ok(())
}

/// Create or replace a symlink for a manifest entry.
///
/// # Errors
///
/// Returns an I/O error if creation fails.
pub fn materialize_symlink(path: &Path, target: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            fs::create_dir_all(parent)?;
        }
    }
    match fs::symlink_metadata(path) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(path)?,
        Ok(_) => fs::remove_file(path)?,
        Err(_) => {}
    }
    std::os::unix::fs::symlink(target, path)?;
    Ok(())
}

/// Remove leftover temp files under a destination root. Returns how many
/// were removed.
#[must_use]
pub fn clean_stale_temps(root: &Path) -> u64 {
    let mut removed = 0;
    for entry in walkdir::WalkDir::new(root)
        .follow_links(false)
        .into_iter()
        .flatten()
    {
        if entry.file_type().is_file()
            && entry
                .file_name()
                .to_str()
                .is_some_and(|name| name.contains(TMP_MARKER))
            && fs::remove_file(entry.path()).is_ok()
        {
            removed += 1;
        }
    }
    removed
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signature::Signature;

    fn temp_count(dir: &Path) -> usize {
        walkdir::WalkDir::new(dir)
            .into_iter()
            .flatten()
            .filter(|e| {
                e.file_name()
                    .to_str()
                    .is_some_and(|n| n.contains(TMP_MARKER))
            })
            .count()
    }

    #[test]
    fn literal_only_reconstruction() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let content = b"fresh file content";

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(content).unwrap();
        rec.finish(StrongHash::compute(content), 1_000_000_000, 0o644)
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), content);
        assert_eq!(temp_count(dir.path()), 0);
    }

    #[test]
    fn copy_and_literal_reconstruction() {
        let dir = tempfile::tempdir().unwrap();
        let basis_path = dir.path().join("basis.bin");
        let basis: Vec<u8> = (0u32..3000).map(|i| (i % 251) as u8).collect();
        fs::write(&basis_path, &basis).unwrap();
        let signature = Signature::from_bytes(&basis, 1024);

        // Expected: block 1, then a literal, then block 0.
        let mut expected = basis[1024..2048].to_vec();
        expected.extend_from_slice(b"-interlude-");
        expected.extend_from_slice(&basis[..1024]);

        let target = dir.path().join("out.bin");
        let mut rec = Reconstructor::new(&target, Some((&basis_path, &signature))).unwrap();
        rec.apply_copy(1, 1024).unwrap();
        rec.apply_literal(b"-interlude-").unwrap();
        rec.apply_copy(0, 1024).unwrap();
        rec.finish(StrongHash::compute(&expected), 0, 0o600).unwrap();

        assert_eq!(fs::read(&target).unwrap(), expected);
    }

    #[test]
    fn short_final_block_copy() {
        let dir = tempfile::tempdir().unwrap();
        let basis_path = dir.path().join("basis.bin");
        let basis = vec![7u8; 2500];
        fs::write(&basis_path, &basis).unwrap();
        let signature = Signature::from_bytes(&basis, 1024);

        let target = dir.path().join("out.bin");
        let mut rec = Reconstructor::new(&target, Some((&basis_path, &signature))).unwrap();
        rec.apply_copy(2, 452).unwrap();
        rec.finish(StrongHash::compute(&basis[2048..]), 0, 0o644)
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), &basis[2048..]);
    }

    #[test]
    fn hash_mismatch_preserves_original() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        fs::write(&target, b"previous version").unwrap();

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"corrupted transfer").unwrap();
        let err = rec
            .finish(StrongHash::compute(b"what the sender meant"), 0, 0o644)
            .unwrap_err();

        assert!(matches!(err, SyncError::HashMismatch { .. }));
        assert_eq!(fs::read(&target).unwrap(), b"previous version");
        assert_eq!(temp_count(dir.path()), 0);
    }

    #[test]
    fn drop_without_finish_removes_temp() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"partial").unwrap();
        assert_eq!(temp_count(dir.path()), 1);
        drop(rec);
        assert_eq!(temp_count(dir.path()), 0);
        assert!(!target.exists());
    }

    #[test]
    fn replaces_directory_target_with_file() {
        // A kind swap classifies as a full transfer; the commit must
        // clear the old directory, children and all.
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("swap");
        fs::create_dir(&target).unwrap();
        fs::write(target.join("child.txt"), b"inside").unwrap();

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"now a regular file").unwrap();
        rec.finish(StrongHash::compute(b"now a regular file"), 0, 0o644)
            .unwrap();

        assert!(target.is_file());
        assert_eq!(fs::read(&target).unwrap(), b"now a regular file");
        assert_eq!(temp_count(dir.path()), 0);
    }

    #[test]
    fn materialize_directory_replaces_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swap");
        fs::write(&path, b"was a regular file").unwrap();

        materialize_directory(&path, 0o755).unwrap();
        assert!(path.is_dir());
    }

    #[test]
    fn materialize_directory_replaces_symlink() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("swap");
        std::os::unix::fs::symlink("elsewhere", &path).unwrap();

        materialize_directory(&path, 0o755).unwrap();
        assert!(path.is_dir());
        assert!(fs::symlink_metadata(&path).unwrap().is_dir());
    }

    #[test]
    fn replaces_existing_target_atomically() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        fs::write(&target, b"old").unwrap();

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"new content").unwrap();
        rec.finish(StrongHash::compute(b"new content"), 0, 0o644)
            .unwrap();

        assert_eq!(fs::read(&target).unwrap(), b"new content");
    }

    #[test]
    fn copy_without_basis_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut rec = Reconstructor::new(&dir.path().join("out"), None).unwrap();
        let err = rec.apply_copy(0, 100).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn copy_bad_index_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let basis_path = dir.path().join("basis");
        fs::write(&basis_path, vec![0u8; 1024]).unwrap();
        let signature = Signature::from_bytes(&vec![0u8; 1024], 1024);

        let mut rec =
            Reconstructor::new(&dir.path().join("out"), Some((&basis_path, &signature))).unwrap();
        let err = rec.apply_copy(5, 1024).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn copy_wrong_length_is_protocol_error() {
        let dir = tempfile::tempdir().unwrap();
        let basis_path = dir.path().join("basis");
        fs::write(&basis_path, vec![0u8; 1024]).unwrap();
        let signature = Signature::from_bytes(&vec![0u8; 1024], 1024);

        let mut rec =
            Reconstructor::new(&dir.path().join("out"), Some((&basis_path, &signature))).unwrap();
        let err = rec.apply_copy(0, 999).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(_)));
    }

    #[test]
    fn applies_mtime_and_mode() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("out.bin");
        let mtime_ns = 1_600_000_000_500_000_000i64;

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"x").unwrap();
        rec.finish(StrongHash::compute(b"x"), mtime_ns, 0o640).unwrap();

        let meta = fs::metadata(&target).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(meta.mtime(), 1_600_000_000);
        assert_eq!(meta.mtime_nsec(), 500_000_000);
        assert_eq!(meta.mode() & 0o777, 0o640);
    }

    #[test]
    fn creates_missing_parent_directories() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("deep/nested/out.bin");

        let mut rec = Reconstructor::new(&target, None).unwrap();
        rec.apply_literal(b"nested").unwrap();
        rec.finish(StrongHash::compute(b"nested"), 0, 0o644).unwrap();
        assert_eq!(fs::read(&target).unwrap(), b"nested");
    }

    #[test]
    fn clean_stale_temps_removes_leftovers() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(format!("old.bin{TMP_MARKER}deadbeef")),
            b"stale",
        )
        .unwrap();
        fs::write(dir.path().join("real.bin"), b"keep").unwrap();

        assert_eq!(clean_stale_temps(dir.path()), 1);
        assert!(dir.path().join("real.bin").exists());
        assert_eq!(temp_count(dir.path()), 0);
    }

    #[test]
    fn materialize_symlink_replaces_existing() {
        let dir = tempfile::tempdir().unwrap();
        let link = dir.path().join("link");
        fs::write(&link, b"regular file in the way").unwrap();

        materialize_symlink(&link, "somewhere").unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap().to_string_lossy(),
            "somewhere"
        );

        materialize_symlink(&link, "elsewhere").unwrap();
        assert_eq!(
            fs::read_link(&link).unwrap().to_string_lossy(),
            "elsewhere"
        );
    }

    #[test]
    fn materialize_directory_sets_mode() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("made");
        materialize_directory(&path, 0o750).unwrap();
        use std::os::unix::fs::MetadataExt;
        assert_eq!(fs::metadata(&path).unwrap().mode() & 0o777, 0o750);
    }
}
