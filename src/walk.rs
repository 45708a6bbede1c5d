//! Source-tree enumeration with exclude filtering.
//!
//! Walks a root in deterministic order, applies exclude globs with early
//! directory pruning, and yields manifest entries. Unreadable entries are
//! logged and counted, never fatal: a file vanishing mid-walk costs that
//! file, not the session.

use std::fs::Metadata;
use std::os::unix::fs::MetadataExt;
use std::path::Path;

use globset::{Glob, GlobSet, GlobSetBuilder};
use tracing::warn;
use walkdir::WalkDir;

use crate::error::{Result, SyncError};
use crate::hash::StrongHash;
use crate::manifest::{FileEntry, FileKind, Manifest};

/// Walker configuration.
#[derive(Debug, Clone, Default)]
pub struct WalkOptions {
    /// Descend into directories.
    pub recursive: bool,
    /// Exclude patterns, glob syntax (`*`, `?`, `**`, literal prefixes).
    pub excludes: Vec<String>,
    /// Compute whole-file hashes for regular files (checksum mode).
    pub hash_contents: bool,
}

/// Result of enumerating a tree.
#[derive(Debug)]
pub struct WalkOutcome {
    /// Entries in manifest order.
    pub manifest: Manifest,
    /// Entries dropped due to per-file I/O errors.
    pub errors: u64,
}

/// Compile exclude patterns.
///
/// # Errors
///
/// Returns `Config` when a pattern is not valid glob syntax.
pub fn build_excludes(patterns: &[String]) -> Result<GlobSet> {
    let mut builder = GlobSetBuilder::new();
    for pattern in patterns {
        let glob = Glob::new(pattern)
            .map_err(|e| SyncError::Config(format!("bad exclude pattern {pattern:?}: {e}")))?;
        builder.add(glob);
    }
    builder
        .build()
        .map_err(|e| SyncError::Config(format!("exclude set: {e}")))
}

/// Enumerate `root` into a manifest.
///
/// A missing root yields an empty manifest; the receiver walks a
/// destination that may not exist yet. A root that is itself a regular
/// file or symlink yields a single entry named after the file.
///
/// # Errors
///
/// Returns `Config` for invalid exclude patterns; per-entry I/O failures
/// are counted in the outcome instead.
pub fn walk_tree(root: &Path, options: &WalkOptions) -> Result<WalkOutcome> {
    let excludes = build_excludes(&options.excludes)?;
    let mut entries = Vec::new();
    let mut errors = 0u64;

    let root_meta = match std::fs::symlink_metadata(root) {
        Ok(meta) => meta,
        Err(_) => {
            return Ok(WalkOutcome {
                manifest: Manifest::new(),
                errors: 0,
            })
        }
    };

    if !root_meta.is_dir() {
        let name = root
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        if !is_excluded(&excludes, &name) {
            match make_entry(root, name, &root_meta, options.hash_contents) {
                Ok(entry) => entries.push(entry),
                Err(err) => {
                    warn!(path = %root.display(), error = %err, "skipping unreadable entry");
                    errors += 1;
                }
            }
        }
        return Ok(WalkOutcome {
            manifest: Manifest::from_entries(entries),
            errors,
        });
    }

    let max_depth = if options.recursive { usize::MAX } else { 1 };
    let mut walker = WalkDir::new(root)
        .min_depth(1)
        .max_depth(max_depth)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter();

    while let Some(item) = walker.next() {
        let entry = match item {
            Ok(entry) => entry,
            Err(err) => {
                warn!(error = %err, "skipping unreadable entry");
                errors += 1;
                continue;
            }
        };

        let Some(rel) = relative_path(root, entry.path()) else {
            warn!(path = %entry.path().display(), "skipping non-UTF-8 path");
            errors += 1;
            continue;
        };

        if is_excluded(&excludes, &rel) {
            // Prune excluded directories instead of walking into them.
            if entry.file_type().is_dir() {
                walker.skip_current_dir();
            }
            continue;
        }

        let meta = match entry.metadata() {
            Ok(meta) => meta,
            Err(err) => {
                warn!(path = %rel, error = %err, "skipping unreadable entry");
                errors += 1;
                continue;
            }
        };

        match make_entry(entry.path(), rel, &meta, options.hash_contents) {
            Ok(file_entry) => entries.push(file_entry),
            Err(err) => {
                warn!(path = %entry.path().display(), error = %err, "skipping unreadable entry");
                errors += 1;
            }
        }
    }

    Ok(WalkOutcome {
        manifest: Manifest::from_entries(entries),
        errors,
    })
}

/// Relative path with forward slashes, or `None` for non-UTF-8 names.
fn relative_path(root: &Path, path: &Path) -> Option<String> {
    let rel = path.strip_prefix(root).ok()?;
    let mut out = String::new();
    for component in rel.components() {
        if !out.is_empty() {
            out.push('/');
        }
        out.push_str(component.as_os_str().to_str()?);
    }
    Some(out)
}

/// Match the relative path or its final component against the exclude set.
fn is_excluded(excludes: &GlobSet, rel: &str) -> bool {
    if excludes.is_empty() {
        return false;
    }
    if excludes.is_match(rel) {
        return true;
    }
    rel.rsplit('/')
        .next()
        .is_some_and(|name| excludes.is_match(name))
}

fn make_entry(
    path: &Path,
    rel: String,
    meta: &Metadata,
    hash_contents: bool,
) -> Result<FileEntry> {
    let file_type = meta.file_type();

    let (kind, size, link_target) = if file_type.is_symlink() {
        let target = std::fs::read_link(path)?;
        (
            FileKind::Symlink,
            0,
            Some(target.to_string_lossy().into_owned()),
        )
    } else if file_type.is_dir() {
        (FileKind::Directory, 0, None)
    } else {
        (FileKind::Regular, meta.len(), None)
    };

    let content_hash = if hash_contents && kind == FileKind::Regular {
        let mut file = std::fs::File::open(path)?;
        Some(StrongHash::compute_streaming(&mut file)?)
    } else {
        None
    };

    Ok(FileEntry {
        path: rel,
        kind,
        size,
        mtime_ns: mtime_nanos(meta),
        mode: meta.mode() & 0o7777,
        link_target,
        content_hash,
    })
}

/// Modification time as nanoseconds since the epoch.
fn mtime_nanos(meta: &Metadata) -> i64 {
    meta.mtime()
        .saturating_mul(1_000_000_000)
        .saturating_add(meta.mtime_nsec())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn options() -> WalkOptions {
        WalkOptions {
            recursive: true,
            ..Default::default()
        }
    }

    #[test]
    fn walks_tree_in_order() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"inner").unwrap();
        fs::write(dir.path().join("a.txt"), b"top").unwrap();

        let outcome = walk_tree(dir.path(), &options()).unwrap();
        let paths: Vec<&str> = outcome
            .manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, ["a.txt", "sub", "sub/inner.txt"]);
        assert_eq!(outcome.errors, 0);
    }

    #[test]
    fn parent_precedes_descendants_with_dotted_sibling() {
        // "a.txt" sorts between "a" and "a/x" lexicographically; the
        // manifest must still put the directory before its children.
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("a")).unwrap();
        fs::write(dir.path().join("a/x"), b"x").unwrap();
        fs::write(dir.path().join("a.txt"), b"t").unwrap();

        let outcome = walk_tree(dir.path(), &options()).unwrap();
        let paths: Vec<&str> = outcome
            .manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, ["a", "a.txt", "a/x"]);
    }

    #[test]
    fn non_recursive_stays_shallow() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/inner.txt"), b"inner").unwrap();
        fs::write(dir.path().join("top.txt"), b"top").unwrap();

        let outcome = walk_tree(
            dir.path(),
            &WalkOptions {
                recursive: false,
                ..Default::default()
            },
        )
        .unwrap();
        let paths: Vec<&str> = outcome
            .manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, ["sub", "top.txt"]);
    }

    #[test]
    fn excludes_prune_directories() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("target")).unwrap();
        fs::write(dir.path().join("target/artifact.bin"), b"big").unwrap();
        fs::write(dir.path().join("keep.txt"), b"keep").unwrap();

        let outcome = walk_tree(
            dir.path(),
            &WalkOptions {
                recursive: true,
                excludes: vec!["target".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        let paths: Vec<&str> = outcome
            .manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, ["keep.txt"]);
    }

    #[test]
    fn excludes_match_file_names_anywhere() {
        let dir = tempfile::tempdir().unwrap();
        fs::create_dir(dir.path().join("sub")).unwrap();
        fs::write(dir.path().join("sub/junk.tmp"), b"x").unwrap();
        fs::write(dir.path().join("sub/real.txt"), b"y").unwrap();

        let outcome = walk_tree(
            dir.path(),
            &WalkOptions {
                recursive: true,
                excludes: vec!["*.tmp".to_string()],
                ..Default::default()
            },
        )
        .unwrap();
        let paths: Vec<&str> = outcome
            .manifest
            .entries()
            .iter()
            .map(|e| e.path.as_str())
            .collect();
        assert_eq!(paths, ["sub", "sub/real.txt"]);
    }

    #[test]
    fn bad_exclude_pattern_is_config_error() {
        let dir = tempfile::tempdir().unwrap();
        let err = walk_tree(
            dir.path(),
            &WalkOptions {
                excludes: vec!["[".to_string()],
                ..Default::default()
            },
        )
        .unwrap_err();
        assert!(matches!(err, SyncError::Config(_)));
    }

    #[test]
    fn missing_root_is_empty() {
        let dir = tempfile::tempdir().unwrap();
        let outcome = walk_tree(&dir.path().join("nope"), &options()).unwrap();
        assert!(outcome.manifest.is_empty());
    }

    #[test]
    fn single_file_root() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("solo.bin");
        fs::write(&file, b"alone").unwrap();

        let outcome = walk_tree(&file, &options()).unwrap();
        assert_eq!(outcome.manifest.len(), 1);
        let entry = &outcome.manifest.entries()[0];
        assert_eq!(entry.path, "solo.bin");
        assert_eq!(entry.kind, FileKind::Regular);
        assert_eq!(entry.size, 5);
    }

    #[test]
    fn symlink_captured_with_target() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("real.txt"), b"data").unwrap();
        std::os::unix::fs::symlink("real.txt", dir.path().join("link")).unwrap();

        let outcome = walk_tree(dir.path(), &options()).unwrap();
        let link = outcome
            .manifest
            .entries()
            .iter()
            .find(|e| e.path == "link")
            .unwrap();
        assert_eq!(link.kind, FileKind::Symlink);
        assert_eq!(link.link_target.as_deref(), Some("real.txt"));
    }

    #[test]
    fn hash_contents_populates_entry_hash() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("hashed.bin"), b"hash me").unwrap();

        let outcome = walk_tree(
            dir.path(),
            &WalkOptions {
                recursive: true,
                hash_contents: true,
                ..Default::default()
            },
        )
        .unwrap();
        let entry = &outcome.manifest.entries()[0];
        assert_eq!(entry.content_hash, Some(StrongHash::compute(b"hash me")));
    }

    #[test]
    fn mode_bits_masked() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(dir.path().join("m"), b"x").unwrap();

        let outcome = walk_tree(dir.path(), &options()).unwrap();
        assert!(outcome.manifest.entries()[0].mode <= 0o7777);
    }
}
