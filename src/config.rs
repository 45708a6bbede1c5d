//! Session configuration.
//!
//! The CLI (or any embedding program) fills a [`SyncOptions`] record; the
//! session consumes it. Flag parsing itself lives in the binary.

use std::time::Duration;

use crate::wire::feature;

/// Options accepted by a sync session.
#[derive(Debug, Clone)]
pub struct SyncOptions {
    /// Recursive + preserve permissions and times + keep symlinks as
    /// symlinks.
    pub archive: bool,
    /// Observability level; each step lowers the log threshold.
    pub verbose: u8,
    /// Engage the adaptive compression path.
    pub compress: bool,
    /// Descend into directories.
    pub recursive: bool,
    /// Walk and classify, but move no file bytes.
    pub dry_run: bool,
    /// Change filter compares whole-file hashes instead of size+mtime.
    pub checksum: bool,
    /// Never touch a destination newer than the source.
    pub update: bool,
    /// Remove destination paths absent from the manifest.
    pub delete: bool,
    /// Exclude patterns applied during source enumeration.
    pub excludes: Vec<String>,
    /// Emit per-file progress records.
    pub progress: bool,
    /// Abort after this long with no frame activity.
    pub idle_timeout: Duration,
}

impl Default for SyncOptions {
    fn default() -> Self {
        Self {
            archive: false,
            verbose: 0,
            compress: false,
            recursive: false,
            dry_run: false,
            checksum: false,
            update: false,
            delete: false,
            excludes: Vec::new(),
            progress: false,
            idle_timeout: Duration::from_secs(120),
        }
    }
}

impl SyncOptions {
    /// Apply implications between flags; `archive` turns on recursion.
    #[must_use]
    pub fn normalized(mut self) -> Self {
        if self.archive {
            self.recursive = true;
        }
        self
    }

    /// The HELLO feature bits this configuration announces.
    #[must_use]
    pub fn feature_bits(&self) -> u32 {
        let mut bits = 0;
        if self.compress {
            bits |= feature::COMPRESS;
        }
        if self.checksum {
            bits |= feature::CHECKSUM;
        }
        if self.delete {
            bits |= feature::DELETE;
        }
        if self.dry_run {
            bits |= feature::DRY_RUN;
        }
        bits
    }
}
