//! Session transfer counters.
//!
//! Purely observational: nothing here participates in correctness. The
//! counters are owned by the session driver and updated from one thread.

use std::fmt;
use std::time::Duration;

/// Counters maintained across one session.
#[derive(Debug, Clone, Default)]
pub struct TransferStats {
    /// Entries enumerated by the walker.
    pub files_walked: u64,
    /// Entries classified Skip.
    pub files_skipped: u64,
    /// Regular files fully reconstructed (delta or full).
    pub files_transferred: u64,
    /// Extraneous destination paths removed.
    pub files_deleted: u64,
    /// Files abandoned after per-file errors.
    pub file_errors: u64,
    /// Bytes read from source files.
    pub bytes_read: u64,
    /// Literal bytes sent on the wire (pre-compression).
    pub bytes_literal: u64,
    /// Bytes elided by copy instructions.
    pub bytes_matched: u64,
    /// Compressed bytes written to the transport.
    pub bytes_on_wire: u64,
    /// Frames sent.
    pub frames_sent: u64,
    /// Frames received.
    pub frames_received: u64,
    /// Session wall time.
    pub elapsed: Duration,
}

impl TransferStats {
    /// Fresh zeroed counters.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Condense into the summary exchanged in STATS frames.
    #[must_use]
    pub const fn summary(&self) -> SessionSummary {
        SessionSummary {
            files_transferred: self.files_transferred,
            files_skipped: self.files_skipped,
            files_deleted: self.files_deleted,
            bytes_literal: self.bytes_literal,
            bytes_matched: self.bytes_matched,
            file_errors: self.file_errors,
        }
    }
}

/// The end-of-session totals carried in a STATS frame.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SessionSummary {
    /// Regular files reconstructed.
    pub files_transferred: u64,
    /// Entries skipped as already up to date.
    pub files_skipped: u64,
    /// Extraneous paths deleted.
    pub files_deleted: u64,
    /// Literal bytes transferred.
    pub bytes_literal: u64,
    /// Bytes satisfied from receiver-side blocks.
    pub bytes_matched: u64,
    /// Files that failed and were left untouched.
    pub file_errors: u64,
}

impl fmt::Display for SessionSummary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} transferred, {} skipped, {} deleted, {} literal bytes, {} matched bytes",
            self.files_transferred,
            self.files_skipped,
            self.files_deleted,
            self.bytes_literal,
            self.bytes_matched,
        )?;
        if self.file_errors > 0 {
            write!(f, ", {} errors", self.file_errors)?;
        }
        Ok(())
    }
}
