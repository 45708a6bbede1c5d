//! Error types for psync operations.

use thiserror::Error;

/// Errors that can occur during a sync session.
///
/// Errors are propagated as values; nothing in the protocol path unwinds.
/// Each variant maps onto one of the process exit codes via
/// [`SyncError::exit_code`].
#[derive(Error, Debug)]
pub enum SyncError {
    /// Invalid configuration (bad flag combination, unusable paths).
    #[error("configuration error: {0}")]
    Config(String),

    /// I/O error during file or transport operations.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Malformed frame, unknown tag, or oversized length on the wire.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Peers speak incompatible protocol versions.
    #[error("version mismatch: local {local}, remote {remote}")]
    VersionMismatch {
        /// Version spoken by this peer.
        local: u16,
        /// Version announced by the remote peer.
        remote: u16,
    },

    /// Reconstructed file hash does not match the hash in FILE_END.
    #[error("hash mismatch for {path}")]
    HashMismatch {
        /// Relative path of the affected file.
        path: String,
    },

    /// No frame activity in either direction for the idle-timeout window.
    #[error("session timed out after {seconds}s of inactivity")]
    Timeout {
        /// Configured idle timeout in seconds.
        seconds: u64,
    },

    /// Session cancelled by the peer or the environment.
    #[error("session cancelled: {0}")]
    Cancelled(String),
}

impl SyncError {
    /// Map this error onto the process exit code contract.
    ///
    /// 0 success, 1 configuration, 2 protocol, 3 I/O, 4 hash mismatch,
    /// 5 cancelled.
    #[must_use]
    pub const fn exit_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Protocol(_) | Self::VersionMismatch { .. } => 2,
            Self::Io(_) | Self::Timeout { .. } => 3,
            Self::HashMismatch { .. } => 4,
            Self::Cancelled(_) => 5,
        }
    }

    /// Single-byte error code carried in ERROR frames.
    #[must_use]
    pub const fn wire_code(&self) -> u8 {
        match self {
            Self::Config(_) => 1,
            Self::Io(_) => 2,
            Self::Protocol(_) => 3,
            Self::VersionMismatch { .. } => 4,
            Self::HashMismatch { .. } => 5,
            Self::Timeout { .. } => 6,
            Self::Cancelled(_) => 7,
        }
    }
}

/// Result type for psync operations.
pub type Result<T> = std::result::Result<T, SyncError>;
