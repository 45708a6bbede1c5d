//! # psync
//!
//! rsync-style directory synchronization in pure Rust: a rolling-hash
//! delta engine with adaptive zstd compression over a framed wire
//! protocol.
//!
//! A session connects a sender and a receiver over any pair of byte
//! streams (an OS pipe locally, a shell-tunneled stream remotely). The
//! sender enumerates the source tree into a manifest; the receiver
//! classifies every entry against its own tree and answers with verdicts;
//! files that changed are reduced to copy/literal instruction streams
//! against block signatures of the receiver's copy, so only the bytes
//! that differ cross the wire.
//!
//! ## Features
//!
//! - **Rolling checksum**: Adler-family weak hash with O(1) window slides
//! - **Strong hash**: xxh3-128 block confirmation and whole-file verify
//! - **Streaming**: bounded memory for arbitrary file sizes
//! - **Adaptive compression**: zstd level steered by CPU/network balance
//!
//! ## Example
//!
//! ```no_run
//! use psync::{sync_local, SyncOptions};
//!
//! let opts = SyncOptions {
//!     recursive: true,
//!     ..Default::default()
//! };
//! let stats = sync_local("src-tree".as_ref(), "dst-tree".as_ref(), &opts)?;
//! println!("{}", stats.summary());
//! # Ok::<(), psync::SyncError>(())
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all, clippy::pedantic)]

pub mod checksum;
pub mod compress;
pub mod config;
pub mod controller;
pub mod delta;
pub mod error;
pub mod hash;
pub mod manifest;
pub mod reconstruct;
pub mod session;
pub mod signature;
pub mod stats;
pub mod transport;
pub mod walk;
pub mod wire;

pub use checksum::RollingChecksum;
pub use config::SyncOptions;
pub use delta::{compute_delta, DeltaStats, Instruction};
pub use error::{Result, SyncError};
pub use hash::{FileHasher, StrongHash};
pub use manifest::{ChangeFilter, FileEntry, FileKind, Manifest, Verdict};
pub use session::{run_receiver, run_sender, sync_local};
pub use signature::{block_size_for, BlockSignature, Signature, SignatureIndex};
pub use stats::{SessionSummary, TransferStats};
pub use transport::Transport;
pub use wire::{Frame, FrameTag, MAX_PAYLOAD, WIRE_MAGIC, WIRE_VERSION};
