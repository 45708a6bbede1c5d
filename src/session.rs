//! The sender/receiver session state machines.
//!
//! Per peer the session runs three execution contexts: a reader thread
//! decoding frames into a bounded queue, a writer thread draining a
//! bounded queue onto the (optionally compressed) transport, and the main
//! state machine. The transport halves are each owned by exactly one
//! thread; the queues are the only coupling.
//!
//! Phase sequence: `Hello → Manifest → per-file {Verdict → [Sig → Instr →
//! FileEnd → Ack]} → Stats`. The sender never starts file N+1's
//! instruction stream before FILE_ACK for N.

use std::fs::File;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender};
use tracing::{debug, info, warn};

use crate::compress::{StreamReader, StreamWriter};
use crate::config::SyncOptions;
use crate::controller::{CompressionController, INITIAL_LEVEL};
use crate::delta::{compute_delta, stream_all_literal, DeltaStats, Instruction};
use crate::error::{Result, SyncError};
use crate::hash::{FileHasher, StrongHash};
use crate::manifest::{ChangeFilter, FileEntry, FileKind, Manifest, Verdict};
use crate::reconstruct::{
    clean_stale_temps, materialize_directory, materialize_symlink, Reconstructor,
};
use crate::signature::{block_size_for, Signature};
use crate::stats::TransferStats;
use crate::transport::Transport;
use crate::walk::{walk_tree, WalkOptions};
use crate::wire::{feature, AckStatus, FileEndStatus, Frame, WIRE_VERSION};

/// Depth of the inbound and outbound frame queues, fixed at session start.
const QUEUE_DEPTH: usize = 64;

/// Run the sending side of a session over `transport`.
///
/// # Errors
///
/// Returns the first fatal error: protocol violations, version mismatch,
/// transport loss, timeout, or cancellation. Per-file failures are
/// counted, logged, and survived.
pub fn run_sender(transport: Transport, source_root: &Path, opts: &SyncOptions) -> Result<TransferStats> {
    let opts = opts.clone().normalized();
    let started = Instant::now();
    let mut stats = TransferStats::new();

    let outcome = walk_tree(
        source_root,
        &WalkOptions {
            recursive: opts.recursive,
            excludes: opts.excludes.clone(),
            hash_contents: opts.checksum,
        },
    )?;
    let manifest = outcome.manifest;
    stats.file_errors += outcome.errors;
    stats.files_walked = manifest.len() as u64;

    // A file root enumerates as a single entry named after the file, so
    // entries resolve against its parent directory.
    let source_base = if std::fs::symlink_metadata(source_root).is_ok_and(|meta| !meta.is_dir()) {
        source_root.parent().unwrap_or(Path::new("")).to_path_buf()
    } else {
        source_root.to_path_buf()
    };

    let (reader, writer) = transport.into_parts();
    let mut reader = StreamReader::plain(reader);
    let mut writer = StreamWriter::plain(writer);

    // HELLO is exchanged before the compression layer is engaged.
    Frame::Hello {
        version: WIRE_VERSION,
        features: opts.feature_bits(),
    }
    .write_to(&mut writer)?;
    writer.flush_through()?;
    let negotiated = match Frame::read_from(&mut reader)? {
        Frame::Hello { version, features } => {
            if version != WIRE_VERSION {
                let err = SyncError::VersionMismatch {
                    local: WIRE_VERSION,
                    remote: version,
                };
                let _ = Frame::Error {
                    code: err.wire_code(),
                    message: err.to_string(),
                }
                .write_to(&mut writer);
                let _ = writer.flush_through();
                return Err(err);
            }
            features & opts.feature_bits()
        }
        other => {
            return Err(SyncError::Protocol(format!(
                "expected HELLO, got {:?}",
                other.tag()
            )))
        }
    };

    if negotiated & feature::COMPRESS != 0 {
        writer.enable_compression(INITIAL_LEVEL)?;
        reader.enable_decompression()?;
    }

    let peer = spawn_peer_threads(reader, writer, opts.idle_timeout);
    let result = sender_main(&peer, &manifest, &source_base, &opts, &mut stats);
    let peer_summary = match result {
        Ok(summary) => Some(summary),
        Err(err) => {
            peer.send_error(&err);
            peer.shutdown(&mut stats);
            return Err(err);
        }
    };

    if let Some(summary) = peer_summary {
        stats.files_deleted = summary.files_deleted;
    }
    peer.shutdown(&mut stats);
    stats.elapsed = started.elapsed();
    Ok(stats)
}

/// Run the receiving side of a session over `transport`.
///
/// # Errors
///
/// Returns the first fatal error, as [`run_sender`] does.
pub fn run_receiver(transport: Transport, dest_root: &Path, opts: &SyncOptions) -> Result<TransferStats> {
    let opts = opts.clone().normalized();
    let started = Instant::now();
    let mut stats = TransferStats::new();

    std::fs::create_dir_all(dest_root)?;
    let removed = clean_stale_temps(dest_root);
    if removed > 0 {
        debug!(removed, "removed stale temp files");
    }

    let (reader, writer) = transport.into_parts();
    let mut reader = StreamReader::plain(reader);
    let mut writer = StreamWriter::plain(writer);

    // The sender's HELLO drives the session-wide modes.
    let sender_features = match Frame::read_from(&mut reader)? {
        Frame::Hello { version, features } => {
            if version != WIRE_VERSION {
                let err = SyncError::VersionMismatch {
                    local: WIRE_VERSION,
                    remote: version,
                };
                let _ = Frame::Error {
                    code: err.wire_code(),
                    message: err.to_string(),
                }
                .write_to(&mut writer);
                let _ = writer.flush_through();
                return Err(err);
            }
            features
        }
        other => {
            return Err(SyncError::Protocol(format!(
                "expected HELLO, got {:?}",
                other.tag()
            )))
        }
    };
    Frame::Hello {
        version: WIRE_VERSION,
        features: sender_features,
    }
    .write_to(&mut writer)?;
    writer.flush_through()?;

    if sender_features & feature::COMPRESS != 0 {
        writer.enable_compression(INITIAL_LEVEL)?;
        reader.enable_decompression()?;
    }

    let session_modes = SessionModes {
        checksum: sender_features & feature::CHECKSUM != 0,
        delete: sender_features & feature::DELETE != 0,
        dry_run: sender_features & feature::DRY_RUN != 0,
    };

    let peer = spawn_peer_threads(reader, writer, opts.idle_timeout);
    let result = receiver_main(&peer, dest_root, &opts, session_modes, &mut stats);
    if let Err(err) = result {
        peer.send_error(&err);
        peer.shutdown(&mut stats);
        return Err(err);
    }

    peer.shutdown(&mut stats);
    stats.elapsed = started.elapsed();
    Ok(stats)
}

/// Sync `source` into `dest` with two in-process sessions over an OS pipe
/// pair.
///
/// # Errors
///
/// Returns the sender's error if both sides fail, otherwise whichever side
/// failed.
pub fn sync_local(source: &Path, dest: &Path, opts: &SyncOptions) -> Result<TransferStats> {
    let (sender_end, receiver_end) = Transport::pair()?;
    let receiver_opts = opts.clone();
    let dest = dest.to_path_buf();

    let receiver = thread::spawn(move || run_receiver(receiver_end, &dest, &receiver_opts));
    let sender_result = run_sender(sender_end, source, opts);

    let receiver_result = receiver
        .join()
        .map_err(|_| SyncError::Cancelled("receiver thread panicked".to_string()))?;

    match (sender_result, receiver_result) {
        (Ok(stats), Ok(_)) => Ok(stats),
        (Err(err), _) | (Ok(_), Err(err)) => Err(err),
    }
}

/// Modes the sender's HELLO imposes on the receiver.
#[derive(Debug, Clone, Copy)]
struct SessionModes {
    checksum: bool,
    delete: bool,
    dry_run: bool,
}

/// Inbound events produced by the reader thread.
enum InEvent {
    Frame(Frame),
    Closed(SyncError),
}

/// Handle to the session's reader and writer threads.
struct PeerIo {
    inbound: Receiver<InEvent>,
    outbound: Option<Sender<Frame>>,
    writer_thread: Option<thread::JoinHandle<(u64, u64)>>,
    frames_received: std::sync::Arc<std::sync::atomic::AtomicU64>,
    timeout: Duration,
}

fn spawn_peer_threads(
    reader: StreamReader<Box<dyn Read + Send>>,
    writer: StreamWriter<Box<dyn Write + Send>>,
    timeout: Duration,
) -> PeerIo {
    let (in_tx, in_rx) = bounded::<InEvent>(QUEUE_DEPTH);
    let (out_tx, out_rx) = bounded::<Frame>(QUEUE_DEPTH);
    let frames_received = std::sync::Arc::new(std::sync::atomic::AtomicU64::new(0));

    let counter = std::sync::Arc::clone(&frames_received);
    // Reader: drain the transport into the inbound queue until EOF or
    // error. Detached; it exits when the peer closes or the queue is gone.
    thread::spawn(move || {
        let mut reader = reader;
        loop {
            match Frame::read_from(&mut reader) {
                Ok(frame) => {
                    counter.fetch_add(1, std::sync::atomic::Ordering::Relaxed);
                    if in_tx.send(InEvent::Frame(frame)).is_err() {
                        break;
                    }
                }
                Err(SyncError::Io(err)) if err.kind() == std::io::ErrorKind::UnexpectedEof => {
                    let _ = in_tx.send(InEvent::Closed(SyncError::Cancelled(
                        "transport closed by peer".to_string(),
                    )));
                    break;
                }
                Err(err) => {
                    let _ = in_tx.send(InEvent::Closed(err));
                    break;
                }
            }
        }
    });

    let writer_thread = thread::spawn(move || writer_loop(writer, &out_rx));

    PeerIo {
        inbound: in_rx,
        outbound: Some(out_tx),
        writer_thread: Some(writer_thread),
        frames_received,
        timeout,
    }
}

/// Drain the outbound queue onto the transport, flushing whenever the
/// queue runs dry, and let the controller steer the compression level.
/// Returns (frames written, bytes on wire).
fn writer_loop(
    mut writer: StreamWriter<Box<dyn Write + Send>>,
    queue: &Receiver<Frame>,
) -> (u64, u64) {
    let mut controller = CompressionController::new();
    let mut frames = 0u64;

    'outer: loop {
        let Ok(frame) = queue.recv() else {
            break;
        };
        let mut pending = Some(frame);

        while let Some(frame) = pending.take() {
            let compress_started = Instant::now();
            let size = frame.wire_len() as u64;
            if frame.write_to(&mut writer).is_err() {
                break 'outer;
            }
            let compress_time = compress_started.elapsed();
            frames += 1;

            // Batch: keep writing while more frames are queued.
            match queue.try_recv() {
                Ok(next) => {
                    controller.record_frame(size, compress_time, Duration::ZERO);
                    pending = Some(next);
                }
                Err(_) => {
                    let flush_started = Instant::now();
                    if writer.flush_through().is_err() {
                        break 'outer;
                    }
                    controller.record_frame(size, compress_time, flush_started.elapsed());
                }
            }

            if writer.is_compressed() {
                if let Some(level) = controller.maybe_adjust() {
                    debug!(level, "compression level change");
                    #[allow(clippy::cast_possible_truncation, clippy::cast_sign_loss)]
                    let hint = Frame::CompressionHint { level: level as u8 };
                    if hint.write_to(&mut writer).is_err() || writer.flush_through().is_err() {
                        break 'outer;
                    }
                    frames += 1;
                    if writer.set_level(level).is_err() {
                        break 'outer;
                    }
                }
            }
        }
    }

    let bytes_out = writer.bytes_out();
    match writer.finish() {
        Ok(mut transport) => {
            let _ = transport.flush();
            (frames, bytes_out)
        }
        Err(_) => (frames, bytes_out),
    }
}

impl PeerIo {
    /// Next frame from the peer, with the idle timeout applied.
    /// COMPRESSION_HINT frames are informational and consumed here; an
    /// ERROR frame terminates the session.
    fn recv(&self) -> Result<Frame> {
        loop {
            match self.inbound.recv_timeout(self.timeout) {
                Ok(InEvent::Frame(Frame::CompressionHint { level })) => {
                    debug!(level, "peer announced compression level");
                }
                Ok(InEvent::Frame(Frame::Error { code, message })) => {
                    return Err(SyncError::Cancelled(format!(
                        "peer error {code}: {message}"
                    )));
                }
                Ok(InEvent::Frame(frame)) => return Ok(frame),
                Ok(InEvent::Closed(err)) => return Err(err),
                Err(RecvTimeoutError::Timeout) => {
                    return Err(SyncError::Timeout {
                        seconds: self.timeout.as_secs(),
                    })
                }
                Err(RecvTimeoutError::Disconnected) => {
                    return Err(SyncError::Cancelled("reader thread exited".to_string()))
                }
            }
        }
    }

    /// Queue a frame for the writer thread.
    fn send(&self, frame: Frame) -> Result<()> {
        self.outbound
            .as_ref()
            .and_then(|tx| tx.send(frame).ok())
            .ok_or_else(|| SyncError::Cancelled("writer thread exited".to_string()))
    }

    /// Best-effort ERROR frame before shutdown.
    fn send_error(&self, err: &SyncError) {
        let _ = self.send(Frame::Error {
            code: err.wire_code(),
            message: err.to_string(),
        });
    }

    /// Close the outbound queue, wait for the writer to flush, and fold
    /// the thread counters into the stats.
    fn shutdown(mut self, stats: &mut TransferStats) {
        drop(self.outbound.take());
        if let Some(handle) = self.writer_thread.take() {
            if let Ok((frames, bytes)) = handle.join() {
                stats.frames_sent = frames;
                stats.bytes_on_wire = bytes;
            }
        }
        stats.frames_received = self
            .frames_received
            .load(std::sync::atomic::Ordering::Relaxed);
    }
}

/// A reader that feeds every byte it yields into a running hash.
struct HashingReader<R> {
    inner: R,
    hasher: FileHasher,
}

impl<R: Read> HashingReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            hasher: FileHasher::new(),
        }
    }
}

impl<R: Read> Read for HashingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.hasher.update(&buf[..n]);
        Ok(n)
    }
}

// =============================================================================
// Sender
// =============================================================================

fn sender_main(
    peer: &PeerIo,
    manifest: &Manifest,
    source_root: &Path,
    opts: &SyncOptions,
    stats: &mut TransferStats,
) -> Result<crate::stats::SessionSummary> {
    // Manifest phase.
    for entry in manifest.entries() {
        peer.send(Frame::ManifestEntry(entry.clone()))?;
    }
    peer.send(Frame::ManifestEnd)?;

    // Verdict phase: one verdict per entry, in order.
    let mut verdicts = Vec::with_capacity(manifest.len());
    for expected in 0..manifest.len() as u32 {
        match peer.recv()? {
            Frame::Verdict { entry, verdict } if entry == expected => verdicts.push(verdict),
            Frame::Verdict { entry, .. } => {
                return Err(SyncError::Protocol(format!(
                    "verdict for entry {entry}, expected {expected}"
                )))
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected VERDICT, got {:?}",
                    other.tag()
                )))
            }
        }
    }

    if opts.dry_run {
        for (entry, verdict) in manifest.entries().iter().zip(&verdicts) {
            if *verdict == Verdict::Skip {
                stats.files_skipped += 1;
            } else {
                info!(path = %entry.path, ?verdict, "would sync");
            }
        }
        return finish_stats(peer, stats);
    }

    for (entry, verdict) in manifest.entries().iter().zip(&verdicts) {
        match verdict {
            Verdict::Skip => {
                stats.files_skipped += 1;
                debug!(path = %entry.path, "skip");
            }
            Verdict::Full | Verdict::Delta if entry.kind != FileKind::Regular => {
                // Directories and symlinks are materialized straight from
                // the manifest on the receiver; nothing travels.
            }
            Verdict::Full => send_file(peer, entry, source_root, None, opts, stats)?,
            Verdict::Delta => {
                let signature = receive_signature(peer, entry)?;
                send_file(peer, entry, source_root, Some(signature), opts, stats)?;
            }
        }
    }

    finish_stats(peer, stats)
}

fn receive_signature(peer: &PeerIo, entry: &FileEntry) -> Result<Signature> {
    let block_size = block_size_for(entry.size);
    let mut signature = Signature::empty(block_size);
    loop {
        match peer.recv()? {
            Frame::SigBlock(block) => signature.blocks.push(block),
            Frame::SigEnd {
                block_count,
                basis_size,
            } => {
                if signature.blocks.len() as u64 != u64::from(block_count) {
                    return Err(SyncError::Protocol(format!(
                        "signature for {} carried {} blocks, SIG_END claims {block_count}",
                        entry.path,
                        signature.blocks.len()
                    )));
                }
                signature.file_size = basis_size;
                return Ok(signature);
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected SIG_BLOCK or SIG_END, got {:?}",
                    other.tag()
                )))
            }
        }
    }
}

/// Stream one regular file: delta against `basis` when present, full
/// literal stream otherwise. Handles the one-shot full retry after a
/// receiver-side hash mismatch.
fn send_file(
    peer: &PeerIo,
    entry: &FileEntry,
    source_root: &Path,
    basis: Option<Signature>,
    opts: &SyncOptions,
    stats: &mut TransferStats,
) -> Result<()> {
    let path = entry.resolve(source_root);
    let file_started = Instant::now();

    let attempt = stream_file_once(peer, &path, basis.as_ref());
    let delta_stats = match attempt {
        Ok(delta_stats) => delta_stats,
        Err(SyncError::Io(err)) => {
            // A per-file read failure costs the file, not the session.
            warn!(path = %entry.path, error = %err, "source unreadable, skipping");
            peer.send(Frame::FileEnd {
                status: FileEndStatus::Failed,
                hash: StrongHash::zero(),
            })?;
            expect_ack(peer)?;
            stats.file_errors += 1;
            return Ok(());
        }
        Err(err) => return Err(err),
    };

    stats.bytes_read += delta_stats.bytes_matched + delta_stats.bytes_literal;
    stats.bytes_literal += delta_stats.bytes_literal;
    stats.bytes_matched += delta_stats.bytes_matched;

    match expect_ack(peer)? {
        AckStatus::Ok => {
            stats.files_transferred += 1;
            if opts.progress {
                info!(
                    path = %entry.path,
                    literal = delta_stats.bytes_literal,
                    matched = delta_stats.bytes_matched,
                    elapsed_ms = file_started.elapsed().as_millis() as u64,
                    "transferred"
                );
            }
        }
        AckStatus::HashMismatch => {
            // One automatic retry with a plain full stream.
            warn!(path = %entry.path, "hash mismatch, retrying with full transfer");
            let retry = stream_file_once(peer, &path, None);
            match retry {
                Ok(retry_stats) => {
                    stats.bytes_read += retry_stats.bytes_literal;
                    stats.bytes_literal += retry_stats.bytes_literal;
                    match expect_ack(peer)? {
                        AckStatus::Ok => stats.files_transferred += 1,
                        _ => {
                            warn!(path = %entry.path, "retry failed, giving up on file");
                            stats.file_errors += 1;
                        }
                    }
                }
                Err(SyncError::Io(err)) => {
                    warn!(path = %entry.path, error = %err, "retry read failed");
                    peer.send(Frame::FileEnd {
                        status: FileEndStatus::Failed,
                        hash: StrongHash::zero(),
                    })?;
                    expect_ack(peer)?;
                    stats.file_errors += 1;
                }
                Err(err) => return Err(err),
            }
        }
        AckStatus::Skipped => {
            stats.file_errors += 1;
        }
    }
    Ok(())
}

/// One pass over the source file: emit instructions and FILE_END.
fn stream_file_once(peer: &PeerIo, path: &Path, basis: Option<&Signature>) -> Result<DeltaStats> {
    let file = File::open(path)?;
    let mut source = HashingReader::new(file);

    let mut emit = |instruction: Instruction| -> Result<()> {
        peer.send(match instruction {
            Instruction::Copy { block_index, len } => Frame::InstrCopy { block_index, len },
            Instruction::Literal(data) => Frame::InstrLiteral(data),
        })
    };

    let delta_stats = match basis {
        Some(signature) => {
            let index = signature.clone().into_index();
            compute_delta(&mut source, &index, emit)?
        }
        None => {
            let mut delta_stats = DeltaStats::default();
            stream_all_literal(&mut source, &mut emit, &mut delta_stats)?;
            delta_stats
        }
    };

    peer.send(Frame::FileEnd {
        status: FileEndStatus::Ok,
        hash: source.hasher.finish(),
    })?;
    Ok(delta_stats)
}

fn expect_ack(peer: &PeerIo) -> Result<AckStatus> {
    match peer.recv()? {
        Frame::FileAck(status) => Ok(status),
        other => Err(SyncError::Protocol(format!(
            "expected FILE_ACK, got {:?}",
            other.tag()
        ))),
    }
}

fn finish_stats(peer: &PeerIo, stats: &TransferStats) -> Result<crate::stats::SessionSummary> {
    peer.send(Frame::Stats(stats.summary()))?;
    match peer.recv()? {
        Frame::Stats(summary) => Ok(summary),
        other => Err(SyncError::Protocol(format!(
            "expected STATS, got {:?}",
            other.tag()
        ))),
    }
}

// =============================================================================
// Receiver
// =============================================================================

fn receiver_main(
    peer: &PeerIo,
    dest_root: &Path,
    opts: &SyncOptions,
    modes: SessionModes,
    stats: &mut TransferStats,
) -> Result<()> {
    // Manifest phase.
    let mut manifest = Manifest::new();
    loop {
        match peer.recv()? {
            Frame::ManifestEntry(entry) => manifest.push(entry),
            Frame::ManifestEnd => break,
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected manifest frame, got {:?}",
                    other.tag()
                )))
            }
        }
    }
    stats.files_walked = manifest.len() as u64;

    // Compare against our own walker output.
    let local = walk_tree(
        dest_root,
        &WalkOptions {
            recursive: true,
            ..Default::default()
        },
    )?;
    let local_map = local.manifest.by_path();

    let filter = ChangeFilter::new(dest_root, modes.checksum, opts.update);
    let mut verdicts = Vec::with_capacity(manifest.len());
    for (i, entry) in manifest.entries().iter().enumerate() {
        let verdict = filter.classify(entry, local_map.get(entry.path.as_str()).copied())?;
        verdicts.push(verdict);
        #[allow(clippy::cast_possible_truncation)]
        peer.send(Frame::Verdict {
            entry: i as u32,
            verdict,
        })?;
    }

    if !modes.dry_run {
        for (entry, verdict) in manifest.entries().iter().zip(&verdicts) {
            match verdict {
                Verdict::Skip => {
                    stats.files_skipped += 1;
                    debug!(path = %entry.path, "up to date");
                }
                Verdict::Full | Verdict::Delta => {
                    receive_entry(peer, dest_root, entry, *verdict, stats)?;
                }
            }
        }
    } else {
        stats.files_skipped += verdicts.iter().filter(|v| **v == Verdict::Skip).count() as u64;
    }

    if modes.delete && !modes.dry_run {
        delete_extraneous(dest_root, &manifest, &local.manifest, stats);
    }

    // Stats handshake: the sender reports first.
    match peer.recv()? {
        Frame::Stats(_) => {}
        other => {
            return Err(SyncError::Protocol(format!(
                "expected STATS, got {:?}",
                other.tag()
            )))
        }
    }
    peer.send(Frame::Stats(stats.summary()))?;
    Ok(())
}

/// Materialize one non-skip manifest entry.
fn receive_entry(
    peer: &PeerIo,
    dest_root: &Path,
    entry: &FileEntry,
    verdict: Verdict,
    stats: &mut TransferStats,
) -> Result<()> {
    let target = entry.resolve(dest_root);

    match entry.kind {
        FileKind::Directory => {
            materialize_directory(&target, entry.mode)?;
            stats.files_transferred += 1;
            return Ok(());
        }
        FileKind::Symlink => {
            let link = entry.link_target.as_deref().unwrap_or_default();
            materialize_symlink(&target, link)?;
            stats.files_transferred += 1;
            return Ok(());
        }
        FileKind::Regular => {}
    }

    // Delta files get a signature pass over the preserved original first.
    // A basis that vanished since classification degrades to an empty
    // signature, which makes the sender fall back to a full stream.
    let basis = if verdict == Verdict::Delta {
        let block_size = block_size_for(entry.size);
        let signature = match File::open(&target)
            .map_err(SyncError::Io)
            .and_then(|mut file| Signature::from_reader(&mut file, block_size))
        {
            Ok(signature) => signature,
            Err(err) => {
                warn!(path = %entry.path, error = %err, "basis unreadable, requesting full stream");
                Signature::empty(block_size)
            }
        };
        for block in &signature.blocks {
            peer.send(Frame::SigBlock(*block))?;
        }
        #[allow(clippy::cast_possible_truncation)]
        peer.send(Frame::SigEnd {
            block_count: signature.blocks.len() as u32,
            basis_size: signature.file_size,
        })?;
        (!signature.is_empty()).then_some(signature)
    } else {
        None
    };

    let applied = apply_instruction_stream(
        peer,
        &target,
        entry,
        basis.as_ref().map(|signature| (target.as_path(), signature)),
    )?;

    match applied {
        Applied::Committed { bytes } => {
            peer.send(Frame::FileAck(AckStatus::Ok))?;
            stats.files_transferred += 1;
            stats.bytes_read += bytes;
            info!(path = %entry.path, bytes, "reconstructed");
        }
        Applied::SenderFailed => {
            peer.send(Frame::FileAck(AckStatus::Skipped))?;
            stats.file_errors += 1;
        }
        Applied::HashMismatch => {
            // Ask for the one-shot full resend and apply it basis-free.
            peer.send(Frame::FileAck(AckStatus::HashMismatch))?;
            match apply_instruction_stream(peer, &target, entry, None)? {
                Applied::Committed { bytes } => {
                    peer.send(Frame::FileAck(AckStatus::Ok))?;
                    stats.files_transferred += 1;
                    stats.bytes_read += bytes;
                }
                _ => {
                    warn!(path = %entry.path, "file failed twice, leaving previous version");
                    peer.send(Frame::FileAck(AckStatus::Skipped))?;
                    stats.file_errors += 1;
                }
            }
        }
    }
    Ok(())
}

enum Applied {
    Committed { bytes: u64 },
    HashMismatch,
    SenderFailed,
}

/// Consume one instruction stream into a temp file and commit it.
fn apply_instruction_stream(
    peer: &PeerIo,
    target: &Path,
    entry: &FileEntry,
    basis: Option<(&Path, &Signature)>,
) -> Result<Applied> {
    let mut reconstructor = Reconstructor::new(target, basis)?;

    loop {
        match peer.recv()? {
            Frame::InstrCopy { block_index, len } => {
                reconstructor.apply_copy(block_index, len)?;
            }
            Frame::InstrLiteral(data) => {
                reconstructor.apply_literal(&data)?;
            }
            Frame::FileEnd { status, hash } => {
                return match status {
                    FileEndStatus::Failed => {
                        reconstructor.abort();
                        Ok(Applied::SenderFailed)
                    }
                    FileEndStatus::Ok => {
                        let bytes = reconstructor.bytes_written();
                        match reconstructor.finish(hash, entry.mtime_ns, entry.mode) {
                            Ok(()) => Ok(Applied::Committed { bytes }),
                            Err(SyncError::HashMismatch { .. }) => Ok(Applied::HashMismatch),
                            Err(err) => Err(err),
                        }
                    }
                };
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected instruction frame, got {:?}",
                    other.tag()
                )))
            }
        }
    }
}

/// Remove destination paths absent from the manifest, deepest first.
fn delete_extraneous(
    dest_root: &Path,
    manifest: &Manifest,
    local: &Manifest,
    stats: &mut TransferStats,
) {
    let keep: std::collections::HashSet<&str> =
        manifest.entries().iter().map(|e| e.path.as_str()).collect();

    let mut doomed: Vec<&FileEntry> = local
        .entries()
        .iter()
        .filter(|entry| !keep.contains(entry.path.as_str()))
        .collect();
    doomed.sort_by(|a, b| b.path.cmp(&a.path));

    for entry in doomed {
        let path: PathBuf = entry.resolve(dest_root);
        let removed = match entry.kind {
            FileKind::Directory => std::fs::remove_dir(&path),
            _ => std::fs::remove_file(&path),
        };
        match removed {
            Ok(()) => {
                stats.files_deleted += 1;
                info!(path = %entry.path, "deleted");
            }
            Err(err) => {
                warn!(path = %entry.path, error = %err, "delete failed");
                stats.file_errors += 1;
            }
        }
    }
}
