//! Online compression level selection.
//!
//! The controller watches one outbound direction. Per measurement window
//! it compares time spent blocked on the transport against time spent
//! compressing: a blocked writer means the network is the bottleneck and
//! the level rises; a saturated compressor with an idle writer means the
//! CPU is the bottleneck and the level drops. At most one change per
//! window, and a change forces a quiet window before the next one.

use std::time::{Duration, Instant};

/// Lowest zstd level the controller will select.
pub const MIN_LEVEL: i32 = 1;
/// Highest zstd level the controller will select.
pub const MAX_LEVEL: i32 = 19;
/// Starting level.
pub const INITIAL_LEVEL: i32 = 3;

/// Frames per measurement window.
const WINDOW_FRAMES: u64 = 64;
/// Alternatively, uncompressed bytes per measurement window.
const WINDOW_BYTES: u64 = 64 * 1024 * 1024;

/// Writer-blocked fraction above which the level rises.
const BLOCKED_RAISE: f64 = 0.20;
/// Writer-blocked fraction above which the level rises by two.
const BLOCKED_RAISE_FAST: f64 = 0.50;
/// Compress-time fraction above which the compressor counts as saturated.
const CPU_SATURATED: f64 = 0.50;
/// Writer-blocked fraction under which the writer counts as idle.
const WRITER_IDLE: f64 = 0.02;

/// Measurement window accumulator and level state.
#[derive(Debug)]
pub struct CompressionController {
    level: i32,
    frames: u64,
    bytes_in: u64,
    compress_time: Duration,
    write_time: Duration,
    window_start: Instant,
    cooldown: bool,
}

impl CompressionController {
    /// Start at the initial level.
    #[must_use]
    pub fn new() -> Self {
        Self {
            level: INITIAL_LEVEL,
            frames: 0,
            bytes_in: 0,
            compress_time: Duration::ZERO,
            write_time: Duration::ZERO,
            window_start: Instant::now(),
            cooldown: false,
        }
    }

    /// Current level.
    #[must_use]
    pub const fn level(&self) -> i32 {
        self.level
    }

    /// Account one frame: its pre-compression size, the time spent feeding
    /// the compressor, and the time spent pushing bytes to the transport.
    pub fn record_frame(&mut self, bytes_in: u64, compress: Duration, write: Duration) {
        self.frames += 1;
        self.bytes_in += bytes_in;
        self.compress_time += compress;
        self.write_time += write;
    }

    /// Evaluate the window if it is complete. Returns the new level when a
    /// change was decided; the caller announces it and reconfigures the
    /// encoder.
    pub fn maybe_adjust(&mut self) -> Option<i32> {
        if self.frames < WINDOW_FRAMES && self.bytes_in < WINDOW_BYTES {
            return None;
        }

        let wall = self.window_start.elapsed().max(Duration::from_micros(1));
        let blocked = (self.write_time.as_secs_f64() / wall.as_secs_f64()).min(1.0);
        let cpu = (self.compress_time.as_secs_f64() / wall.as_secs_f64()).min(1.0);

        let was_cooling = self.cooldown;
        self.cooldown = false;
        self.frames = 0;
        self.bytes_in = 0;
        self.compress_time = Duration::ZERO;
        self.write_time = Duration::ZERO;
        self.window_start = Instant::now();

        if was_cooling {
            // A level change in the previous window; settle first.
            return None;
        }

        let next = decide(self.level, blocked, cpu)?;
        self.level = next;
        self.cooldown = true;
        Some(next)
    }
}

impl Default for CompressionController {
    fn default() -> Self {
        Self::new()
    }
}

/// The decision rule, separated from timing for testability.
fn decide(level: i32, blocked: f64, cpu: f64) -> Option<i32> {
    if blocked > BLOCKED_RAISE && level < MAX_LEVEL {
        let step = if blocked > BLOCKED_RAISE_FAST { 2 } else { 1 };
        return Some((level + step).min(MAX_LEVEL));
    }
    if cpu > CPU_SATURATED && blocked < WRITER_IDLE && level > MIN_LEVEL {
        return Some(level - 1);
    }
    None
}
