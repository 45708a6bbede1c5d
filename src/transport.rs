//! Transport abstraction: one readable and one writable byte stream.
//!
//! The core session never opens connections itself. Local mode joins two
//! in-process sessions with OS pipes; server mode runs over stdin/stdout;
//! a remote bootstrap (out of scope here) hands the session whatever pair
//! of streams it established.

use std::io::{self, Read, Write};

/// A reliable, ordered, closable byte-stream pair.
pub struct Transport {
    reader: Box<dyn Read + Send>,
    writer: Box<dyn Write + Send>,
}

impl Transport {
    /// Wrap an arbitrary stream pair.
    #[must_use]
    pub fn new(reader: Box<dyn Read + Send>, writer: Box<dyn Write + Send>) -> Self {
        Self { reader, writer }
    }

    /// The process's stdin/stdout, for `--server` mode.
    #[must_use]
    pub fn stdio() -> Self {
        Self {
            reader: Box::new(io::stdin()),
            writer: Box::new(io::stdout()),
        }
    }

    /// Two connected transports over OS pipes, for local mode and tests.
    /// Dropping one side's writer delivers EOF to the other side's reader.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if pipe creation fails.
    pub fn pair() -> io::Result<(Self, Self)> {
        let (a_read, b_write) = io::pipe()?;
        let (b_read, a_write) = io::pipe()?;
        Ok((
            Self {
                reader: Box::new(a_read),
                writer: Box::new(a_write),
            },
            Self {
                reader: Box::new(b_read),
                writer: Box::new(b_write),
            },
        ))
    }

    /// Split into the two halves; the session hands one to its reader
    /// thread and one to its writer thread.
    #[must_use]
    pub fn into_parts(self) -> (Box<dyn Read + Send>, Box<dyn Write + Send>) {
        (self.reader, self.writer)
    }
}

impl std::fmt::Debug for Transport {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Transport").finish_non_exhaustive()
    }
}
