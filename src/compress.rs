//! Streaming compression wrapped around the frame codec.
//!
//! Each direction of the session owns one [`StreamWriter`] and one
//! [`StreamReader`]. They start in plain mode for the HELLO exchange and
//! switch to zstd once both peers negotiate compression. A level change
//! finishes the current zstd frame and opens a new one at the new level;
//! zstd frames are self-describing, so the decoding side follows without
//! coordination.

use std::io::{self, BufReader, Read, Write};

use zstd::stream::read::Decoder as ZstdDecoder;
use zstd::stream::write::Encoder as ZstdEncoder;

use crate::error::{Result, SyncError};

/// Writer that counts the bytes reaching the underlying stream.
#[derive(Debug)]
pub struct CountingWriter<W> {
    inner: W,
    bytes: u64,
}

impl<W: Write> CountingWriter<W> {
    /// Wrap a writer.
    pub const fn new(inner: W) -> Self {
        Self { inner, bytes: 0 }
    }

    /// Bytes written so far.
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }

    /// Unwrap.
    pub fn into_inner(self) -> W {
        self.inner
    }
}

impl<W: Write> Write for CountingWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = self.inner.write(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.inner.flush()
    }
}

/// Reader that counts the bytes taken from the underlying stream.
#[derive(Debug)]
pub struct CountingReader<R> {
    inner: R,
    bytes: u64,
}

impl<R: Read> CountingReader<R> {
    /// Wrap a reader.
    pub const fn new(inner: R) -> Self {
        Self { inner, bytes: 0 }
    }

    /// Bytes read so far.
    pub const fn bytes(&self) -> u64 {
        self.bytes
    }
}

impl<R: Read> Read for CountingReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        let n = self.inner.read(buf)?;
        self.bytes += n as u64;
        Ok(n)
    }
}

enum Sink<W: Write> {
    Plain(CountingWriter<W>),
    Zstd(Box<ZstdEncoder<'static, CountingWriter<W>>>),
}

/// Outbound half of one direction: plain or zstd-compressed.
pub struct StreamWriter<W: Write> {
    sink: Option<Sink<W>>,
    bytes_in: u64,
}

impl<W: Write> StreamWriter<W> {
    /// Start in plain mode.
    pub const fn plain(writer: W) -> Self {
        Self {
            sink: Some(Sink::Plain(CountingWriter::new(writer))),
            bytes_in: 0,
        }
    }

    /// Whether compression is engaged.
    pub const fn is_compressed(&self) -> bool {
        matches!(self.sink, Some(Sink::Zstd(_)))
    }

    /// Switch from plain to compressed output at the given level.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder cannot be created.
    pub fn enable_compression(&mut self, level: i32) -> Result<()> {
        match self.sink.take() {
            Some(Sink::Plain(writer)) => {
                let encoder = ZstdEncoder::new(writer, level)
                    .map_err(|e| SyncError::Protocol(format!("zstd encoder: {e}")))?;
                self.sink = Some(Sink::Zstd(Box::new(encoder)));
                Ok(())
            }
            other => {
                self.sink = other;
                Err(SyncError::Protocol(
                    "compression already enabled".to_string(),
                ))
            }
        }
    }

    /// Finish the current zstd frame and continue at a new level.
    ///
    /// No-op in plain mode.
    ///
    /// # Errors
    ///
    /// Returns an error if the encoder restart fails.
    pub fn set_level(&mut self, level: i32) -> Result<()> {
        match self.sink.take() {
            Some(Sink::Zstd(encoder)) => {
                let writer = encoder
                    .finish()
                    .map_err(|e| SyncError::Protocol(format!("zstd finish: {e}")))?;
                let encoder = ZstdEncoder::new(writer, level)
                    .map_err(|e| SyncError::Protocol(format!("zstd encoder: {e}")))?;
                self.sink = Some(Sink::Zstd(Box::new(encoder)));
                Ok(())
            }
            other => {
                self.sink = other;
                Ok(())
            }
        }
    }

    /// Uncompressed bytes accepted so far.
    pub const fn bytes_in(&self) -> u64 {
        self.bytes_in
    }

    /// Bytes that actually reached the transport.
    pub fn bytes_out(&self) -> u64 {
        match self.sink.as_ref() {
            Some(Sink::Plain(writer)) => writer.bytes(),
            Some(Sink::Zstd(encoder)) => encoder.get_ref().bytes(),
            None => 0,
        }
    }

    /// Flush the compressor and the transport so everything written so far
    /// is decodable on the far side.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the stream.
    pub fn flush_through(&mut self) -> io::Result<()> {
        match self.sink.as_mut() {
            Some(Sink::Plain(writer)) => writer.flush(),
            Some(Sink::Zstd(encoder)) => {
                encoder.flush()?;
                encoder.get_mut().flush()
            }
            None => Ok(()),
        }
    }

    /// Finish any compression frame and return the transport writer.
    ///
    /// # Errors
    ///
    /// Returns an I/O error from the final flush.
    pub fn finish(mut self) -> io::Result<W> {
        match self.sink.take() {
            Some(Sink::Plain(writer)) => Ok(writer.into_inner()),
            Some(Sink::Zstd(encoder)) => Ok(encoder.finish()?.into_inner()),
            None => Err(io::Error::other("stream writer already finished")),
        }
    }
}

impl<W: Write> Write for StreamWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        let n = match self.sink.as_mut() {
            Some(Sink::Plain(writer)) => writer.write(buf)?,
            Some(Sink::Zstd(encoder)) => encoder.write(buf)?,
            None => return Err(io::Error::other("stream writer already finished")),
        };
        self.bytes_in += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> io::Result<()> {
        self.flush_through()
    }
}

enum Source<R: Read> {
    Plain(CountingReader<R>),
    Zstd(Box<ZstdDecoder<'static, BufReader<CountingReader<R>>>>),
}

/// Inbound half of one direction: plain or zstd-decompressing.
///
/// The decoder reads concatenated zstd frames, so sender-side level
/// switches need no action here.
pub struct StreamReader<R: Read> {
    source: Option<Source<R>>,
}

impl<R: Read> StreamReader<R> {
    /// Start in plain mode.
    pub const fn plain(reader: R) -> Self {
        Self {
            source: Some(Source::Plain(CountingReader::new(reader))),
        }
    }

    /// Whether decompression is engaged.
    pub const fn is_compressed(&self) -> bool {
        matches!(self.source, Some(Source::Zstd(_)))
    }

    /// Switch from plain to decompressing input.
    ///
    /// # Errors
    ///
    /// Returns an error if the decoder cannot be created.
    pub fn enable_decompression(&mut self) -> Result<()> {
        match self.source.take() {
            Some(Source::Plain(reader)) => {
                let decoder = ZstdDecoder::new(reader)
                    .map_err(|e| SyncError::Protocol(format!("zstd decoder: {e}")))?;
                self.source = Some(Source::Zstd(Box::new(decoder)));
                Ok(())
            }
            other => {
                self.source = other;
                Err(SyncError::Protocol(
                    "decompression already enabled".to_string(),
                ))
            }
        }
    }

    /// Compressed bytes pulled from the transport so far.
    pub fn bytes_from_wire(&self) -> u64 {
        match self.source.as_ref() {
            Some(Source::Plain(reader)) => reader.bytes(),
            Some(Source::Zstd(decoder)) => decoder.get_ref().get_ref().bytes(),
            None => 0,
        }
    }
}

impl<R: Read> Read for StreamReader<R> {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match self.source.as_mut() {
            Some(Source::Plain(reader)) => reader.read(buf),
            Some(Source::Zstd(decoder)) => decoder.read(buf),
            None => Err(io::Error::other("stream reader already finished")),
        }
    }
}
