//! Strong 128-bit content hash.
//!
//! Uses xxh3-128: a fast non-cryptographic hash, well above 10 GB/s on a
//! single core. It confirms weak-checksum hits during block matching and
//! provides the whole-file integrity check carried in FILE_END frames.
//! Collision resistance against an adversary is explicitly not a goal;
//! corruption slipping past a block match is caught by the whole-file
//! check and repaired with a full resend.

use std::io::Read;

use xxhash_rust::xxh3::{xxh3_128, Xxh3};

/// 128-bit strong hash of a byte sequence.
///
/// # Example
///
/// ```rust
/// use psync::StrongHash;
///
/// let hash1 = StrongHash::compute(b"hello world");
/// let hash2 = StrongHash::compute(b"hello world");
/// assert_eq!(hash1, hash2);
/// assert_ne!(hash1, StrongHash::compute(b"different data"));
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct StrongHash([u8; Self::LEN]);

impl StrongHash {
    /// Hash length in bytes.
    pub const LEN: usize = 16;

    /// Hash a byte slice.
    #[must_use]
    pub fn compute(data: &[u8]) -> Self {
        Self(xxh3_128(data).to_be_bytes())
    }

    /// Hash a reader without loading it whole into memory.
    ///
    /// # Errors
    ///
    /// Returns an I/O error if reading fails.
    pub fn compute_streaming<R: Read>(reader: &mut R) -> std::io::Result<Self> {
        let mut hasher = FileHasher::new();
        let mut buffer = [0u8; 64 * 1024];

        loop {
            let n = reader.read(&mut buffer)?;
            if n == 0 {
                break;
            }
            hasher.update(&buffer[..n]);
        }

        Ok(hasher.finish())
    }

    /// Wrap raw bytes as a hash value.
    #[must_use]
    pub const fn from_bytes(bytes: [u8; Self::LEN]) -> Self {
        Self(bytes)
    }

    /// The raw big-endian bytes, as transmitted on the wire.
    #[must_use]
    pub const fn as_bytes(&self) -> &[u8; Self::LEN] {
        &self.0
    }

    /// The all-zero hash, used as a placeholder before computation.
    #[must_use]
    pub const fn zero() -> Self {
        Self([0u8; Self::LEN])
    }
}

impl std::fmt::Debug for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "StrongHash({:016x}...)",
            u64::from_be_bytes(self.0[..8].try_into().unwrap_or([0u8; 8]))
        )
    }
}

impl std::fmt::Display for StrongHash {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        for byte in &self.0 {
            write!(f, "{byte:02x}")?;
        }
        Ok(())
    }
}

impl Default for StrongHash {
    fn default() -> Self {
        Self::zero()
    }
}

impl AsRef<[u8]> for StrongHash {
    fn as_ref(&self) -> &[u8] {
        &self.0
    }
}

/// Incremental hasher for data that arrives in pieces, such as a file
/// reconstructed instruction by instruction.
#[derive(Default)]
pub struct FileHasher {
    inner: Xxh3,
}

impl FileHasher {
    /// Start a fresh hash computation.
    #[must_use]
    pub fn new() -> Self {
        Self { inner: Xxh3::new() }
    }

    /// Feed more bytes.
    pub fn update(&mut self, data: &[u8]) {
        self.inner.update(data);
    }

    /// Finalize into a [`StrongHash`].
    #[must_use]
    pub fn finish(&self) -> StrongHash {
        StrongHash(self.inner.digest128().to_be_bytes())
    }
}

impl std::fmt::Debug for FileHasher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FileHasher").finish_non_exhaustive()
    }
}
