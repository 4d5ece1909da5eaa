//! ROM image access.
//!
//! The analysis core never touches files or buffers directly; it reads bytes
//! through the [`ByteSource`] trait, addressed via [`Address`] and resolved
//! through bank-aware physical translation. [`RomImage`] is the standard
//! implementation, backed either by an owned buffer or a memory-mapped file.

use std::fs::File;
use std::path::Path;

use memmap2::Mmap;

use crate::address::{Address, BANK_SIZE};
use crate::{Error, Result};

/// Read-only access to a flat ROM image.
///
/// All reads are addressed virtually; implementations translate through
/// [`Address::physical`], so reads from ambiguous addresses fail with
/// [`Error::AmbiguousAddress`](crate::Error::AmbiguousAddress) instead of
/// guessing a bank.
pub trait ByteSource: Send + Sync {
    /// Reads the byte at `addr`.
    ///
    /// # Errors
    ///
    /// Fails when the address has no physical location or lies past the end
    /// of the image.
    fn get(&self, addr: Address) -> Result<u8>;

    /// Reads a little-endian 16-bit word at `addr`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`get`](Self::get), for either byte.
    fn get_word(&self, addr: Address) -> Result<u16> {
        let lo = self.get(addr)?;
        let hi = self.get(addr.offset(1))?;
        Ok(u16::from(hi) << 8 | u16::from(lo))
    }

    /// Reads `len` consecutive bytes starting at `addr`.
    ///
    /// # Errors
    ///
    /// Same conditions as [`get`](Self::get), for any byte in the range.
    fn read(&self, addr: Address, len: usize) -> Result<Vec<u8>> {
        (0..len).map(|i| self.get(addr.offset(i as i32))).collect()
    }

    /// Number of bytes in the image.
    fn len(&self) -> usize;

    /// Returns `true` for an empty image.
    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Number of 16 KiB banks the image spans (at least one).
    fn num_banks(&self) -> usize {
        self.len().div_ceil(BANK_SIZE as usize).max(1)
    }
}

enum Backend {
    Owned(Vec<u8>),
    Mapped(Mmap),
}

impl Backend {
    fn data(&self) -> &[u8] {
        match self {
            Backend::Owned(data) => data,
            Backend::Mapped(map) => map,
        }
    }
}

/// A flat ROM image, the standard [`ByteSource`].
pub struct RomImage {
    backend: Backend,
}

impl RomImage {
    /// Wraps an in-memory buffer.
    #[must_use]
    pub fn from_bytes(data: Vec<u8>) -> Self {
        RomImage {
            backend: Backend::Owned(data),
        }
    }

    /// Memory-maps a ROM file from disk.
    ///
    /// # Errors
    ///
    /// Returns an I/O error when the file cannot be opened or mapped.
    pub fn from_file(path: &Path) -> Result<Self> {
        let file = File::open(path)?;
        // SAFETY: the mapping is read-only and the file handle is held for
        // the lifetime of the map.
        let map = unsafe { Mmap::map(&file)? };
        Ok(RomImage {
            backend: Backend::Mapped(map),
        })
    }
}

impl ByteSource for RomImage {
    fn get(&self, addr: Address) -> Result<u8> {
        let physical = addr.physical()?;
        self.backend
            .data()
            .get(physical)
            .copied()
            .ok_or(Error::OutOfBounds)
    }

    fn len(&self) -> usize {
        self.backend.data().len()
    }
}
