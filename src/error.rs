use thiserror::Error;

use crate::address::Address;

/// The generic Error type, which provides coverage for all errors this library can potentially
/// return.
///
/// The analysis pipeline is designed to degrade rather than fail: bad opcodes become
/// non-continuing instructions, overlapping procedures log and exclude the offending
/// instruction, and unknown callees fall back to a pessimistic dependency set. The
/// variants below cover the remaining genuinely unanswerable requests.
///
/// # Examples
///
/// ```rust
/// use gbscope::{Address, Error};
///
/// // An address inside the switchable bank window has no physical offset
/// // until a bank is attached.
/// let addr = Address::from_virtual(0x4123);
/// match addr.physical() {
///     Err(Error::AmbiguousAddress(a)) => assert_eq!(a, addr),
///     other => panic!("expected ambiguous address, got {:?}", other),
/// }
/// ```
#[derive(Error, Debug)]
pub enum Error {
    /// The address cannot be resolved to a physical ROM offset.
    ///
    /// Raised when a virtual offset inside the switchable bank window
    /// (0x4000-0x7FFF) is used without an attached bank, or when the offset
    /// does not refer to ROM at all (RAM, I/O, ...). Recoverable by deferring
    /// resolution until a bank is known; fatal only where a concrete byte is
    /// required.
    #[error("Address {0} has no physical ROM location")]
    AmbiguousAddress(Address),

    /// Canonical address text could not be parsed.
    ///
    /// The canonical forms are `BANK:OFFS`, `(A):OFFS` for bank-ambiguous
    /// addresses, a region prefix (`WORK:`, `IO:`, ...) or `(V):OFFS` for
    /// non-ROM offsets, and a bare hexadecimal virtual offset.
    #[error("Invalid address text - '{0}'")]
    AddressSyntax(String),

    /// Persisted analysis text (dependency sets, records) could not be
    /// parsed back.
    #[error("Malformed - {0}")]
    Malformed(String),

    /// An out of bound access was attempted on a byte source.
    ///
    /// This error occurs when trying to read past the end of the ROM image.
    /// It is a safety check to prevent runaway disassembly near the image end.
    #[error("Out of bound read would have occurred!")]
    OutOfBounds,

    /// File I/O error.
    ///
    /// Wraps standard I/O errors that can occur while opening or mapping a
    /// ROM image from disk.
    #[error("{0}")]
    FileError(#[from] std::io::Error),

    /// Procedure graph construction error.
    ///
    /// Raised when a control flow graph cannot be built, for example from an
    /// empty block partition. Indicates a bug or truncated input rather than
    /// an analysis anomaly.
    #[error("{0}")]
    GraphError(String),
}
