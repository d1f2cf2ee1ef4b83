//! Wire protocols for writing and verifying one chunk.
//!
//! Both command sets speak to the same target firmware:
//!
//! - [`legacy`]: byte-granular ASCII commands (`A`, `W`, `R`), 64-byte chunks
//! - [`block`]: one `B` control frame plus a raw payload burst, 1024-byte chunks
//!
//! A driver runs one transaction per call and reports an [`Outcome`]. Failed
//! transactions are retried by the loader, so they are values here, not
//! errors.

pub mod block;
pub mod kind;
pub mod legacy;

use std::fmt;

use crate::error::{Error, Result};
use crate::loader::Chunk;
use crate::port::Port;

pub use block::BlockProtocol;
pub use kind::ProtocolKind;
pub use legacy::LegacyProtocol;

/// Exclusive upper bound of the target's 16-bit address space.
pub const ADDRESS_LIMIT: u32 = 0x1_0000;

/// Why a transaction did not verify.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub enum Failure {
    /// A command echo did not match what was sent.
    CommandError,
    /// The readback had the wrong number of bytes.
    LengthError {
        /// Bytes requested.
        expected: usize,
        /// Bytes received before the port timed out.
        actual: usize,
    },
    /// The readback had the right length but different content.
    VerificationError {
        /// Offset of the first differing byte within the chunk.
        offset: usize,
    },
}

impl Failure {
    /// Upper-case name used in console diagnostics.
    pub fn label(&self) -> &'static str {
        match self {
            Self::CommandError => "COMMAND ERROR",
            Self::LengthError { .. } => "LENGTH ERROR",
            Self::VerificationError { .. } => "VERIFICATION ERROR",
        }
    }
}

impl fmt::Display for Failure {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::CommandError => write!(f, "command echo mismatch"),
            Self::LengthError { expected, actual } => {
                write!(f, "expected {expected} bytes, received {actual}")
            },
            Self::VerificationError { offset } => {
                write!(f, "readback differs at offset {offset}")
            },
        }
    }
}

/// Result of one write/verify transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    /// The readback matched the chunk.
    Success,
    /// The transaction failed and may be retried.
    Failed(Failure),
}

impl Outcome {
    /// Whether the chunk verified.
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

/// A command set able to write and verify one chunk.
pub trait ChunkProtocol {
    /// Which command set this is.
    fn kind(&self) -> ProtocolKind;

    /// Largest chunk a single transaction may carry.
    fn max_chunk(&self) -> usize {
        self.kind()
            .max_chunk()
    }

    /// Check that a chunk can be expressed on the wire.
    fn validate(&self, chunk: &Chunk) -> Result<()> {
        if chunk.len() > self.max_chunk() {
            return Err(Error::Protocol(format!(
                "chunk of {} bytes exceeds the {} limit of {}",
                chunk.len(),
                self.kind(),
                self.max_chunk()
            )));
        }
        check_range(chunk.address, chunk.len())
    }

    /// Run one write/verify transaction for `chunk`.
    fn execute<P: Port + ?Sized>(&self, port: &mut P, chunk: &Chunk) -> Result<Outcome>;
}

/// Reject chunks that would run past the 16-bit address space.
pub fn check_range(address: u32, len: usize) -> Result<()> {
    if u64::from(address) + len as u64 > u64::from(ADDRESS_LIMIT) {
        return Err(Error::AddressOutOfRange {
            address,
            len,
            limit: ADDRESS_LIMIT,
        });
    }
    Ok(())
}

/// Compare a readback against the data that was written.
pub fn classify(expected: &[u8], readback: &[u8]) -> Outcome {
    if readback.len() != expected.len() {
        return Outcome::Failed(Failure::LengthError {
            expected: expected.len(),
            actual: readback.len(),
        });
    }
    match expected
        .iter()
        .zip(readback)
        .position(|(a, b)| a != b)
    {
        Some(offset) => Outcome::Failed(Failure::VerificationError { offset }),
        None => Outcome::Success,
    }
}
