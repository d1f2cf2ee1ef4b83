//! Error types for hexflash.

use std::io;
use thiserror::Error;

use crate::protocol::Failure;

/// Result type for hexflash operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for hexflash operations.
///
/// A failed write/verify transaction is not an error: it is reported as a
/// [`Failure`] and retried by the loader. These variants end the run.
#[derive(Debug, Error)]
pub enum Error {
    /// I/O error (serial port, file operations).
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),

    /// Serial port error.
    #[cfg(feature = "native")]
    #[error("Serial port error: {0}")]
    Serial(#[from] serialport::Error),

    /// Malformed Intel HEX input.
    #[error("Invalid HEX at line {line}: {reason}")]
    InvalidHex {
        /// 1-based line number of the offending record.
        line: usize,
        /// What was wrong with it.
        reason: String,
    },

    /// Two segments claim the same address.
    #[error("Address ${address:04x} is defined more than once")]
    AddressOverlap {
        /// The address defined twice.
        address: u32,
    },

    /// A chunk does not fit the 16-bit address space of the wire protocol.
    #[error("Address range ${address:04x}+{len} exceeds the protocol limit of {limit:#x}")]
    AddressOutOfRange {
        /// Base address of the chunk.
        address: u32,
        /// Chunk length in bytes.
        len: usize,
        /// Exclusive upper bound accepted by the protocol.
        limit: u32,
    },

    /// Protocol usage error (not a transient transaction failure).
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// The retry policy gave up on a chunk.
    #[error("Chunk at ${address:04x} failed after {attempts} attempts (last: {last})")]
    RetriesExhausted {
        /// Base address of the chunk.
        address: u32,
        /// Number of transactions attempted.
        attempts: u32,
        /// Failure of the final attempt.
        last: Failure,
    },

    /// The embedding application asked to stop.
    #[error("Interrupted")]
    Interrupted,
}
