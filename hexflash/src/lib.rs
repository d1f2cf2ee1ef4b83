//! # hexflash
//!
//! A library for writing Intel HEX images into the memory of a target that
//! runs a small serial monitor.
//!
//! The image is split into chunks and each chunk goes through a
//! write/read-back/compare transaction. A transaction that does not verify is
//! repeated until it does (or until the configured [`RetryPolicy`] gives up).
//!
//! ## Command sets
//!
//! - **Legacy**: ASCII `A`/`W`/`R` commands, one byte per command, 64-byte chunks
//! - **Block** (default): one `B` frame plus a raw payload, 1024-byte chunks
//!
//! ## Features
//!
//! - `native` (default): serial port support via the `serialport` crate
//! - `serde`: serialization support for reports and [`ProtocolKind`]
//!
//! ## Example
//!
//! ```rust,no_run
//! use hexflash::{HexImage, LoadEvent, ProtocolKind, RetryPolicy, SerialConfig};
//!
//! fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let image = HexImage::from_file("firmware.hex")?;
//!
//!     #[cfg(feature = "native")]
//!     {
//!         let config = SerialConfig::new("/dev/ttyUSB0");
//!         let mut loader = ProtocolKind::Block.create_loader(&config, RetryPolicy::default())?;
//!
//!         let report = loader.load(&image, &mut |event| {
//!             if let LoadEvent::Attempt { address, len, .. } = event {
//!                 println!("WRITING {len} BYTES AT ADDRESS ${address:04x}");
//!             }
//!         })?;
//!         println!("DONE, {} RETRIES", report.retries);
//!         loader.close();
//!     }
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

use std::sync::{Arc, OnceLock};

pub mod error;
pub mod image;
pub mod loader;
pub mod port;
pub mod protocol;

#[cfg(test)]
mod testing;

static INTERRUPT_CHECKER: OnceLock<Arc<dyn Fn() -> bool + Send + Sync>> = OnceLock::new();

/// Register a global interruption checker used by long-running library loops.
///
/// The checker should return `true` when the current operation should stop
/// (for example after receiving Ctrl-C in CLI applications). Only the first
/// registration takes effect.
pub fn set_interrupt_checker<F>(checker: F)
where
    F: Fn() -> bool + Send + Sync + 'static,
{
    let _ = INTERRUPT_CHECKER.set(Arc::new(checker));
}

/// Returns whether interruption was requested by the embedding application.
#[must_use]
pub fn is_interrupted_requested() -> bool {
    INTERRUPT_CHECKER
        .get()
        .is_some_and(|checker| checker())
}

// Re-exports for convenience
#[cfg(feature = "native")]
pub use port::NativePort;
pub use {
    error::{Error, Result},
    image::{HexImage, Segment, StartAddress},
    loader::{Chunk, ChunkLoader, LoadEvent, LoadReport, Loader, RetryPolicy},
    port::{Port, SerialConfig},
    protocol::{BlockProtocol, ChunkProtocol, Failure, LegacyProtocol, Outcome, ProtocolKind},
};
