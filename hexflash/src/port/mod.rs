//! Port abstraction for the serial link to the target.
//!
//! The protocol drivers only see the [`Port`] trait, so they can run against
//! a real serial port or against an in-memory target in tests.
//!
//! ```text
//! +---------------------+
//! |   Loader / driver   |
//! |  (legacy, block)    |
//! +----------+----------+
//!            |
//!            v
//! +----------+----------+
//! |     Port trait      |
//! +----------+----------+
//!            |
//!            v
//! +----------+----------+
//! |  NativePort         |
//! |  (serialport)       |
//! +---------------------+
//! ```
//!
//! ## Example
//!
//! ```rust,no_run
//! use hexflash::port::{Port, read_up_to};
//!
//! fn echo<P: Port>(port: &mut P) -> hexflash::Result<bool> {
//!     port.write_all_bytes(b"A0100")?;
//!     let echo = read_up_to(port, 5)?;
//!     Ok(echo == b"A0100")
//! }
//! ```

#[cfg(feature = "native")]
pub mod native;

use std::io::{ErrorKind, Read, Write};
use std::time::Duration;

use log::trace;

use crate::error::Result;

/// Line rate the target firmware is built for.
pub const DEFAULT_BAUD: u32 = 62_500;

/// Default read timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_millis(1000);

/// Serial port configuration.
#[derive(Debug, Clone)]
pub struct SerialConfig {
    /// Port name/path (e.g., "/dev/ttyUSB0", "COM3").
    pub port_name: String,
    /// Baud rate.
    pub baud_rate: u32,
    /// Read/write timeout.
    pub timeout: Duration,
    /// Data bits (typically 8).
    pub data_bits: DataBits,
    /// Parity (typically None).
    pub parity: Parity,
    /// Stop bits (typically One).
    pub stop_bits: StopBits,
    /// Flow control (typically None).
    pub flow_control: FlowControl,
}

impl Default for SerialConfig {
    fn default() -> Self {
        Self {
            port_name: String::new(),
            baud_rate: DEFAULT_BAUD,
            timeout: DEFAULT_TIMEOUT,
            data_bits: DataBits::Eight,
            parity: Parity::None,
            stop_bits: StopBits::One,
            flow_control: FlowControl::None,
        }
    }
}

impl SerialConfig {
    /// Create a new configuration with port name and the target's line rate.
    pub fn new(port_name: impl Into<String>) -> Self {
        Self {
            port_name: port_name.into(),
            ..Default::default()
        }
    }

    /// Set the baud rate.
    #[must_use]
    pub fn with_baud(mut self, baud_rate: u32) -> Self {
        self.baud_rate = baud_rate;
        self
    }

    /// Set the timeout.
    #[must_use]
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }
}

/// Number of data bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DataBits {
    /// 7 data bits.
    Seven,
    /// 8 data bits.
    #[default]
    Eight,
}

/// Parity checking mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum Parity {
    /// No parity.
    #[default]
    None,
    /// Odd parity.
    Odd,
    /// Even parity.
    Even,
}

/// Number of stop bits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum StopBits {
    /// 1 stop bit.
    #[default]
    One,
    /// 2 stop bits.
    Two,
}

/// Flow control mode.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum FlowControl {
    /// No flow control.
    #[default]
    None,
    /// Hardware flow control (RTS/CTS).
    Hardware,
    /// Software flow control (XON/XOFF).
    Software,
}

/// Byte-oriented duplex link to the target.
pub trait Port: Read + Write + Send {
    /// Discard anything buffered in either direction.
    fn clear_buffers(&mut self) -> Result<()>;

    /// Get the port name/path.
    fn name(&self) -> &str;

    /// Close the port and release resources.
    ///
    /// After calling this method, the port cannot be used for further I/O.
    fn close(&mut self) -> Result<()>;

    /// Write all bytes, blocking until complete.
    fn write_all_bytes(&mut self, buf: &[u8]) -> Result<()> {
        std::io::Write::write_all(self, buf)?;
        std::io::Write::flush(self)?;
        Ok(())
    }
}

/// Read up to `n` bytes, stopping early when the port times out.
///
/// A short result is not an error: the caller decides what a missing tail
/// means for its transaction.
pub fn read_up_to<R: Read + ?Sized>(port: &mut R, n: usize) -> Result<Vec<u8>> {
    let mut buf = vec![0u8; n];
    let mut filled = 0;

    while filled < n {
        match port.read(&mut buf[filled..]) {
            Ok(0) => break,
            Ok(count) => filled += count,
            Err(e) if matches!(e.kind(), ErrorKind::TimedOut | ErrorKind::WouldBlock) => {
                trace!("Read timed out after {filled}/{n} bytes");
                break;
            },
            Err(e) if e.kind() == ErrorKind::Interrupted => {},
            Err(e) => return Err(e.into()),
        }
    }

    buf.truncate(filled);
    Ok(buf)
}

// Re-export the appropriate implementation based on features
#[cfg(feature = "native")]
pub use native::NativePort;
