//! Byte-granular ASCII command set.
//!
//! Every byte crosses the wire three times, once per phase:
//!
//! ```text
//! host                                target
//!  |-- A<addr:4> ---------------------->|   set pointer
//!  |<------------------------ A<addr:4> |   echo
//!  |-- W<byte:2> W<byte:2> ... -------->|   store, pointer += 1
//!  |<-------------- W<byte:2> W<...> .. |   echoes
//!  |-- A<addr:4> ---------------------->|   rewind pointer
//!  |<------------------------ A<addr:4> |
//!  |-- Rxx Rxx ... -------------------->|   load, pointer += 1
//!  |<-------------- R<byte:2> R<...> .. |   values
//! ```
//!
//! All hex digits are lower-case.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::loader::Chunk;
use crate::port::{Port, read_up_to};
use crate::protocol::{ADDRESS_LIMIT, ChunkProtocol, Failure, Outcome, ProtocolKind, classify};

/// Largest chunk the legacy command set carries per transaction.
pub const MAX_CHUNK: usize = 64;

/// Read request; the two `x` characters are placeholders the target skips.
pub const READ_COMMAND: &[u8; 3] = b"Rxx";

/// Length of one read response: `R` plus two hex digits.
pub const READ_RESPONSE_LEN: usize = 3;

/// Build the address-set command, `A` + 4 hex digits.
pub fn address_command(address: u32) -> Result<Vec<u8>> {
    if address >= ADDRESS_LIMIT {
        return Err(Error::AddressOutOfRange {
            address,
            len: 0,
            limit: ADDRESS_LIMIT,
        });
    }
    Ok(format!("A{address:04x}").into_bytes())
}

/// Build the write command for one byte, `W` + 2 hex digits.
pub fn write_command(value: u8) -> Vec<u8> {
    format!("W{value:02x}").into_bytes()
}

/// Parse one `R<hex><hex>` response.
pub fn parse_read_response(response: &[u8]) -> Option<u8> {
    match response {
        [b'R', hi, lo] => {
            let hi = char::from(*hi).to_digit(16)?;
            let lo = char::from(*lo).to_digit(16)?;
            u8::try_from((hi << 4) | lo).ok()
        },
        _ => None,
    }
}

/// The byte-at-a-time command set.
#[derive(Debug, Clone, Copy, Default)]
pub struct LegacyProtocol;

impl LegacyProtocol {
    /// Point the target at `address` and check the echo.
    fn set_address<P: Port + ?Sized>(port: &mut P, address: u32) -> Result<bool> {
        let cmd = address_command(address)?;
        trace!("-> {}", String::from_utf8_lossy(&cmd));
        port.write_all_bytes(&cmd)?;

        let echo = read_up_to(port, cmd.len())?;
        if echo != cmd {
            debug!(
                "Address echo mismatch: sent {:?}, got {:?}",
                String::from_utf8_lossy(&cmd),
                String::from_utf8_lossy(&echo)
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Send every write command, then collect all echoes.
    fn write_bytes<P: Port + ?Sized>(port: &mut P, data: &[u8]) -> Result<bool> {
        let commands: Vec<u8> = data
            .iter()
            .flat_map(|&b| write_command(b))
            .collect();
        trace!("-> {} write commands", data.len());
        port.write_all_bytes(&commands)?;

        let echoes = read_up_to(port, commands.len())?;
        if echoes != commands {
            let at = echoes
                .iter()
                .zip(&commands)
                .position(|(a, b)| a != b)
                .unwrap_or(echoes.len());
            debug!(
                "Write echo mismatch at byte {} of {} ({} of {} echo bytes received)",
                at / 3,
                data.len(),
                echoes.len(),
                commands.len()
            );
            return Ok(false);
        }
        Ok(true)
    }

    /// Request `count` bytes and decode the responses.
    ///
    /// Returns `None` when a response is malformed.
    fn read_bytes<P: Port + ?Sized>(port: &mut P, count: usize) -> Result<Option<Vec<u8>>> {
        let requests = READ_COMMAND.repeat(count);
        trace!("-> {count} read requests");
        port.write_all_bytes(&requests)?;

        let raw = read_up_to(port, count * READ_RESPONSE_LEN)?;
        let mut values = Vec::with_capacity(count);
        for response in raw.chunks_exact(READ_RESPONSE_LEN) {
            match parse_read_response(response) {
                Some(value) => values.push(value),
                None => {
                    debug!(
                        "Malformed read response {:?}",
                        String::from_utf8_lossy(response)
                    );
                    return Ok(None);
                },
            }
        }
        Ok(Some(values))
    }
}

impl ChunkProtocol for LegacyProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Legacy
    }

    fn execute<P: Port + ?Sized>(&self, port: &mut P, chunk: &Chunk) -> Result<Outcome> {
        self.validate(chunk)?;
        debug!(
            "Legacy transaction: {} bytes at ${:04x}",
            chunk.len(),
            chunk.address
        );

        if !Self::set_address(port, chunk.address)? || !Self::write_bytes(port, &chunk.data)? {
            return Ok(Outcome::Failed(Failure::CommandError));
        }

        if !Self::set_address(port, chunk.address)? {
            return Ok(Outcome::Failed(Failure::CommandError));
        }

        match Self::read_bytes(port, chunk.len())? {
            Some(readback) => Ok(classify(&chunk.data, &readback)),
            None => Ok(Outcome::Failed(Failure::CommandError)),
        }
    }
}
