//! Block-transfer command set.
//!
//! One control frame carries the address and length, then the payload goes
//! out as a single raw burst:
//!
//! ```text
//! +---+-----------+-----------+
//! | B | addr (4)  | count (4) |   ASCII, lower-case hex
//! +---+-----------+-----------+
//! ```
//!
//! The target echoes the frame, stores `count` raw bytes, then sends the
//! stored bytes back. The readback is bounded by the port timeout, so it may
//! arrive short.

use log::{debug, trace};

use crate::error::{Error, Result};
use crate::loader::Chunk;
use crate::port::{Port, read_up_to};
use crate::protocol::{
    ADDRESS_LIMIT, ChunkProtocol, Failure, Outcome, ProtocolKind, check_range, classify,
};

/// Largest chunk the block command set carries per transaction.
pub const MAX_CHUNK: usize = 1024;

/// Length of the control frame: marker, 4 address digits, 4 count digits.
pub const FRAME_LEN: usize = 9;

/// Build the control frame for `count` bytes at `address`.
pub fn block_frame(address: u32, count: usize) -> Result<Vec<u8>> {
    if address >= ADDRESS_LIMIT {
        return Err(Error::AddressOutOfRange {
            address,
            len: count,
            limit: ADDRESS_LIMIT,
        });
    }
    check_range(address, count)?;
    let count = u16::try_from(count).map_err(|_| {
        Error::Protocol(format!("block count {count} does not fit in 4 hex digits"))
    })?;
    Ok(format!("B{address:04x}{count:04x}").into_bytes())
}

/// The block-transfer command set.
#[derive(Debug, Clone, Copy, Default)]
pub struct BlockProtocol;

impl ChunkProtocol for BlockProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Block
    }

    fn execute<P: Port + ?Sized>(&self, port: &mut P, chunk: &Chunk) -> Result<Outcome> {
        self.validate(chunk)?;
        let frame = block_frame(chunk.address, chunk.len())?;
        trace!("-> {}", String::from_utf8_lossy(&frame));

        port.write_all_bytes(&frame)?;
        let echo = read_up_to(port, frame.len())?;
        if echo != frame {
            debug!(
                "Frame echo mismatch: sent {:?}, got {:?}",
                String::from_utf8_lossy(&frame),
                String::from_utf8_lossy(&echo)
            );
            return Ok(Outcome::Failed(Failure::CommandError));
        }

        trace!("-> {} payload bytes", chunk.len());
        port.write_all_bytes(&chunk.data)?;
        let readback = read_up_to(port, chunk.len())?;
        trace!("<- {} readback bytes", readback.len());

        Ok(classify(&chunk.data, &readback))
    }
}
