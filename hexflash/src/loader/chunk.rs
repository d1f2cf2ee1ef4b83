//! Splitting image segments into protocol-sized chunks.

use crate::image::{HexImage, Segment};

/// A contiguous run of bytes written in one transaction.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Chunk {
    /// Target address of the first byte.
    pub address: u32,
    /// Bytes to write.
    pub data: Vec<u8>,
}

impl Chunk {
    /// Create a chunk.
    pub fn new(address: u32, data: Vec<u8>) -> Self {
        Self { address, data }
    }

    /// Number of bytes in the chunk.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the chunk carries no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Address one past the last byte.
    pub fn end(&self) -> u64 {
        u64::from(self.address) + self.data.len() as u64
    }
}

/// Split `segment` into chunks of at most `max` bytes, in address order.
///
/// Every chunk except the last is exactly `max` bytes long. A `max` of zero
/// is treated as one.
pub fn chunks(segment: &Segment, max: usize) -> impl Iterator<Item = Chunk> + '_ {
    let max = max.max(1);
    let start = segment.start;
    segment
        .data
        .chunks(max)
        .enumerate()
        .map(move |(i, data)| {
            #[allow(clippy::cast_possible_truncation)]
            let offset = (i * max) as u32;
            Chunk::new(start.saturating_add(offset), data.to_vec())
        })
}

/// Chunk every segment of `image`, segments in ascending address order.
pub fn plan(image: &HexImage, max: usize) -> Vec<Chunk> {
    image
        .segments()
        .iter()
        .flat_map(|segment| chunks(segment, max))
        .collect()
}
