//! Intel HEX firmware images.
//!
//! An Intel HEX file is a list of ASCII records, one per line:
//!
//! ```text
//! +---+-------+---------+------+-------------+----------+
//! | : | count | address | type |    data     | checksum |
//! +---+-------+---------+------+-------------+----------+
//! | 1 |   2   |    4    |  2   | 2 * count   |    2     |
//! +---+-------+---------+------+-------------+----------+
//! ```
//!
//! All fields are hex digits. The checksum is the two's complement of the
//! sum of every decoded byte before it, so a valid record sums to zero.
//!
//! Supported record types:
//!
//! | Type | Meaning                                     |
//! |------|---------------------------------------------|
//! | 00   | Data                                        |
//! | 01   | End of file                                 |
//! | 02   | Extended segment address (base = seg * 16)  |
//! | 03   | Start segment address (CS:IP)               |
//! | 04   | Extended linear address (base = upper << 16)|
//! | 05   | Start linear address (EIP)                  |

use crate::error::{Error, Result};
use byteorder::{BigEndian, ReadBytesExt};
use log::{debug, warn};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

/// Record type codes.
pub mod record {
    /// Data record.
    pub const DATA: u8 = 0x00;
    /// End-of-file record.
    pub const END_OF_FILE: u8 = 0x01;
    /// Extended segment address record.
    pub const EXTENDED_SEGMENT_ADDRESS: u8 = 0x02;
    /// Start segment address record.
    pub const START_SEGMENT_ADDRESS: u8 = 0x03;
    /// Extended linear address record.
    pub const EXTENDED_LINEAR_ADDRESS: u8 = 0x04;
    /// Start linear address record.
    pub const START_LINEAR_ADDRESS: u8 = 0x05;
}

/// Execution start address carried by the image.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StartAddress {
    /// 80x86 real-mode CS:IP pair (record 03).
    Segment {
        /// Code segment.
        cs: u16,
        /// Instruction pointer.
        ip: u16,
    },
    /// 32-bit linear address (record 05).
    Linear(u32),
}

/// A run of contiguous addresses and their byte values.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Segment {
    /// First address of the run.
    pub start: u32,
    /// One byte per address, in address order.
    pub data: Vec<u8>,
}

impl Segment {
    /// Create a segment starting at `start`.
    pub fn new(start: u32, data: Vec<u8>) -> Self {
        Self { start, data }
    }

    /// Exclusive stop address.
    pub fn end(&self) -> u64 {
        u64::from(self.start) + self.data.len() as u64
    }

    /// Number of bytes in the segment.
    pub fn len(&self) -> usize {
        self.data.len()
    }

    /// Whether the segment holds no bytes.
    pub fn is_empty(&self) -> bool {
        self.data.is_empty()
    }

    /// Check if `address` falls inside the segment.
    pub fn contains(&self, address: u32) -> bool {
        address >= self.start && u64::from(address) < self.end()
    }
}

/// A parsed Intel HEX image.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HexImage {
    segments: Vec<Segment>,
    start_address: Option<StartAddress>,
}

impl HexImage {
    /// Parse an Intel HEX file from disk.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref();
        debug!("Loading HEX image from {}", path.display());
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse Intel HEX text.
    pub fn parse(text: &str) -> Result<Self> {
        let mut bytes = BTreeMap::new();
        let mut base: u32 = 0;
        let mut start_address = None;
        let mut eof_line = None;

        for (index, raw) in text.lines().enumerate() {
            let line = index + 1;
            let raw = raw.trim();
            if raw.is_empty() {
                continue;
            }
            if let Some(eof) = eof_line {
                return Err(invalid(
                    line,
                    format!("record after end-of-file on line {eof}"),
                ));
            }

            let rec = decode_record(line, raw)?;
            match rec.kind {
                record::DATA => {
                    for (i, &value) in rec.data.iter().enumerate() {
                        // Index is bounded by the one-byte record length.
                        #[allow(clippy::cast_possible_truncation)]
                        let address = base
                            .wrapping_add(u32::from(rec.offset))
                            .wrapping_add(i as u32);
                        if bytes.insert(address, value).is_some() {
                            return Err(invalid(
                                line,
                                format!("address ${address:04x} is defined more than once"),
                            ));
                        }
                    }
                },
                record::END_OF_FILE => {
                    expect_len(line, &rec, 0)?;
                    eof_line = Some(line);
                },
                record::EXTENDED_SEGMENT_ADDRESS => {
                    expect_len(line, &rec, 2)?;
                    base = u32::from((&rec.data[..]).read_u16::<BigEndian>()?) << 4;
                },
                record::START_SEGMENT_ADDRESS => {
                    expect_len(line, &rec, 4)?;
                    let mut cursor = &rec.data[..];
                    let cs = cursor.read_u16::<BigEndian>()?;
                    let ip = cursor.read_u16::<BigEndian>()?;
                    start_address = Some(StartAddress::Segment { cs, ip });
                },
                record::EXTENDED_LINEAR_ADDRESS => {
                    expect_len(line, &rec, 2)?;
                    base = u32::from((&rec.data[..]).read_u16::<BigEndian>()?) << 16;
                },
                record::START_LINEAR_ADDRESS => {
                    expect_len(line, &rec, 4)?;
                    start_address = Some(StartAddress::Linear(
                        (&rec.data[..]).read_u32::<BigEndian>()?,
                    ));
                },
                other => {
                    return Err(invalid(line, format!("unknown record type {other:02x}")));
                },
            }
        }

        if eof_line.is_none() {
            warn!("HEX image has no end-of-file record");
        }

        let image = Self {
            segments: coalesce(bytes),
            start_address,
        };
        debug!(
            "Parsed {} bytes in {} segment(s)",
            image.len(),
            image.segments.len()
        );
        Ok(image)
    }

    /// Build an image from raw `(start, data)` runs.
    ///
    /// Adjacent runs are merged; overlapping runs are rejected.
    pub fn from_segments<I>(runs: I) -> Result<Self>
    where
        I: IntoIterator<Item = (u32, Vec<u8>)>,
    {
        let mut bytes = BTreeMap::new();
        for (start, data) in runs {
            for (i, value) in data.into_iter().enumerate() {
                #[allow(clippy::cast_possible_truncation)]
                let address = start.wrapping_add(i as u32);
                if bytes.insert(address, value).is_some() {
                    return Err(Error::AddressOverlap { address });
                }
            }
        }

        Ok(Self {
            segments: coalesce(bytes),
            start_address: None,
        })
    }

    /// Contiguous address runs, in ascending address order.
    pub fn segments(&self) -> &[Segment] {
        &self.segments
    }

    /// Byte stored at `address`, if the image defines it.
    pub fn get(&self, address: u32) -> Option<u8> {
        let idx = self
            .segments
            .partition_point(|s| s.start <= address)
            .checked_sub(1)?;
        let segment = &self.segments[idx];
        segment
            .contains(address)
            .then(|| segment.data[(address - segment.start) as usize])
    }

    /// Total number of bytes defined by the image.
    pub fn len(&self) -> usize {
        self.segments
            .iter()
            .map(Segment::len)
            .sum()
    }

    /// Whether the image defines no bytes at all.
    pub fn is_empty(&self) -> bool {
        self.segments.is_empty()
    }

    /// Start address record, if present.
    pub fn start_address(&self) -> Option<StartAddress> {
        self.start_address
    }
}

struct Record {
    offset: u16,
    kind: u8,
    data: Vec<u8>,
}

fn invalid(line: usize, reason: impl Into<String>) -> Error {
    Error::InvalidHex {
        line,
        reason: reason.into(),
    }
}

fn expect_len(line: usize, rec: &Record, len: usize) -> Result<()> {
    if rec.data.len() == len {
        Ok(())
    } else {
        Err(invalid(
            line,
            format!(
                "record type {:02x} needs {len} data bytes, found {}",
                rec.kind,
                rec.data.len()
            ),
        ))
    }
}

fn decode_record(line: usize, raw: &str) -> Result<Record> {
    let body = raw
        .strip_prefix(':')
        .ok_or_else(|| invalid(line, "missing ':' start code"))?;

    if body.len() % 2 != 0 {
        return Err(invalid(line, "odd number of hex digits"));
    }
    if !body.bytes().all(|c| c.is_ascii_hexdigit()) {
        return Err(invalid(line, "non-hex character in record"));
    }

    let bytes: Vec<u8> = body
        .as_bytes()
        .chunks(2)
        .map(|pair| (hex_value(pair[0]) << 4) | hex_value(pair[1]))
        .collect();

    // count + address(2) + type + checksum
    if bytes.len() < 5 {
        return Err(invalid(line, "record too short"));
    }
    let count = bytes[0] as usize;
    if bytes.len() != count + 5 {
        return Err(invalid(
            line,
            format!(
                "byte count {count} does not match {} data bytes",
                bytes.len() - 5
            ),
        ));
    }

    let sum = bytes
        .iter()
        .fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != 0 {
        let expected = bytes[..bytes.len() - 1]
            .iter()
            .fold(0u8, |acc, b| acc.wrapping_add(*b))
            .wrapping_neg();
        return Err(invalid(
            line,
            format!(
                "checksum mismatch: expected {expected:02x}, got {:02x}",
                bytes[bytes.len() - 1]
            ),
        ));
    }

    let offset = (&bytes[1..3]).read_u16::<BigEndian>()?;
    Ok(Record {
        offset,
        kind: bytes[3],
        data: bytes[4..4 + count].to_vec(),
    })
}

fn hex_value(c: u8) -> u8 {
    match c {
        b'0'..=b'9' => c - b'0',
        b'a'..=b'f' => c - b'a' + 10,
        b'A'..=b'F' => c - b'A' + 10,
        _ => 0,
    }
}

fn coalesce(bytes: BTreeMap<u32, u8>) -> Vec<Segment> {
    let mut segments: Vec<Segment> = Vec::new();
    for (address, value) in bytes {
        match segments.last_mut() {
            Some(seg) if seg.end() == u64::from(address) => seg.data.push(value),
            _ => segments.push(Segment::new(address, vec![value])),
        }
    }
    segments
}
