//! Firmware image sources.

pub mod ihex;

pub use ihex::{HexImage, Segment, StartAddress};
