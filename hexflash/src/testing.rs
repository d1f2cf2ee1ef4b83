//! In-memory model of the target firmware for driver and loader tests.
//!
//! The model understands both command sets over a 64 KiB memory. Host
//! writes are processed immediately and responses queue up for reads; an
//! empty queue reads as a port timeout. Faults are consumed in order, each
//! by the next response it applies to.

use std::collections::VecDeque;
use std::io::{self, Read, Write};

use crate::error::Result;
use crate::port::Port;

/// One scripted defect on the target-to-host path.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Fault {
    /// Flip the last byte of the next command echo; the target ignores the
    /// command it garbled.
    CorruptEcho,
    /// Suppress the next command echo and ignore the command.
    DropEcho,
    /// Drop the final byte of the next readback.
    TruncateReadback,
    /// Invert the first byte of the next readback.
    FlipReadback,
}

impl Fault {
    fn on_echo(self) -> bool {
        matches!(self, Self::CorruptEcho | Self::DropEcho)
    }
}

enum State {
    Command,
    Payload { address: u16, count: usize, received: usize },
}

pub(crate) struct SimTarget {
    memory: Vec<u8>,
    pointer: u16,
    state: State,
    pending: Vec<u8>,
    tx: VecDeque<u8>,
    faults: VecDeque<Fault>,
    /// Everything the host sent, in order.
    pub(crate) sent: Vec<u8>,
    /// Number of complete commands the target acted on.
    pub(crate) commands: usize,
    /// Number of `clear_buffers` calls.
    pub(crate) clears: usize,
}

/// Route library logs through the test harness (`RUST_LOG=trace` to see the wire).
fn init_logging() {
    let _ = env_logger::builder()
        .is_test(true)
        .try_init();
}

impl SimTarget {
    pub(crate) fn new() -> Self {
        init_logging();
        Self {
            memory: vec![0xFF; 0x1_0000],
            pointer: 0,
            state: State::Command,
            pending: Vec::new(),
            tx: VecDeque::new(),
            faults: VecDeque::new(),
            sent: Vec::new(),
            commands: 0,
            clears: 0,
        }
    }

    pub(crate) fn with_faults(faults: impl IntoIterator<Item = Fault>) -> Self {
        let mut sim = Self::new();
        sim.faults.extend(faults);
        sim
    }

    pub(crate) fn memory(&self, address: u16, len: usize) -> &[u8] {
        let start = address as usize;
        &self.memory[start..start + len]
    }

    pub(crate) fn faults_left(&self) -> usize {
        self.faults.len()
    }

    fn take_fault(&mut self, echo: bool) -> Option<Fault> {
        let next = *self.faults.front()?;
        (next.on_echo() == echo).then(|| self.faults.pop_front()).flatten()
    }

    /// Queue an echo; returns false when the target should ignore the command.
    fn echo(&mut self, frame: &[u8]) -> bool {
        match self.take_fault(true) {
            Some(Fault::CorruptEcho) => {
                let mut bad = frame.to_vec();
                if let Some(last) = bad.last_mut() {
                    *last ^= 0x20;
                }
                self.tx.extend(bad);
                false
            },
            Some(Fault::DropEcho) => false,
            _ => {
                self.tx.extend(frame.iter().copied());
                true
            },
        }
    }

    fn readback(&mut self, data: Vec<u8>) {
        let mut data = data;
        match self.take_fault(false) {
            Some(Fault::TruncateReadback) => {
                data.pop();
            },
            Some(Fault::FlipReadback) => {
                if let Some(first) = data.first_mut() {
                    *first = !*first;
                }
            },
            _ => {},
        }
        self.tx.extend(data);
    }

    fn feed(&mut self, byte: u8) {
        if let State::Payload {
            address,
            count,
            received,
        } = self.state
        {
            self.memory[address.wrapping_add(received as u16) as usize] = byte;
            let received = received + 1;
            if received == count {
                let start = address as usize;
                let data = self.memory[start..start + count].to_vec();
                self.state = State::Command;
                self.commands += 1;
                self.readback(data);
            } else {
                self.state = State::Payload {
                    address,
                    count,
                    received,
                };
            }
            return;
        }

        self.pending.push(byte);
        let needed = match self.pending[0].to_ascii_lowercase() {
            b'a' => 5,
            b'w' | b'r' => 3,
            b'b' => 9,
            _ => {
                self.pending.clear();
                return;
            },
        };
        if self.pending.len() < needed {
            return;
        }

        let frame = std::mem::take(&mut self.pending);
        let hex = std::str::from_utf8(&frame[1..]).unwrap_or("");
        match frame[0].to_ascii_lowercase() {
            b'a' => {
                if self.echo(&frame) {
                    self.pointer = u16::from_str_radix(hex, 16).unwrap_or(0);
                    self.commands += 1;
                }
            },
            b'w' => {
                if self.echo(&frame) {
                    self.memory[self.pointer as usize] = u8::from_str_radix(hex, 16).unwrap_or(0);
                    self.pointer = self.pointer.wrapping_add(1);
                    self.commands += 1;
                }
            },
            b'r' => {
                let value = self.memory[self.pointer as usize];
                self.pointer = self.pointer.wrapping_add(1);
                self.commands += 1;
                let response = format!("R{value:02x}").into_bytes();
                match self.take_fault(false) {
                    Some(Fault::TruncateReadback) => {},
                    Some(Fault::FlipReadback) => {
                        self.tx.extend(format!("R{:02x}", !value).into_bytes());
                    },
                    _ => self.tx.extend(response),
                }
            },
            b'b' => {
                if self.echo(&frame) {
                    let address = u16::from_str_radix(&hex[..4], 16).unwrap_or(0);
                    let count = usize::from_str_radix(&hex[4..], 16).unwrap_or(0);
                    if count == 0 {
                        self.commands += 1;
                    } else {
                        self.state = State::Payload {
                            address,
                            count,
                            received: 0,
                        };
                    }
                }
            },
            _ => unreachable!(),
        }
    }
}

impl Read for SimTarget {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        if self.tx.is_empty() {
            return Err(io::Error::new(io::ErrorKind::TimedOut, "no data"));
        }
        let n = buf.len().min(self.tx.len());
        for (slot, byte) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *slot = byte;
        }
        Ok(n)
    }
}

impl Write for SimTarget {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.sent.extend_from_slice(buf);
        for &byte in buf {
            self.feed(byte);
        }
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Port for SimTarget {
    fn clear_buffers(&mut self) -> Result<()> {
        self.tx.clear();
        self.clears += 1;
        Ok(())
    }

    fn name(&self) -> &str {
        "sim"
    }

    fn close(&mut self) -> Result<()> {
        Ok(())
    }
}
