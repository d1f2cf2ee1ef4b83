//! Chunked write/verify/retry over a whole image.
//!
//! ```text
//!  HexImage ──> segments ──> chunks(max) ──> ChunkProtocol::execute
//!                                                 │
//!                              Success <──────────┤
//!                                                 │ Failed(failure)
//!                              retries += 1 <─────┘  then the same chunk again
//! ```
//!
//! A chunk is either pending or verified. A failed chunk is sent again in
//! full; nothing is carried over from the failed transaction.

pub mod chunk;
pub mod policy;

use std::sync::Arc;
use std::thread;

use log::{debug, error, info, warn};

use crate::error::{Error, Result};
use crate::image::HexImage;
use crate::port::Port;
use crate::protocol::{ChunkProtocol, Failure, Outcome, ProtocolKind};

pub use chunk::{Chunk, chunks, plan};
pub use policy::RetryPolicy;

/// Progress notifications emitted while an image loads.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadEvent {
    /// A transaction is about to start.
    Attempt {
        /// Chunk base address.
        address: u32,
        /// Chunk length.
        len: usize,
        /// 1-based attempt number for this chunk.
        attempt: u32,
    },
    /// A transaction failed and the chunk will be sent again.
    Retry {
        /// Chunk base address.
        address: u32,
        /// Why it failed.
        failure: Failure,
        /// Retries so far across the whole run, this one included.
        retries: u64,
    },
    /// A chunk verified.
    Verified {
        /// Chunk base address.
        address: u32,
        /// Chunk length.
        len: usize,
    },
}

/// Summary of a completed load.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize))]
pub struct LoadReport {
    /// Segments written.
    pub segments: usize,
    /// Chunks verified.
    pub chunks: usize,
    /// Bytes verified.
    pub bytes: usize,
    /// Failed transactions that were retried.
    pub retries: u64,
}

/// Writes whole images to a target.
///
/// This trait is object safe so the CLI can pick a command set at runtime.
pub trait Loader {
    /// Command set in use.
    fn protocol(&self) -> ProtocolKind;

    /// Check that every chunk of `image` can be expressed on the wire.
    fn validate(&self, image: &HexImage) -> Result<()>;

    /// Write and verify `image`, segment by segment, in ascending address
    /// order.
    fn load(&mut self, image: &HexImage, events: &mut dyn FnMut(&LoadEvent))
    -> Result<LoadReport>;

    /// Release the port.
    fn close(&mut self);
}

type InterruptChecker = Arc<dyn Fn() -> bool + Send + Sync>;

/// [`Loader`] running one [`ChunkProtocol`] over one [`Port`].
pub struct ChunkLoader<P: Port, C: ChunkProtocol> {
    port: P,
    protocol: C,
    policy: RetryPolicy,
    interrupted: InterruptChecker,
}

impl<P: Port, C: ChunkProtocol> ChunkLoader<P, C> {
    /// Create a loader with the default (unbounded) retry policy.
    pub fn new(port: P, protocol: C) -> Self {
        Self {
            port,
            protocol,
            policy: RetryPolicy::default(),
            interrupted: Arc::new(crate::is_interrupted_requested),
        }
    }

    /// Set the retry policy.
    #[must_use]
    pub fn with_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Replace the process-wide interrupt checker for this loader.
    #[must_use]
    pub fn with_interrupt_checker<F>(mut self, checker: F) -> Self
    where
        F: Fn() -> bool + Send + Sync + 'static,
    {
        self.interrupted = Arc::new(checker);
        self
    }

    /// Get a reference to the port.
    pub fn port(&self) -> &P {
        &self.port
    }

    /// Run transactions for `chunk` until one verifies.
    ///
    /// Adds one to `report.retries` per failed transaction that is followed
    /// by another attempt. A failure the policy does not allow to retry ends
    /// the run without a `Retry` event.
    fn program_chunk(
        &mut self,
        chunk: &Chunk,
        report: &mut LoadReport,
        events: &mut dyn FnMut(&LoadEvent),
    ) -> Result<()> {
        let mut attempt: u32 = 0;
        loop {
            if (self.interrupted)() {
                return Err(Error::Interrupted);
            }

            attempt = attempt.saturating_add(1);
            events(&LoadEvent::Attempt {
                address: chunk.address,
                len: chunk.len(),
                attempt,
            });

            let failure = match self.protocol.execute(&mut self.port, chunk)? {
                Outcome::Success => {
                    events(&LoadEvent::Verified {
                        address: chunk.address,
                        len: chunk.len(),
                    });
                    return Ok(());
                },
                Outcome::Failed(failure) => failure,
            };

            if !self.policy.allows_another(attempt) {
                error!(
                    "{} at ${:04x}, giving up after {attempt} attempt(s)",
                    failure.label(),
                    chunk.address
                );
                return Err(Error::RetriesExhausted {
                    address: chunk.address,
                    attempts: attempt,
                    last: failure,
                });
            }

            report.retries += 1;
            warn!(
                "{} at ${:04x} (attempt {attempt}): {failure}",
                failure.label(),
                chunk.address
            );
            events(&LoadEvent::Retry {
                address: chunk.address,
                failure,
                retries: report.retries,
            });

            if self.policy.clear_on_retry {
                self.port.clear_buffers()?;
            }
            if !self.policy.backoff.is_zero() {
                thread::sleep(self.policy.backoff);
            }
        }
    }
}

impl<P: Port, C: ChunkProtocol> Loader for ChunkLoader<P, C> {
    fn protocol(&self) -> ProtocolKind {
        self.protocol.kind()
    }

    fn validate(&self, image: &HexImage) -> Result<()> {
        plan(image, self.protocol.max_chunk())
            .iter()
            .try_for_each(|chunk| self.protocol.validate(chunk))
    }

    fn load(
        &mut self,
        image: &HexImage,
        events: &mut dyn FnMut(&LoadEvent),
    ) -> Result<LoadReport> {
        self.validate(image)?;

        let max = self.protocol.max_chunk();
        let mut report = LoadReport::default();
        info!(
            "Loading {} bytes in {} segment(s) over {} using {} protocol",
            image.len(),
            image.segments().len(),
            self.port.name(),
            self.protocol.kind()
        );

        for segment in image.segments() {
            debug!(
                "Segment ${:04x}..${:04x} ({} bytes)",
                segment.start,
                segment.end(),
                segment.len()
            );
            for chunk in chunks(segment, max) {
                self.program_chunk(&chunk, &mut report, events)?;
                report.chunks += 1;
                report.bytes += chunk.len();
            }
            report.segments += 1;
        }

        info!(
            "Loaded {} bytes in {} chunks, {} retries",
            report.bytes, report.chunks, report.retries
        );
        Ok(report)
    }

    fn close(&mut self) {
        if let Err(e) = self.port.close() {
            debug!("Error closing {}: {e}", self.port.name());
        }
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::protocol::{BlockProtocol, LegacyProtocol};
    use crate::testing::{Fault, SimTarget};

    const DATA: [u8; 5] = [0x11, 0x22, 0x33, 0x44, 0x55];

    fn five_bytes() -> HexImage {
        HexImage::from_segments([(0x0000, DATA.to_vec())]).unwrap()
    }

    fn block(sim: SimTarget) -> ChunkLoader<SimTarget, BlockProtocol> {
        ChunkLoader::new(sim, BlockProtocol).with_interrupt_checker(|| false)
    }

    fn collect(
        loader: &mut dyn Loader,
        image: &HexImage,
    ) -> (Result<LoadReport>, Vec<LoadEvent>) {
        let mut events = Vec::new();
        let result = loader.load(image, &mut |e| events.push(*e));
        (result, events)
    }

    #[test]
    fn test_clean_block_load() {
        let mut loader = block(SimTarget::new());
        let (report, events) = collect(&mut loader, &five_bytes());

        let report = report.unwrap();
        assert_eq!(report.retries, 0);
        assert_eq!(report.chunks, 1);
        assert_eq!(report.bytes, 5);
        assert_eq!(
            events,
            vec![
                LoadEvent::Attempt {
                    address: 0,
                    len: 5,
                    attempt: 1
                },
                LoadEvent::Verified { address: 0, len: 5 },
            ]
        );
        assert_eq!(loader.port().memory(0, 5), &DATA);
    }

    #[test]
    fn test_one_bad_readback_is_one_retry() {
        let mut loader = block(SimTarget::with_faults([Fault::FlipReadback]));
        let (report, events) = collect(&mut loader, &five_bytes());

        assert_eq!(report.unwrap().retries, 1);
        assert!(events.contains(&LoadEvent::Retry {
            address: 0,
            failure: Failure::VerificationError { offset: 0 },
            retries: 1,
        }));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, LoadEvent::Attempt { .. }))
                .count(),
            2
        );
        assert_eq!(loader.port().clears, 1);
        assert_eq!(loader.port().memory(0, 5), &DATA);
    }

    #[test]
    fn test_one_short_readback_is_one_retry() {
        let mut loader = block(SimTarget::with_faults([Fault::TruncateReadback]));
        let (report, events) = collect(&mut loader, &five_bytes());

        assert_eq!(report.unwrap().retries, 1);
        assert_eq!(
            events,
            vec![
                LoadEvent::Attempt {
                    address: 0,
                    len: 5,
                    attempt: 1
                },
                LoadEvent::Retry {
                    address: 0,
                    failure: Failure::LengthError {
                        expected: 5,
                        actual: 4
                    },
                    retries: 1,
                },
                LoadEvent::Attempt {
                    address: 0,
                    len: 5,
                    attempt: 2
                },
                LoadEvent::Verified { address: 0, len: 5 },
            ]
        );
        assert_eq!(loader.port().memory(0, 5), &DATA);
    }

    #[test]
    fn test_each_corrupt_echo_counts_once() {
        let faults = [Fault::CorruptEcho, Fault::CorruptEcho, Fault::CorruptEcho];
        let mut loader = block(SimTarget::with_faults(faults));
        let (report, events) = collect(&mut loader, &five_bytes());

        assert_eq!(report.unwrap().retries, 3);
        let failures: Vec<Failure> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Retry { failure, .. } => Some(*failure),
                _ => None,
            })
            .collect();
        assert_eq!(failures, vec![Failure::CommandError; 3]);
        assert_eq!(loader.port().faults_left(), 0);
    }

    #[test]
    fn test_reload_is_idempotent() {
        let image = five_bytes();
        let mut loader = block(SimTarget::new());

        let first = loader.load(&image, &mut |_| {}).unwrap();
        let second = loader.load(&image, &mut |_| {}).unwrap();
        assert_eq!(first, second);
        assert_eq!(second.retries, 0);
    }

    #[test]
    fn test_legacy_recovers_from_desync() {
        let image = HexImage::from_segments([(0x0100, (0..100).collect::<Vec<u8>>())]).unwrap();
        let mut loader = ChunkLoader::new(
            SimTarget::with_faults([Fault::DropEcho, Fault::TruncateReadback]),
            LegacyProtocol,
        )
        .with_interrupt_checker(|| false);

        let report = loader.load(&image, &mut |_| {}).unwrap();
        assert_eq!(report.chunks, 2);
        assert_eq!(report.retries, 2);
        let expected: Vec<u8> = (0..100).collect();
        assert_eq!(loader.port().memory(0x0100, 100), &expected[..]);
    }

    #[test]
    fn test_bounded_policy_gives_up() {
        let mut loader = block(SimTarget::with_faults([Fault::DropEcho; 4]))
            .with_policy(RetryPolicy::bounded(3));
        let (result, events) = collect(&mut loader, &five_bytes());

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted {
                address: 0,
                attempts: 3,
                last: Failure::CommandError,
            })
        ));
        assert_eq!(
            events
                .iter()
                .filter(|e| matches!(e, LoadEvent::Retry { .. }))
                .count(),
            2
        );
        assert_eq!(
            events.last(),
            Some(&LoadEvent::Attempt {
                address: 0,
                len: 5,
                attempt: 3
            })
        );
    }

    #[test]
    fn test_single_attempt_failure_is_not_a_retry() {
        let mut loader = block(SimTarget::with_faults([Fault::CorruptEcho]))
            .with_policy(RetryPolicy::bounded(1));
        let (result, events) = collect(&mut loader, &five_bytes());

        assert!(matches!(
            result,
            Err(Error::RetriesExhausted {
                attempts: 1,
                last: Failure::CommandError,
                ..
            })
        ));
        assert_eq!(
            events,
            vec![LoadEvent::Attempt {
                address: 0,
                len: 5,
                attempt: 1
            }]
        );
        assert_eq!(loader.port().clears, 0);
    }

    #[test]
    fn test_bounded_policy_enough_attempts() {
        let mut loader = block(SimTarget::with_faults([Fault::DropEcho; 2]))
            .with_policy(RetryPolicy::bounded(3));
        assert_eq!(loader.load(&five_bytes(), &mut |_| {}).unwrap().retries, 2);
    }

    #[test]
    fn test_no_clear_when_disabled() {
        let mut loader = block(SimTarget::with_faults([Fault::FlipReadback]))
            .with_policy(RetryPolicy::default().with_clear_on_retry(false));
        loader.load(&five_bytes(), &mut |_| {}).unwrap();
        assert_eq!(loader.port().clears, 0);
    }

    #[test]
    fn test_interrupt_stops_before_next_chunk() {
        let calls = Arc::new(AtomicUsize::new(0));
        let seen = Arc::clone(&calls);
        let image = HexImage::from_segments([(0x0000, vec![0xAA; 2048])]).unwrap();
        let mut loader = ChunkLoader::new(SimTarget::new(), BlockProtocol)
            .with_interrupt_checker(move || seen.fetch_add(1, Ordering::SeqCst) >= 1);

        let result = loader.load(&image, &mut |_| {});
        assert!(matches!(result, Err(Error::Interrupted)));
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(loader.port().memory(0, 1024), &[0xAA; 1024][..]);
        assert_eq!(loader.port().memory(1024, 1), &[0xFF]);
    }

    #[test]
    fn test_out_of_range_image_sends_nothing() {
        let image =
            HexImage::from_segments([(0x0000, vec![1; 4]), (0xFFFE, vec![2; 4])]).unwrap();
        let mut loader = block(SimTarget::new());

        let result = loader.load(&image, &mut |_| {});
        assert!(matches!(result, Err(Error::AddressOutOfRange { .. })));
        assert!(loader.port().sent.is_empty());
    }

    #[test]
    fn test_segments_load_in_address_order() {
        let image = HexImage::from_segments([(0x3000, vec![3; 10]), (0x0040, vec![1; 10])]).unwrap();
        let mut loader = ChunkLoader::new(SimTarget::new(), LegacyProtocol)
            .with_interrupt_checker(|| false);
        let (report, events) = collect(&mut loader, &image);

        assert_eq!(report.unwrap().segments, 2);
        let order: Vec<u32> = events
            .iter()
            .filter_map(|e| match e {
                LoadEvent::Verified { address, .. } => Some(*address),
                _ => None,
            })
            .collect();
        assert_eq!(order, vec![0x0040, 0x3000]);
    }

    #[test]
    fn test_boxed_loader_reports_protocol() {
        let loader: Box<dyn Loader> = Box::new(block(SimTarget::new()));
        assert_eq!(loader.protocol(), ProtocolKind::Block);
    }
}
