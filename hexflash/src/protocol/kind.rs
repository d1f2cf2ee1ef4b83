//! Runtime selection of a command set.

use std::fmt;

use crate::error::Result;
use crate::image::HexImage;
use crate::loader::{ChunkLoader, Loader, RetryPolicy, plan};
#[cfg(feature = "native")]
use crate::port::{NativePort, SerialConfig};
use crate::port::Port;
use crate::protocol::{BlockProtocol, ChunkProtocol, LegacyProtocol, block, legacy};

/// Which command set to speak to the target.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[cfg_attr(
    feature = "serde",
    derive(serde::Serialize, serde::Deserialize),
    serde(rename_all = "lowercase")
)]
pub enum ProtocolKind {
    /// Byte-at-a-time `A`/`W`/`R` commands.
    Legacy,
    /// `B` frame plus raw payload.
    #[default]
    Block,
}

impl ProtocolKind {
    /// Every supported command set.
    pub const ALL: [Self; 2] = [Self::Legacy, Self::Block];

    /// Largest chunk a transaction may carry.
    #[must_use]
    pub fn max_chunk(&self) -> usize {
        match self {
            Self::Legacy => legacy::MAX_CHUNK,
            Self::Block => block::MAX_CHUNK,
        }
    }

    /// Lower-case name, as accepted by [`from_name`](Self::from_name).
    #[must_use]
    pub fn name(&self) -> &'static str {
        match self {
            Self::Legacy => "legacy",
            Self::Block => "block",
        }
    }

    /// Parse a command set name (case-insensitive).
    pub fn from_name(name: &str) -> Option<Self> {
        match name.to_lowercase().as_str() {
            "legacy" | "byte" => Some(Self::Legacy),
            "block" => Some(Self::Block),
            _ => None,
        }
    }

    /// Check that every chunk of `image` fits this command set, without
    /// touching a port.
    pub fn check_image(&self, image: &HexImage) -> Result<()> {
        let chunks = plan(image, self.max_chunk());
        match self {
            Self::Legacy => chunks
                .iter()
                .try_for_each(|chunk| LegacyProtocol.validate(chunk)),
            Self::Block => chunks
                .iter()
                .try_for_each(|chunk| BlockProtocol.validate(chunk)),
        }
    }

    /// Open a serial port and build a loader for this command set.
    #[cfg(feature = "native")]
    pub fn create_loader(
        &self,
        config: &SerialConfig,
        policy: RetryPolicy,
    ) -> Result<Box<dyn Loader>> {
        let port = NativePort::open(config)?;
        Ok(self.create_loader_with_port(port, policy))
    }

    /// Build a loader over an already open port.
    ///
    /// Useful for tests and custom port implementations.
    pub fn create_loader_with_port<P: Port + 'static>(
        &self,
        port: P,
        policy: RetryPolicy,
    ) -> Box<dyn Loader> {
        match self {
            Self::Legacy => Box::new(ChunkLoader::new(port, LegacyProtocol).with_policy(policy)),
            Self::Block => Box::new(ChunkLoader::new(port, BlockProtocol).with_policy(policy)),
        }
    }
}

impl fmt::Display for ProtocolKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Legacy => write!(f, "LEGACY"),
            Self::Block => write!(f, "BLOCK"),
        }
    }
}
