//! Configuration file support for hexflash.
//!
//! Configuration is loaded from multiple sources with the following priority (highest first):
//! 1. Command-line arguments
//! 2. Environment variables (HEXFLASH_*)
//! 3. Local config file (./hexflash.toml)
//! 4. Global config file (~/.config/hexflash/config.toml)
//!
//! A file that cannot be read or parsed is skipped with a warning.

use directories::ProjectDirs;
use hexflash::ProtocolKind;
use log::{debug, warn};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

/// Name of the per-project config file.
pub const LOCAL_CONFIG_FILE: &str = "hexflash.toml";

/// Connection configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ConnectionConfig {
    /// Preferred serial port (e.g., "/dev/ttyUSB0" or "COM3").
    pub port: Option<String>,
    /// Line rate.
    pub baud: Option<u32>,
    /// Read timeout in milliseconds.
    pub timeout_ms: Option<u64>,
}

/// Flash configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct FlashConfig {
    /// Command set.
    pub protocol: Option<ProtocolKind>,
    /// Give up on a chunk after this many attempts.
    pub max_attempts: Option<u32>,
    /// Delay before each retry, in milliseconds.
    pub retry_delay_ms: Option<u64>,
}

/// Main configuration structure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Connection configuration.
    #[serde(default)]
    pub connection: ConnectionConfig,
    /// Flash configuration.
    #[serde(default)]
    pub flash: FlashConfig,
}

impl Config {
    /// Load configuration from all available sources.
    pub fn load() -> Self {
        let mut config = Self::default();

        // Load global config
        if let Some(global_path) = Self::global_config_path() {
            if let Some(global_config) = Self::load_from_file(&global_path) {
                debug!("Loaded global config from {}", global_path.display());
                config.merge(global_config);
            }
        }

        // Load local config (overrides global)
        if let Some(local_config) = Self::load_from_file(Path::new(LOCAL_CONFIG_FILE)) {
            debug!("Loaded local config from {LOCAL_CONFIG_FILE}");
            config.merge(local_config);
        }

        config
    }

    /// Load configuration from a specific file path (--config flag).
    pub fn load_from_path(path: &Path) -> Self {
        if let Some(config) = Self::load_from_file(path) {
            debug!("Loaded config from {}", path.display());
            config
        } else {
            warn!(
                "Could not load config from {}, using defaults",
                path.display()
            );
            Self::default()
        }
    }

    /// Load configuration from a specific file.
    fn load_from_file(path: &Path) -> Option<Self> {
        if !path.exists() {
            return None;
        }

        match fs::read_to_string(path) {
            Ok(content) => match toml::from_str(&content) {
                Ok(config) => Some(config),
                Err(e) => {
                    warn!("Failed to parse config file {}: {}", path.display(), e);
                    None
                },
            },
            Err(e) => {
                warn!("Failed to read config file {}: {}", path.display(), e);
                None
            },
        }
    }

    /// Get the global configuration directory.
    pub fn global_config_dir() -> Option<PathBuf> {
        ProjectDirs::from("", "", "hexflash").map(|dirs| dirs.config_dir().to_path_buf())
    }

    /// Get the global configuration file path.
    pub fn global_config_path() -> Option<PathBuf> {
        Self::global_config_dir().map(|dir| dir.join("config.toml"))
    }

    /// Merge another config into this one.
    fn merge(&mut self, other: Self) {
        // Connection config
        if other.connection.port.is_some() {
            self.connection.port = other.connection.port;
        }
        if other.connection.baud.is_some() {
            self.connection.baud = other.connection.baud;
        }
        if other.connection.timeout_ms.is_some() {
            self.connection.timeout_ms = other.connection.timeout_ms;
        }

        // Flash config
        if other.flash.protocol.is_some() {
            self.flash.protocol = other.flash.protocol;
        }
        if other.flash.max_attempts.is_some() {
            self.flash.max_attempts = other.flash.max_attempts;
        }
        if other.flash.retry_delay_ms.is_some() {
            self.flash.retry_delay_ms = other.flash.retry_delay_ms;
        }
    }
}
