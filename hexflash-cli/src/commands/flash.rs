//! Flash command implementation.

use anyhow::{Context, Result};
use console::style;
use hexflash::{HexImage, LoadEvent, ProtocolKind, RetryPolicy, SerialConfig};
use indicatif::{ProgressBar, ProgressStyle};
use log::warn;
use std::path::Path;
use std::time::Duration;

use crate::config::Config;
use crate::{Cli, CliError, use_fancy_output, was_interrupted};

/// Port used when neither the command line nor a config file names one.
pub(crate) const DEFAULT_PORT: &str = "/dev/ttyUSB0";

fn ensure_not_interrupted() -> Result<()> {
    if was_interrupted() {
        Err(CliError::Cancelled("Interrupted".to_string()).into())
    } else {
        Ok(())
    }
}

/// Effective settings after merging command line, environment and config.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct FlashSettings {
    pub port: String,
    pub baud: u32,
    pub timeout: Duration,
    pub protocol: ProtocolKind,
    pub policy: RetryPolicy,
}

impl FlashSettings {
    /// Command line (and environment) wins over config, config over defaults.
    pub(crate) fn resolve(cli: &Cli, config: &Config) -> Result<Self> {
        let max_attempts = cli.max_attempts.or(config.flash.max_attempts);
        if max_attempts == Some(0) {
            return Err(CliError::Config("flash.max_attempts must be at least 1".into()).into());
        }
        let baud = cli
            .baud
            .or(config.connection.baud)
            .unwrap_or(hexflash::port::DEFAULT_BAUD);
        if baud == 0 {
            return Err(CliError::Config("connection.baud must be non-zero".into()).into());
        }

        let policy = RetryPolicy {
            max_attempts,
            backoff: Duration::from_millis(
                cli.retry_delay_ms
                    .or(config.flash.retry_delay_ms)
                    .unwrap_or(0),
            ),
            ..RetryPolicy::default()
        };

        Ok(Self {
            port: cli
                .port
                .clone()
                .or_else(|| config.connection.port.clone())
                .unwrap_or_else(|| DEFAULT_PORT.to_string()),
            baud,
            timeout: cli
                .timeout_ms
                .or(config.connection.timeout_ms)
                .map_or(hexflash::port::DEFAULT_TIMEOUT, Duration::from_millis),
            protocol: cli
                .protocol
                .map(ProtocolKind::from)
                .or(config.flash.protocol)
                .unwrap_or_default(),
            policy,
        })
    }

    fn serial_config(&self) -> SerialConfig {
        SerialConfig::new(&self.port)
            .with_baud(self.baud)
            .with_timeout(self.timeout)
    }
}

/// Console line printed before every transaction.
pub(crate) fn attempt_line(address: u32, len: usize) -> String {
    format!("WRITING {len} BYTES AT ADDRESS ${address:04x}")
}

/// Console line printed after a failed transaction.
pub(crate) fn retry_line(failure: &hexflash::Failure) -> String {
    format!("--- {} - RETRYING ---", failure.label())
}

/// Summary line printed once every chunk verified.
pub(crate) fn done_line(retries: u64) -> String {
    format!("DONE, {retries} RETRIES")
}

/// Write `image_path` to the target.
pub(crate) fn cmd_flash(cli: &Cli, config: &Config, image_path: &Path) -> Result<()> {
    let image = HexImage::from_file(image_path)
        .with_context(|| format!("Failed to load image {}", image_path.display()))?;
    let settings = FlashSettings::resolve(cli, config)?;

    // Reject images the command set cannot address before opening the port
    settings
        .protocol
        .check_image(&image)
        .with_context(|| format!("Image {} does not fit the target", image_path.display()))?;

    if image.is_empty() {
        warn!("Image {} contains no data", image_path.display());
    }

    if !cli.quiet {
        eprintln!(
            "{} {} bytes in {} segment(s) from {}",
            style("ℹ").blue(),
            image.len(),
            image.segments().len(),
            image_path.display()
        );
        eprintln!(
            "{} Using {} at {} baud, {} protocol",
            style("🔌").cyan(),
            settings.port,
            settings.baud,
            settings.protocol
        );
    }

    ensure_not_interrupted()?;
    let mut loader = settings
        .protocol
        .create_loader(&settings.serial_config(), settings.policy)
        .with_context(|| format!("Failed to open {}", settings.port))?;

    // Create progress bar
    let pb = if cli.quiet || !use_fancy_output() {
        ProgressBar::hidden()
    } else {
        let pb = ProgressBar::new(image.len() as u64);
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template("{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}")
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    };

    let result = loader.load(&image, &mut |event| match event {
        LoadEvent::Attempt { address, len, .. } => {
            pb.suspend(|| println!("{}", attempt_line(*address, *len)));
        },
        LoadEvent::Retry {
            failure, retries, ..
        } => {
            pb.suspend(|| println!("{}", retry_line(failure)));
            pb.set_message(format!("{retries} retries"));
        },
        LoadEvent::Verified { len, .. } => pb.inc(*len as u64),
    });

    // Release the serial port
    loader.close();

    match result {
        Ok(report) => {
            pb.finish_and_clear();
            println!("{}", done_line(report.retries));
            if !cli.quiet {
                eprintln!(
                    "{} {} bytes verified in {} chunk(s)",
                    style("✓").green(),
                    report.bytes,
                    report.chunks
                );
            }
            Ok(())
        },
        Err(hexflash::Error::Interrupted) => {
            pb.abandon();
            Err(CliError::Cancelled("Interrupted".to_string()).into())
        },
        Err(err) => {
            pb.abandon();
            Err(err.into())
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::Parser;
    use hexflash::Failure;

    fn parse(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("hexflash").chain(args.iter().copied())).unwrap()
    }

    #[test]
    fn test_resolve_defaults() {
        let settings = FlashSettings::resolve(&parse(&["a.hex"]), &Config::default()).unwrap();
        assert_eq!(settings.baud, 62_500);
        assert_eq!(settings.timeout, Duration::from_millis(1000));
        assert_eq!(settings.protocol, ProtocolKind::Block);
        assert_eq!(settings.policy, RetryPolicy::default());
    }

    #[test]
    fn test_resolve_config_then_cli() {
        let mut config = Config::default();
        config.connection.port = Some("/dev/ttyACM1".to_string());
        config.connection.baud = Some(9600);
        config.flash.protocol = Some(ProtocolKind::Legacy);
        config.flash.max_attempts = Some(4);

        let from_config = FlashSettings::resolve(&parse(&["-p", "COM7", "a.hex"]), &config).unwrap();
        assert_eq!(from_config.port, "COM7");
        assert_eq!(from_config.baud, 9600);
        assert_eq!(from_config.protocol, ProtocolKind::Legacy);
        assert_eq!(from_config.policy.max_attempts, Some(4));

        let overridden = FlashSettings::resolve(
            &parse(&[
                "--protocol",
                "block",
                "--max-attempts",
                "2",
                "--retry-delay-ms",
                "15",
                "a.hex",
            ]),
            &config,
        )
        .unwrap();
        assert_eq!(overridden.protocol, ProtocolKind::Block);
        assert_eq!(overridden.policy.max_attempts, Some(2));
        assert_eq!(overridden.policy.backoff, Duration::from_millis(15));
        assert!(overridden.policy.clear_on_retry);
    }

    #[test]
    fn test_resolve_rejects_zero_attempts_in_config() {
        let mut config = Config::default();
        config.flash.max_attempts = Some(0);
        let err = FlashSettings::resolve(&parse(&["a.hex"]), &config).unwrap_err();
        assert!(matches!(
            err.downcast_ref::<CliError>(),
            Some(CliError::Config(_))
        ));
    }

    #[test]
    fn test_console_lines() {
        assert_eq!(attempt_line(0x01a0, 64), "WRITING 64 BYTES AT ADDRESS $01a0");
        assert_eq!(
            retry_line(&Failure::LengthError {
                expected: 5,
                actual: 4
            }),
            "--- LENGTH ERROR - RETRYING ---"
        );
        assert_eq!(
            retry_line(&Failure::CommandError),
            "--- COMMAND ERROR - RETRYING ---"
        );
        assert_eq!(done_line(0), "DONE, 0 RETRIES");
        assert_eq!(done_line(12), "DONE, 12 RETRIES");
    }
}
