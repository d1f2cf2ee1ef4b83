//! hexflash CLI - write Intel HEX images to a target over a serial link.
//!
//! ## Features
//!
//! - Legacy (byte-at-a-time) and block command sets
//! - Per-chunk write/verify with retry until the chunk verifies
//! - Configurable retry ceiling and backoff
//! - Configuration files and environment variable support
//! - `info` command to inspect an image without a target

use anyhow::Result;
use clap::{CommandFactory, Parser, Subcommand, ValueEnum, error::ErrorKind};
use console::style;
use env_logger::Env;
use hexflash::ProtocolKind;
use log::debug;
use std::env;
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::atomic::{AtomicBool, Ordering};

mod commands;
mod config;

use config::Config;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: AtomicBool = AtomicBool::new(true);

/// Set by the Ctrl-C handler.
static INTERRUPTED: AtomicBool = AtomicBool::new(false);

/// Check if progress animations should be used (TTY and colors enabled).
pub(crate) fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(Ordering::Relaxed)
}

/// hexflash - write an Intel HEX image into a target's memory over serial.
///
/// Environment variables:
///   HEXFLASH_PORT      - Default serial port
///   HEXFLASH_BAUD      - Default baud rate (default: 62500)
///   HEXFLASH_PROTOCOL  - Default command set (legacy, block)
#[derive(Parser)]
#[command(name = "hexflash")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  hexflash firmware.hex\n  hexflash -p /dev/ttyACM0 --protocol legacy firmware.hex\n  hexflash info --json firmware.hex")]
pub(crate) struct Cli {
    /// Serial port to use [default: /dev/ttyUSB0].
    #[arg(short, long, global = true, env = "HEXFLASH_PORT")]
    pub port: Option<String>,

    /// Baud rate [default: 62500].
    #[arg(
        short,
        long,
        global = true,
        env = "HEXFLASH_BAUD",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub baud: Option<u32>,

    /// Command set spoken to the target [default: block].
    #[arg(long, global = true, value_enum, env = "HEXFLASH_PROTOCOL")]
    pub protocol: Option<ProtocolArg>,

    /// Read timeout in milliseconds [default: 1000].
    #[arg(long, global = true, value_name = "MS")]
    pub timeout_ms: Option<u64>,

    /// Give up on a chunk after this many attempts [default: unlimited].
    #[arg(
        long,
        global = true,
        value_name = "N",
        value_parser = clap::value_parser!(u32).range(1..)
    )]
    pub max_attempts: Option<u32>,

    /// Wait this long before retrying a chunk [default: 0].
    #[arg(long, global = true, value_name = "MS")]
    pub retry_delay_ms: Option<u64>,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    pub verbose: u8,

    /// Quiet mode (only the progress lines and the summary).
    #[arg(short, long, global = true)]
    pub quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    pub config_path: Option<PathBuf>,

    /// Intel HEX image to write.
    #[arg(value_name = "IMAGE")]
    pub image: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Commands>,
}

/// Command set names accepted on the command line.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
pub(crate) enum ProtocolArg {
    /// Byte-at-a-time A/W/R commands, 64-byte chunks.
    Legacy,
    /// B frame plus raw payload, 1024-byte chunks.
    Block,
}

impl From<ProtocolArg> for ProtocolKind {
    fn from(arg: ProtocolArg) -> Self {
        match arg {
            ProtocolArg::Legacy => ProtocolKind::Legacy,
            ProtocolArg::Block => ProtocolKind::Block,
        }
    }
}

/// Available commands.
#[derive(Subcommand)]
pub(crate) enum Commands {
    /// Show the segments and chunk plan of an image.
    Info {
        /// Path to the Intel HEX image.
        image: PathBuf,

        /// Output information as JSON to stdout.
        #[arg(long)]
        json: bool,
    },
}

/// Errors that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Invalid invocation.
    #[error("{0}")]
    Usage(String),
    /// Unusable configuration.
    #[error("{0}")]
    Config(String),
    /// Stopped by the user.
    #[error("{0}")]
    Cancelled(String),
}

/// Exit codes:
/// 0 success, 1 generic failure, 2 usage, 3 configuration, 4 device,
/// 130 cancelled.
fn exit_code_for_error(err: &anyhow::Error) -> u8 {
    if let Some(cli_err) = err.downcast_ref::<CliError>() {
        return match cli_err {
            CliError::Usage(_) => 2,
            CliError::Config(_) => 3,
            CliError::Cancelled(_) => 130,
        };
    }

    match err.downcast_ref::<hexflash::Error>() {
        Some(hexflash::Error::Interrupted) => 130,
        Some(hexflash::Error::Serial(_)) => 4,
        _ => 1,
    }
}

fn main() -> ExitCode {
    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();

    // Setup logging based on verbosity
    let log_level = if cli.quiet {
        "error"
    } else {
        match cli.verbose {
            0 => "warn",
            1 => "info",
            2 => "debug",
            _ => "trace",
        }
    };
    env_logger::Builder::from_env(Env::default().default_filter_or(log_level))
        .format_target(cli.verbose >= 2)
        .format_timestamp(if cli.verbose >= 2 {
            Some(env_logger::TimestampPrecision::Millis)
        } else {
            None
        })
        .init();

    debug!(
        "hexflash v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    if let Err(e) = ctrlc::set_handler(|| INTERRUPTED.store(true, Ordering::Relaxed)) {
        debug!("Could not install Ctrl-C handler: {e}");
    }
    hexflash::set_interrupt_checker(was_interrupted);

    match run(&cli) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code_for_error(&err))
        },
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match (&cli.command, &cli.image) {
        (Some(_), Some(extra)) => Err(CliError::Usage(format!(
            "unexpected argument '{}' before the subcommand",
            extra.display()
        ))
        .into()),
        (Some(Commands::Info { image, json }), None) => {
            commands::info::cmd_info(cli, &config, image, *json)
        },
        (None, Some(image)) => commands::flash::cmd_flash(cli, &config, image),
        (None, None) => Cli::command()
            .error(
                ErrorKind::MissingRequiredArgument,
                "the following required arguments were not provided:\n  <IMAGE>",
            )
            .exit(),
    }
}
