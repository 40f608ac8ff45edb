//! bootlink CLI - Receive firmware images over a serial line.
//!
//! ## Features
//!
//! - XMODEM/YMODEM receive into a file, with progress display
//! - Serial port listing (human or JSON output)
//! - Configuration files and environment variable support
//! - Ctrl-C cancels a running transfer cleanly (CAN CAN to the sender)

use std::env;
use std::fs::{self, File};
use std::io::BufWriter;
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use anyhow::{Context, Result};
use bootlink::{
    NativePort, NativePortEnumerator, PortEnumerator, TransferError, WriterSink, YmodemReceiver,
};
use clap::{Parser, Subcommand};
use console::style;
use env_logger::Env;
use indicatif::{ProgressBar, ProgressStyle};
use log::{debug, info, warn};

mod config;

use config::{Config, TransferMode};

/// Baud rate used when neither the command line nor a config file sets one.
const DEFAULT_BAUD: u32 = 115200;

/// bootlink - Receive firmware images from a bootloader host over serial.
///
/// Environment variables:
///   BOOTLINK_PORT   - Default serial port
///   BOOTLINK_BAUD   - Default baud rate (default: 115200)
#[derive(Parser)]
#[command(name = "bootlink")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
struct Cli {
    /// Serial port to use.
    #[arg(short, long, global = true, env = "BOOTLINK_PORT")]
    port: Option<String>,

    /// Baud rate for data transfer.
    #[arg(short, long, global = true, env = "BOOTLINK_BAUD")]
    baud: Option<u32>,

    /// Verbose output level (-v, -vv, -vvv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Receive a file with XMODEM/YMODEM and write it to disk.
    Receive {
        /// Output file.
        output: PathBuf,

        /// Integrity check to request from the sender.
        #[arg(long, value_enum)]
        mode: Option<TransferMode>,

        /// Consecutive failed blocks before aborting.
        #[arg(long, value_name = "N")]
        retries: Option<u32>,

        /// Time to wait for each block, in milliseconds.
        #[arg(long, value_name = "MS")]
        block_timeout: Option<u64>,

        /// Overwrite the output file if it exists.
        #[arg(short, long)]
        force: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },
}

/// Failures raised by the CLI itself.
#[derive(Debug, thiserror::Error)]
enum CliError {
    #[error("no serial port given; use --port, BOOTLINK_PORT or connection.serial in the config file")]
    NoPort,
    #[error("{} already exists (use --force to overwrite)", .0.display())]
    OutputExists(PathBuf),
}

/// Exit code: 3 for configuration errors, 130 when interrupted, 1 otherwise.
fn exit_code(err: &anyhow::Error) -> u8 {
    if let Some(cli) = err.downcast_ref::<CliError>() {
        return match cli {
            CliError::NoPort => 3,
            CliError::OutputExists(_) => 1,
        };
    }
    match err.downcast_ref::<bootlink::Error>() {
        Some(bootlink::Error::Config(_)) => 3,
        Some(bootlink::Error::Transfer(TransferError::Cancelled)) => 130,
        _ => 1,
    }
}

fn main() -> ExitCode {
    let stderr_is_tty = console::Term::stderr().is_term();
    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    let cli = Cli::parse();
    init_logging(&cli);

    debug!(
        "bootlink v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    match run(&cli, stderr_is_tty) {
        Ok(()) => ExitCode::SUCCESS,
        Err(err) => {
            eprintln!("{} {err:#}", style("Error:").red().bold());
            ExitCode::from(exit_code(&err))
        },
    }
}

fn init_logging(cli: &Cli) {
    let log_level = if cli.quiet {
        "warn"
    } else {
        match cli.verbose {
            0 => "info",
            1 => "debug",
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
}

fn run(cli: &Cli, fancy: bool) -> Result<()> {
    let config = if let Some(ref path) = cli.config_path {
        Config::load_from_path(path)
    } else {
        Config::load()
    };

    match &cli.command {
        Commands::Receive {
            output,
            mode,
            retries,
            block_timeout,
            force,
        } => {
            let mut transfer = config.transfer.clone();
            transfer.mode = mode.or(transfer.mode);
            transfer.max_retries = retries.or(transfer.max_retries);
            transfer.block_timeout_ms = block_timeout.or(transfer.block_timeout_ms);

            let options = ReceiveOptions {
                output,
                connection: &config.connection,
                force: *force,
                port: cli
                    .port
                    .clone()
                    .or_else(|| config.connection.serial.clone()),
                baud: cli.baud.or(config.connection.baud).unwrap_or(DEFAULT_BAUD),
                show_progress: fancy && !cli.quiet,
                quiet: cli.quiet,
            };
            cmd_receive(&options, &transfer)
        },
        Commands::ListPorts { json } => cmd_list_ports(*json),
    }
}

struct ReceiveOptions<'a> {
    output: &'a Path,
    connection: &'a config::ConnectionConfig,
    force: bool,
    port: Option<String>,
    baud: u32,
    show_progress: bool,
    quiet: bool,
}

/// Receive command implementation.
fn cmd_receive(options: &ReceiveOptions<'_>, transfer: &config::TransferConfig) -> Result<()> {
    if options.output.exists() && !options.force {
        return Err(CliError::OutputExists(options.output.to_path_buf()).into());
    }
    let port_name = options.port.as_deref().ok_or(CliError::NoPort)?;

    let ymodem = transfer.to_ymodem_config();
    let serial = options
        .connection
        .serial_config(port_name, options.baud)?
        .with_timeout(ymodem.poll_interval);

    install_interrupt_handler();

    let mut port = NativePort::open(&serial)
        .with_context(|| format!("failed to open {port_name} at {} baud", options.baud))?;
    port.clear_buffers()?;
    info!("Listening on {port_name} at {} baud", options.baud);

    let file = File::create(options.output)
        .with_context(|| format!("failed to create {}", options.output.display()))?;
    let mut sink = WriterSink::new(BufWriter::new(file));

    if !options.quiet {
        eprintln!(
            "{} Waiting for sender on {}...",
            style("⏳").yellow(),
            style(port_name).cyan()
        );
    }

    let pb = if options.show_progress {
        let pb = ProgressBar::no_length();
        #[allow(clippy::unwrap_used)] // Static template string
        pb.set_style(
            ProgressStyle::default_bar()
                .template(
                    "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {bytes}/{total_bytes} {msg}",
                )
                .unwrap()
                .progress_chars("#>-"),
        );
        pb.set_draw_target(indicatif::ProgressDrawTarget::stderr());
        pb
    } else {
        ProgressBar::hidden()
    };

    let result = YmodemReceiver::with_config(&mut port, ymodem).receive(
        &mut sink,
        |done, total| {
            if let Some(total) = total {
                pb.set_length(total);
            }
            pb.set_position(done);
        },
    );

    let summary = match result {
        Ok(summary) => {
            pb.finish_and_clear();
            summary
        },
        Err(e) => {
            pb.abandon();
            drop(sink);
            if let Err(remove_err) = fs::remove_file(options.output) {
                warn!(
                    "Failed to remove partial file {}: {remove_err}",
                    options.output.display()
                );
            }
            return Err(bootlink::Error::from(e)).context("transfer failed");
        },
    };

    sink.finish()
        .with_context(|| format!("failed to write {}", options.output.display()))?;

    if !options.quiet {
        let announced = summary
            .file
            .as_ref()
            .map(|file| format!(" ({})", style(&file.name).cyan()))
            .unwrap_or_default();
        eprintln!(
            "{} Received {} bytes in {} blocks{} -> {}",
            style("✓").green(),
            summary.bytes,
            summary.blocks,
            announced,
            options.output.display()
        );
    }

    Ok(())
}

/// Route Ctrl-C to the library's cancellation checks.
fn install_interrupt_handler() {
    let interrupted = Arc::new(AtomicBool::new(false));
    let handler_flag = Arc::clone(&interrupted);
    if let Err(e) = ctrlc::set_handler(move || handler_flag.store(true, Ordering::SeqCst)) {
        warn!("Failed to install Ctrl-C handler: {e}");
    }
    bootlink::set_interrupt_checker(move || interrupted.load(Ordering::SeqCst));
}

/// List ports command implementation.
fn cmd_list_ports(json: bool) -> Result<()> {
    let ports = NativePortEnumerator::list_ports()?;

    if json {
        println!("{}", serde_json::to_string_pretty(&ports)?);
        return Ok(());
    }

    eprintln!("{}", style("Available serial ports:").bold().underlined());

    if ports.is_empty() {
        eprintln!("  {}", style("(none found)").dim());
        return Ok(());
    }

    for port in &ports {
        let vid_pid = if let (Some(vid), Some(pid)) = (port.vid, port.pid) {
            format!(" ({vid:04X}:{pid:04X})")
        } else {
            String::new()
        };
        let product = port
            .product
            .as_deref()
            .map(|p| format!(" - {}", style(p).dim()))
            .unwrap_or_default();

        eprintln!(
            "  {} {}{}{}",
            style("•").green(),
            style(&port.name).cyan(),
            vid_pid,
            product
        );
    }

    Ok(())
}
