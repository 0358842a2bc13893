//! Rbel - decode captured traffic into parse trees.
//!
//! This binary drives the decoding pipeline offline:
//! - `replay`: convert every message of a trace file again and print the trees
//! - `decode`: convert a single raw message from a file
//! - `config`: print the effective configuration

use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use clap::{Parser, Subcommand};
use directories::ProjectDirs;
use rbel_core::converter::vau;
use rbel_core::{MessageMetadata, RbelConfig, RbelConverter};
use rbel_proxy::{TraceReader, TrafficCapture};
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// How long `replay` waits for outstanding conversions.
const REPLAY_DRAIN_TIMEOUT: Duration = Duration::from_secs(60);

/// Rbel - multi-layer traffic decoder
#[derive(Parser, Debug)]
#[command(name = "rbel", version, about)]
struct Args {
    /// Configuration file (JSON)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable VAU decryption in addition to the configured converters
    #[arg(long, global = true)]
    vau: bool,

    /// Enable debug logging
    #[arg(long, global = true)]
    debug: bool,

    /// Set log level (error, warn, info, debug, trace)
    #[arg(long, global = true, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Convert every message of a trace file and print the trees
    Replay {
        /// Trace file written by a capture
        trace: PathBuf,
    },
    /// Convert one raw message read from a file
    Decode {
        /// File holding the raw message bytes
        file: PathBuf,
    },
    /// Print the effective configuration
    Config,
}

/// Get the logs directory path.
fn logs_dir() -> Option<PathBuf> {
    ProjectDirs::from("", "rbel", "Rbel").map(|dirs| dirs.data_dir().join("logs"))
}

/// Initialize logging to stderr and, when possible, a rotating file.
fn init_logging(args: &Args) -> Option<tracing_appender::non_blocking::WorkerGuard> {
    let log_level = if args.debug { "debug" } else { &args.log_level };

    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| {
        EnvFilter::new(format!(
            "rbel={0},rbel_core={0},rbel_proxy={0},warn",
            log_level
        ))
    });

    if let Some(log_dir) = logs_dir() {
        if std::fs::create_dir_all(&log_dir).is_ok() {
            let file_appender = RollingFileAppender::builder()
                .rotation(Rotation::DAILY)
                .max_log_files(5)
                .filename_prefix("rbel")
                .filename_suffix("log")
                .build(&log_dir)
                .ok();

            if let Some(appender) = file_appender {
                let (non_blocking, guard) = tracing_appender::non_blocking(appender);
                tracing_subscriber::registry()
                    .with(env_filter)
                    .with(fmt::layer().with_writer(std::io::stderr))
                    .with(fmt::layer().with_writer(non_blocking).with_ansi(false))
                    .init();

                tracing::debug!("Logging to {:?}", log_dir);
                return Some(guard);
            }
        }
    }

    // Fallback: console logging only
    tracing_subscriber::fmt()
        .with_env_filter(env_filter)
        .with_writer(std::io::stderr)
        .init();

    tracing::warn!("File logging unavailable, using console only");
    None
}

/// Loads the configuration file (or defaults) and applies command-line overrides.
fn load_config(args: &Args) -> anyhow::Result<RbelConfig> {
    let mut config = match &args.config {
        Some(path) => RbelConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration {:?}", path))?,
        None => RbelConfig::default(),
    };
    if args.vau && !config.is_converter_active(vau::FEATURE) {
        config = config.with_converter(vau::FEATURE);
    }
    // Offline runs never append to the capture trace they may be reading.
    config.trace_file = None;
    Ok(config)
}

fn replay(config: RbelConfig, trace: &Path) -> anyhow::Result<()> {
    let capture = TrafficCapture::new(config)?;
    let reader =
        TraceReader::open(trace).with_context(|| format!("Failed to open trace {:?}", trace))?;
    let count = capture.replay(reader)?;
    if !capture.wait_idle(REPLAY_DRAIN_TIMEOUT) {
        tracing::warn!("Some messages were still converting after {:?}", REPLAY_DRAIN_TIMEOUT);
    }

    // History is published in dispatch order, which is trace order.
    let messages = capture.history().snapshot();
    for message in &messages {
        println!("{}", message.render_tree());
    }
    tracing::info!("Printed {} of {} replayed messages", messages.len(), count);
    Ok(())
}

fn decode(config: RbelConfig, file: &Path) -> anyhow::Result<()> {
    let raw = std::fs::read(file).with_context(|| format!("Failed to read {:?}", file))?;
    let converter = RbelConverter::new(config)?;
    let message = converter.parse_message(raw, MessageMetadata::new());
    println!("{}", message.render_tree());
    Ok(())
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    // Keep the guard alive for the duration of the program
    let _log_guard = init_logging(&args);
    tracing::debug!("Args: {:?}", args);

    let config = load_config(&args)?;
    match &args.command {
        Command::Replay { trace } => replay(config, trace)?,
        Command::Decode { file } => decode(config, file)?,
        Command::Config => println!("{}", serde_json::to_string_pretty(&config)?),
    }
    Ok(())
}
