//! `asi` command-line tool.

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use asi_protocol::constants::COMMAND_PARAM_COUNT;
use asi_protocol::{Command, ProtocolError, Telegram, TelegramDecoder};
use asi_sim::{Bench, SimError, SimResult};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

/// Simulate and inspect ASI telemetry devices
#[derive(Parser, Debug)]
#[command(name = "asi")]
#[command(about = "Simulate and inspect ASI telemetry devices", long_about = None)]
#[command(version)]
struct Args {
    /// Log level used when RUST_LOG is not set
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Build a bench, feed it commands and print the resulting telegrams as JSON
    Run {
        /// Bench description (YAML)
        #[arg(value_name = "FILE")]
        bench: PathBuf,

        /// Command frame to send, e.g. "<LOGGING_GETSIGNALLIST,1,0,0,0,0,0,0,0,0,0>" (repeatable)
        #[arg(short, long = "command", value_name = "FRAME")]
        commands: Vec<String>,

        /// Scheduler ticks to run after the commands
        #[arg(long, default_value_t = 0)]
        ticks: usize,

        /// Simulated milliseconds between ticks
        #[arg(long, default_value_t = 100)]
        tick_ms: u64,

        /// Message id for scheduler-triggered telegrams
        #[arg(long, default_value_t = 0)]
        message_id: u32,
    },

    /// Decode a captured device output stream to JSON
    Decode {
        /// Capture file
        #[arg(value_name = "FILE")]
        capture: PathBuf,

        /// The capture is hex text rather than raw bytes
        #[arg(long)]
        hex: bool,
    },

    /// Print a framed command line
    Command {
        /// Command name, e.g. LOGGING_ACTIVATE
        name: String,

        /// Up to ten parameters; the first may be a string
        #[arg(allow_hyphen_values = true)]
        params: Vec<String>,
    },
}

fn main() -> ExitCode {
    let args = Args::parse();
    init_logging(&args.log_level);
    asi_metrics::describe_metrics();

    match run(args.command) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

fn init_logging(level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr)
        .init();
}

fn run(command: Commands) -> SimResult<()> {
    match command {
        Commands::Run {
            bench,
            commands,
            ticks,
            tick_ms,
            message_id,
        } => run_bench(&bench, &commands, ticks, tick_ms, message_id),
        Commands::Decode { capture, hex } => decode_capture(&capture, hex),
        Commands::Command { name, params } => {
            let command = build_command(&name, &params)?;
            println!("{}", String::from_utf8_lossy(&command.encode()));
            Ok(())
        }
    }
}

fn run_bench(
    path: &Path,
    commands: &[String],
    ticks: usize,
    tick_ms: u64,
    message_id: u32,
) -> SimResult<()> {
    let bench = Bench::load(path)?;
    let mut rig = bench.build()?;
    info!(
        bench = %path.display(),
        subordinates = rig.subordinates.len(),
        "bench built"
    );

    let mut telegrams = Vec::new();
    for frame in commands {
        let handled = rig.send(frame.as_bytes());
        if handled.is_empty() {
            warn!(frame = %frame, "no command handled");
        }
        telegrams.extend(rig.telegrams()?);
    }

    if ticks > 0 {
        let fired = rig.run_ticks(ticks, tick_ms, message_id);
        info!(ticks, fired, "scheduler run complete");
        telegrams.extend(rig.telegrams()?);
    }

    if let Some(report) = rig.device.last_report() {
        for failure in report.failures() {
            if !matches!(failure, ProtocolError::BusProbeFailed { .. }) {
                warn!("{}", failure);
            }
        }
    }

    print_telegrams(&telegrams)
}

fn decode_capture(path: &Path, is_hex: bool) -> SimResult<()> {
    let bytes = capture_bytes(std::fs::read(path)?, is_hex)?;
    print_telegrams(&decode_telegrams(&bytes))
}

/// Raw capture contents, or the bytes spelled out by hex text with any
/// whitespace ignored.
fn capture_bytes(raw: Vec<u8>, is_hex: bool) -> SimResult<Vec<u8>> {
    if !is_hex {
        return Ok(raw);
    }
    let text: String = String::from_utf8_lossy(&raw)
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect();
    Ok(hex::decode(text)?)
}

/// Every telegram in a capture. Undecodable telegrams are logged and skipped.
fn decode_telegrams(bytes: &[u8]) -> Vec<Telegram> {
    let mut decoder = TelegramDecoder::new();
    decoder.push(bytes);
    let mut telegrams = Vec::new();
    for result in decoder.decode_all() {
        match result {
            Ok(telegram) => telegrams.push(telegram),
            Err(e) => warn!("skipping telegram: {}", e),
        }
    }
    if decoder.buffered_len() > 0 {
        info!(bytes = decoder.buffered_len(), "incomplete data left at end of capture");
    }
    telegrams
}

fn print_telegrams(telegrams: &[Telegram]) -> SimResult<()> {
    println!("{}", serde_json::to_string_pretty(telegrams)?);
    Ok(())
}

/// Build a command from CLI arguments. The first parameter is kept verbatim
/// as the string field; the rest must be integers.
fn build_command(name: &str, params: &[String]) -> SimResult<Command> {
    if params.len() > COMMAND_PARAM_COUNT {
        return Err(SimError::InvalidArgument(format!(
            "at most {} parameters, got {}",
            COMMAND_PARAM_COUNT,
            params.len()
        )));
    }
    let text = params.first().map(String::as_str).unwrap_or("0");
    let mut rest = [0i32; COMMAND_PARAM_COUNT - 1];
    for (slot, param) in rest.iter_mut().zip(params.iter().skip(1)) {
        *slot = param
            .parse()
            .map_err(|_| SimError::InvalidArgument(format!("'{}' is not an integer", param)))?;
    }
    Ok(Command::with_text(name, text, rest))
}
