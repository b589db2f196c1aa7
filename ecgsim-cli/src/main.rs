//! ecgsim CLI - host tool for the ECGSim prototype ECG simulator.
//!
//! ## Features
//!
//! - Synthesize ECG, sine or pulse waveforms as 12-bit DAC codes
//! - Upload them sample by sample with per-sample acknowledgement
//! - Poll the device's average trigger time
//! - Interactive serial port selection
//! - A simulated device (`--simulate`) for use without hardware
//! - Shell completion generation
//! - Environment variable and config file support

use anyhow::Result;
use clap::{Args, Parser, Subcommand, ValueEnum};
use clap_complete::Shell;
use console::style;
use ecgsim::waveform::MIN_HEART_RATE;
use env_logger::Env;
use log::debug;
use std::env;
use std::num::NonZeroUsize;
use std::path::PathBuf;

/// Whether stderr is a terminal (set once at startup).
static STDERR_IS_TTY: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(true);

/// Check if emoji/animations should be used (TTY and colors enabled).
fn use_fancy_output() -> bool {
    STDERR_IS_TTY.load(std::sync::atomic::Ordering::Relaxed) && console::colors_enabled_stderr()
}

/// Set by the Ctrl-C handler.
static INTERRUPTED: std::sync::atomic::AtomicBool = std::sync::atomic::AtomicBool::new(false);

/// Whether the user pressed Ctrl-C.
pub(crate) fn was_interrupted() -> bool {
    INTERRUPTED.load(std::sync::atomic::Ordering::Relaxed)
}

/// First Ctrl-C sets [`INTERRUPTED`] for commands to wind down; a second one exits.
fn install_interrupt_handler() {
    let result = ctrlc::set_handler(|| {
        if INTERRUPTED.swap(true, std::sync::atomic::Ordering::Relaxed) {
            std::process::exit(130);
        }
    });
    if let Err(e) = result {
        debug!("Could not install Ctrl-C handler: {e}");
    }
}

mod commands;
mod config;
mod serial;

use commands::{
    benchmark::cmd_benchmark,
    completions::{cmd_completions, cmd_completions_install},
    ports::cmd_list_ports,
    preview::cmd_preview,
    upload::cmd_upload,
};
use config::Config;

/// ecgsim - host tool for the ECGSim prototype ECG simulator.
///
/// Environment variables:
///   ECGSIM_PORT              - Default serial port
///   ECGSIM_BAUD              - Default baud rate (default: 115200)
///   ECGSIM_NON_INTERACTIVE   - Non-interactive mode (disable prompts)
#[derive(Parser)]
#[command(name = "ecgsim")]
#[command(author, version, about, long_about = None)]
#[command(propagate_version = true)]
#[command(after_help = "Examples:\n  \
    ecgsim upload --heart-rate 72 --pp-voltage 2.0\n  \
    ecgsim --simulate upload --lenient-firmware-info\n  \
    ecgsim benchmark --interval 0.5 --count 20")]
#[allow(clippy::struct_excessive_bools)]
struct Cli {
    /// Serial port to use (auto-detected if not specified).
    #[arg(short, long, global = true, env = "ECGSIM_PORT")]
    port: Option<String>,

    /// Baud rate [default: 115200].
    #[arg(short, long, global = true, env = "ECGSIM_BAUD")]
    baud: Option<u32>,

    /// Default response timeout in milliseconds [default: 2000].
    #[arg(long, global = true, value_name = "MS")]
    timeout_ms: Option<u64>,

    /// Talk to an in-memory simulated device instead of a serial port.
    #[arg(long, global = true)]
    simulate: bool,

    /// Verbose output level (-v, -vv for increasing detail).
    #[arg(short, long, global = true, action = clap::ArgAction::Count)]
    verbose: u8,

    /// Quiet mode (suppress non-essential output).
    #[arg(short, long, global = true)]
    quiet: bool,

    /// Non-interactive mode (fail instead of prompting).
    #[arg(long, global = true, env = "ECGSIM_NON_INTERACTIVE")]
    non_interactive: bool,

    /// Path to a configuration file.
    #[arg(long = "config", global = true, value_name = "PATH")]
    config_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

/// Waveform families the tool can generate.
#[derive(Clone, Copy, Debug, PartialEq, Eq, ValueEnum)]
enum Waveform {
    /// ECGSYN dynamical model (default).
    Ecg,
    /// Sine at the heart rate.
    Sine,
    /// Square pulse train.
    Pulse,
}

/// Waveform selection shared by `upload` and `preview`.
#[derive(Args, Clone, Debug)]
struct WaveformArgs {
    /// Waveform to generate.
    #[arg(short, long, value_enum, default_value_t = Waveform::Ecg)]
    waveform: Waveform,

    /// Heart rate in beats per minute, above 30 [default: 60].
    #[arg(long, value_name = "BPM", value_parser = parse_heart_rate)]
    heart_rate: Option<f64>,

    /// Peak-to-peak DAC output in volts [default: 2.0].
    #[arg(long, value_name = "VOLTS", value_parser = parse_positive, conflicts_with = "target_mv")]
    pp_voltage: Option<f64>,

    /// Peak-to-peak amplitude at the electrodes in millivolts.
    #[arg(long, value_name = "MV", value_parser = parse_positive)]
    target_mv: Option<f64>,

    /// Pulse repetition rate in Hz.
    #[arg(long, value_name = "HZ", default_value_t = 1.0, value_parser = parse_positive)]
    pulse_frequency: f64,

    /// Fraction of each pulse period spent high (0 to 1).
    #[arg(long, default_value_t = 0.1, value_parser = parse_fraction)]
    duty_cycle: f64,

    /// Pulse high level in DAC millivolts.
    #[arg(long, value_name = "MV", default_value_t = 3.0, value_parser = parse_positive)]
    pulse_amplitude_mv: f64,

    /// Pulse train length in seconds.
    #[arg(long, value_name = "SECS", default_value_t = 1.0, value_parser = parse_positive)]
    pulse_duration: f64,
}

#[derive(Subcommand)]
enum Commands {
    /// Synthesize a waveform and upload it to the simulator.
    Upload {
        #[command(flatten)]
        waveform: WaveformArgs,

        /// Accept any reply to the firmware-info request, not just "ok".
        #[arg(long)]
        lenient_firmware_info: bool,

        /// After the upload, poll the average trigger time for SECS seconds.
        #[arg(long, value_name = "SECS", value_parser = parse_positive)]
        resume_benchmark: Option<f64>,
    },

    /// Poll the average trigger time until Ctrl-C.
    Benchmark {
        /// Seconds between queries [default: 1.0].
        #[arg(short, long, value_name = "SECS", value_parser = parse_positive)]
        interval: Option<f64>,

        /// Stop after this many samples.
        #[arg(short = 'n', long, value_name = "N")]
        count: Option<NonZeroUsize>,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate the codes an upload would send, without a device.
    Preview {
        #[command(flatten)]
        waveform: WaveformArgs,

        /// Print every code.
        #[arg(long)]
        codes: bool,

        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// List available serial ports.
    ListPorts {
        /// Output as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate shell completion scripts.
    Completions {
        /// Shell type (bash, zsh, fish, powershell, elvish).
        #[arg(value_enum)]
        shell: Option<Shell>,

        /// Install the completion script for the current shell.
        #[arg(long)]
        install: bool,
    },
}

impl Commands {
    /// Whether stdout carries machine-readable output.
    fn is_json(&self) -> bool {
        matches!(
            self,
            Self::Benchmark { json: true, .. }
                | Self::Preview { json: true, .. }
                | Self::ListPorts { json: true }
        )
    }
}

/// Failures that map to a specific exit code.
#[derive(Debug, thiserror::Error)]
pub(crate) enum CliError {
    /// Bad arguments or an unusable invocation.
    #[error("{0}")]
    Usage(String),
    /// A configuration file that was asked for cannot be used.
    #[error("{0}")]
    Config(String),
    /// No device to talk to.
    #[error("{0}")]
    DeviceNotFound(String),
    /// The user interrupted the operation.
    #[error("{0}")]
    Cancelled(String),
}

impl CliError {
    /// Process exit code for this error.
    pub(crate) fn exit_code(&self) -> i32 {
        match self {
            Self::Usage(_) => 2,
            Self::Config(_) => 3,
            Self::DeviceNotFound(_) => 4,
            Self::Cancelled(_) => 130,
        }
    }
}

/// Exit code for a failed command: 4 for unreachable devices, 2 for bad
/// parameters, 1 for anything else.
pub(crate) fn exit_code_for(err: &anyhow::Error) -> i32 {
    for cause in err.chain() {
        if let Some(cli_err) = cause.downcast_ref::<CliError>() {
            return cli_err.exit_code();
        }
        if let Some(lib_err) = cause.downcast_ref::<ecgsim::Error>() {
            return match lib_err {
                e if e.is_connection_error() => 4,
                ecgsim::Error::InvalidArgument(_) => 2,
                _ => 1,
            };
        }
    }
    1
}

fn parse_number(s: &str) -> Result<f64, String> {
    s.trim()
        .parse::<f64>()
        .ok()
        .filter(|v| v.is_finite())
        .ok_or_else(|| format!("'{s}' is not a number"))
}

fn parse_positive(s: &str) -> Result<f64, String> {
    let value = parse_number(s)?;
    if value > 0.0 {
        Ok(value)
    } else {
        Err(format!("must be greater than zero, got {value}"))
    }
}

fn parse_fraction(s: &str) -> Result<f64, String> {
    let value = parse_number(s)?;
    if (0.0..=1.0).contains(&value) {
        Ok(value)
    } else {
        Err(format!("must be between 0 and 1, got {value}"))
    }
}

fn parse_heart_rate(s: &str) -> Result<f64, String> {
    let bpm = parse_number(s)?;
    if bpm > MIN_HEART_RATE {
        Ok(bpm)
    } else {
        Err(format!("heart rate must be above {MIN_HEART_RATE} bpm, got {bpm}"))
    }
}

fn main() {
    let cli = Cli::parse();

    // --- NO_COLOR and TTY detection ---
    let stderr_is_tty = console::Term::stderr().is_term();
    STDERR_IS_TTY.store(stderr_is_tty, std::sync::atomic::Ordering::Relaxed);

    if env::var("NO_COLOR").is_ok() || !stderr_is_tty {
        console::set_colors_enabled(false);
        console::set_colors_enabled_stderr(false);
    }

    // Setup logging based on verbosity; JSON output keeps stderr quiet.
    let log_level = if cli.quiet || (cli.command.is_json() && cli.verbose == 0) {
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

    debug!(
        "ecgsim v{} (verbose level: {})",
        env!("CARGO_PKG_VERSION"),
        cli.verbose
    );

    install_interrupt_handler();

    if let Err(err) = run(&cli) {
        let code = exit_code_for(&err);
        if code == 130 {
            eprintln!("{} {err:#}", style("Cancelled:").yellow().bold());
        } else {
            eprintln!("{} {err:#}", style("Error:").red().bold());
        }
        std::process::exit(code);
    }
}

fn run(cli: &Cli) -> Result<()> {
    let config = match &cli.config_path {
        Some(path) => Config::load_from_path(path)?,
        None => Config::load(),
    };

    match &cli.command {
        Commands::Upload {
            waveform,
            lenient_firmware_info,
            resume_benchmark,
        } => cmd_upload(
            cli,
            &config,
            waveform,
            *lenient_firmware_info,
            *resume_benchmark,
        ),
        Commands::Benchmark {
            interval,
            count,
            json,
        } => cmd_benchmark(cli, &config, *interval, count.map(NonZeroUsize::get), *json),
        Commands::Preview {
            waveform,
            codes,
            json,
        } => cmd_preview(&config, waveform, *codes, *json),
        Commands::ListPorts { json } => cmd_list_ports(*json),
        Commands::Completions { shell, install } => {
            if *install {
                return cmd_completions_install(*shell);
            }
            let shell = shell.ok_or_else(|| {
                CliError::Usage(
                    "specify a shell type, e.g.: ecgsim completions bash \
                     (or use --install to auto-install)"
                        .to_string(),
                )
            })?;
            cmd_completions(shell);
            Ok(())
        },
    }
}
