use clap::{Args, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;

use devgate_frame::{DeviceId, DeviceType, LogKind, MacOperation, RegisterResult, SwitchState};

use crate::exit::{CliError, CliResult};
use crate::output::OutputFormat;

pub mod build;
pub mod decode;
pub mod send;
pub mod serve;
pub mod version;

#[derive(Subcommand, Debug)]
pub enum Command {
    /// Run the gateway until interrupted.
    Serve(ServeArgs),
    /// Verify a hex-encoded frame and print its fields.
    Decode(DecodeArgs),
    /// Build a command frame and print it.
    Build(BuildArgs),
    /// Send a raw frame over UDP.
    Send(SendArgs),
    /// Show version information.
    Version(VersionArgs),
}

pub fn run(command: Command, format: OutputFormat) -> CliResult<i32> {
    match command {
        Command::Serve(args) => serve::run(args, format),
        Command::Decode(args) => decode::run(args, format),
        Command::Build(args) => build::run(args, format),
        Command::Send(args) => send::run(args, format),
        Command::Version(args) => version::run(args),
    }
}

#[derive(Args, Debug, Default)]
pub struct ServeArgs {
    /// JSON configuration file.
    #[arg(long, value_name = "FILE")]
    pub config: Option<PathBuf>,
    /// UDP bind address (overrides config).
    #[arg(long, value_name = "ADDR")]
    pub udp: Option<SocketAddr>,
    /// Also serve TCP on this address.
    #[arg(long, value_name = "ADDR")]
    pub tcp: Option<SocketAddr>,
    /// I/O worker threads.
    #[arg(long)]
    pub workers: Option<usize>,
    /// Session expiry window (e.g. 180s, 3m).
    #[arg(long, value_name = "DURATION")]
    pub expiry: Option<String>,
    /// Interval between expiry sweeps.
    #[arg(long, value_name = "DURATION")]
    pub sweep_interval: Option<String>,
    /// Idle time after which a UDP channel is closed.
    #[arg(long, value_name = "DURATION")]
    pub idle_timeout: Option<String>,
    /// Exit after this long instead of waiting for Ctrl-C.
    #[arg(long, value_name = "DURATION")]
    pub run_for: Option<String>,
}

#[derive(Args, Debug)]
pub struct DecodeArgs {
    /// Frame bytes as hex; spaces and a leading 0x are ignored.
    #[arg(required = true, num_args = 1..)]
    pub hex: Vec<String>,
}

#[derive(Args, Debug)]
pub struct BuildArgs {
    #[command(subcommand)]
    pub command: BuildCommand,
}

#[derive(Args, Debug, Clone, Copy)]
pub struct Target {
    /// Device id as 8 hex digits.
    #[arg(long, short = 'd', value_name = "HEX")]
    pub device: DeviceId,
}

#[derive(Subcommand, Debug)]
pub enum BuildCommand {
    /// Device register request (0x01).
    Register {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        seq: u32,
        #[arg(long, default_value = "meter")]
        device_type: DeviceType,
    },
    /// Register acknowledgement (0x02).
    RegisterAck {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        seq: u32,
        #[arg(long, default_value = "accepted")]
        result: RegisterResult,
        /// Timestamp in Unix milliseconds; defaults to now.
        #[arg(long)]
        time_millis: Option<u64>,
    },
    /// Device realtime report (0x03).
    Realtime {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        seq: u32,
        /// Report body as hex.
        #[arg(long, default_value = "")]
        data: String,
    },
    /// Realtime acknowledgement (0x04).
    RealtimeAck {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        seq: u32,
    },
    /// Retransmission request (0x08).
    Retransmit {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        first: u32,
        #[arg(long)]
        count: u16,
    },
    /// Time calibration (0x09).
    TimeCalibration {
        #[command(flatten)]
        target: Target,
        /// Unix milliseconds; defaults to now.
        #[arg(long)]
        time_millis: Option<u64>,
    },
    /// Delete logs older than a timestamp (0x0A).
    DeleteLog {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "all")]
        kind: LogKind,
        /// Unix milliseconds; defaults to now.
        #[arg(long)]
        before_millis: Option<u64>,
    },
    /// Set a switch (0x0B).
    SwitchState {
        #[command(flatten)]
        target: Target,
        #[arg(long)]
        index: u8,
        #[arg(long)]
        state: SwitchState,
    },
    /// Unregister request or acknowledgement (0x0C).
    Unregister {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value_t = 0)]
        seq: u32,
    },
    /// Get or set the Bluetooth MAC (0x0D).
    BluetoothMac {
        #[command(flatten)]
        target: Target,
        #[arg(long, default_value = "get")]
        op: MacOperation,
        /// MAC as 12 hex digits, colons allowed.
        #[arg(long)]
        mac: Option<String>,
    },
    /// Request an upload of stored records (0x10).
    UploadRange {
        #[command(flatten)]
        target: Target,
        /// Start, Unix seconds.
        #[arg(long)]
        start: u32,
        /// End, Unix seconds.
        #[arg(long)]
        end: u32,
    },
    /// Custom message (0xFE).
    Custom {
        #[command(flatten)]
        target: Target,
        /// Body as hex.
        #[arg(long, default_value = "")]
        data: String,
    },
}

#[derive(Args, Debug)]
pub struct SendArgs {
    /// Gateway or device address.
    pub addr: SocketAddr,
    /// Frame bytes as hex.
    #[arg(required = true, num_args = 1..)]
    pub hex: Vec<String>,
    /// Local bind address.
    #[arg(long, default_value = "0.0.0.0:0")]
    pub bind: SocketAddr,
    /// Send even if the bytes do not verify as a frame.
    #[arg(long)]
    pub force: bool,
    /// Wait for one reply datagram and print it.
    #[arg(long)]
    pub wait: bool,
    /// Maximum time to wait for a reply when --wait is set (e.g. 5s, 500ms).
    #[arg(long, default_value = "5s")]
    pub wait_timeout: String,
}

#[derive(Args, Debug)]
pub struct VersionArgs {
    /// Show extended build provenance.
    #[arg(long)]
    pub extended: bool,
}

/// Decode hex text, ignoring whitespace, colons and an optional `0x`.
pub fn parse_hex(parts: &[String]) -> CliResult<Vec<u8>> {
    let joined: String = parts.concat();
    let cleaned: String = joined
        .trim()
        .trim_start_matches("0x")
        .chars()
        .filter(|c| !c.is_whitespace() && *c != ':')
        .collect();
    if !cleaned.is_ascii() {
        return Err(CliError::usage("hex input must be ASCII"));
    }
    if cleaned.len() % 2 != 0 {
        return Err(CliError::usage(format!(
            "hex input has an odd number of digits ({})",
            cleaned.len()
        )));
    }
    (0..cleaned.len())
        .step_by(2)
        .map(|i| {
            u8::from_str_radix(&cleaned[i..i + 2], 16)
                .map_err(|_| CliError::usage(format!("invalid hex digits {:?}", &cleaned[i..i + 2])))
        })
        .collect()
}
