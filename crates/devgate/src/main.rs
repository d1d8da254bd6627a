mod cmd;
mod config;
mod exit;
mod logging;
mod output;

use clap::Parser;

use crate::cmd::Command;
use crate::logging::{init_logging, LogFormat, LogLevel};
use crate::output::OutputFormat;

#[derive(Parser, Debug)]
#[command(name = "devgate", version, about = "Device protocol gateway CLI")]
struct Cli {
    /// Output format.
    #[arg(long, value_name = "FORMAT", global = true)]
    format: Option<OutputFormat>,

    /// Log output format (stderr).
    #[arg(long, value_name = "FORMAT", default_value = "text", global = true)]
    log_format: LogFormat,

    /// Minimum log level (stderr).
    #[arg(long, value_name = "LEVEL", default_value = "info", global = true)]
    log_level: LogLevel,

    #[command(subcommand)]
    command: Command,
}

fn main() {
    let cli = Cli::parse();
    init_logging(cli.log_format, cli.log_level);

    let format = cli.format.unwrap_or_else(OutputFormat::default_for_stdout);
    let result = cmd::run(cli.command, format);

    match result {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("error: {err}");
            std::process::exit(err.code);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cmd::BuildCommand;

    #[test]
    fn parses_build_subcommand() {
        let cli = Cli::try_parse_from([
            "devgate",
            "build",
            "switch-state",
            "--device",
            "AABBCCDD",
            "--index",
            "2",
            "--state",
            "toggle",
        ])
        .expect("build args should parse");

        match cli.command {
            Command::Build(args) => assert!(matches!(
                args.command,
                BuildCommand::SwitchState { index: 2, .. }
            )),
            other => panic!("unexpected command {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_device_id() {
        let err = Cli::try_parse_from([
            "devgate",
            "build",
            "realtime-ack",
            "--device",
            "XYZ",
        ])
        .expect_err("bad device id should fail");

        assert_eq!(err.kind(), clap::error::ErrorKind::ValueValidation);
    }

    #[test]
    fn parses_serve_overrides() {
        let cli = Cli::try_parse_from([
            "devgate",
            "serve",
            "--udp",
            "127.0.0.1:0",
            "--tcp",
            "127.0.0.1:0",
            "--expiry",
            "90s",
        ])
        .expect("serve args should parse");
        assert!(matches!(cli.command, Command::Serve(ref args) if args.tcp.is_some()));
    }
}
