use std::time::{SystemTime, UNIX_EPOCH};

use devgate_frame::command;
use devgate_frame::Frame;

use crate::cmd::{parse_hex, BuildArgs, BuildCommand};
use crate::exit::{protocol_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_encoded, OutputFormat};

pub fn run(args: BuildArgs, format: OutputFormat) -> CliResult<i32> {
    let frame = encode(args.command)?;
    print_encoded(&frame, format);
    Ok(SUCCESS)
}

fn encode(cmd: BuildCommand) -> CliResult<Frame> {
    let bytes = match cmd {
        BuildCommand::Register {
            target,
            seq,
            device_type,
        } => command::register_request(target.device, seq, device_type),
        BuildCommand::RegisterAck {
            target,
            seq,
            result,
            time_millis,
        } => command::register_ack(
            target.device,
            seq,
            result,
            time_millis.unwrap_or_else(now_millis),
        ),
        BuildCommand::Realtime { target, seq, data } => {
            command::realtime_report(target.device, seq, &hex_arg(&data)?)
        }
        BuildCommand::RealtimeAck { target, seq } => command::realtime_ack(target.device, seq),
        BuildCommand::Retransmit {
            target,
            first,
            count,
        } => command::retransmission_request(target.device, first, count),
        BuildCommand::TimeCalibration {
            target,
            time_millis,
        } => command::time_calibration(target.device, time_millis.unwrap_or_else(now_millis)),
        BuildCommand::DeleteLog {
            target,
            kind,
            before_millis,
        } => command::delete_log(target.device, kind, before_millis.unwrap_or_else(now_millis)),
        BuildCommand::SwitchState {
            target,
            index,
            state,
        } => command::switch_state(target.device, index, state),
        BuildCommand::Unregister { target, seq } => command::unregister_ack(target.device, seq),
        BuildCommand::BluetoothMac { target, op, mac } => {
            let mac = match mac {
                Some(text) => parse_mac(&text)?,
                None => [0u8; 6],
            };
            command::bluetooth_mac(target.device, op, mac)
        }
        BuildCommand::UploadRange { target, start, end } => {
            command::upload_range(target.device, start, end)
        }
        BuildCommand::Custom { target, data } => {
            command::custom_message(target.device, &hex_arg(&data)?)
        }
    }
    .map_err(|err| protocol_error("build failed", err))?;

    Frame::parse(bytes).ok_or_else(|| CliError::new(INTERNAL, "built frame failed verification"))
}

fn parse_mac(text: &str) -> CliResult<[u8; 6]> {
    let bytes = hex_arg(text)?;
    <[u8; 6]>::try_from(bytes.as_slice())
        .map_err(|_| CliError::usage(format!("MAC must be 6 bytes, got {}", bytes.len())))
}

fn now_millis() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

fn hex_arg(text: &str) -> CliResult<Vec<u8>> {
    parse_hex(&[text.to_string()])
}
