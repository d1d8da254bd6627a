use devgate_frame::codec::{checksum, is_header, is_length_consistent, length};
use devgate_frame::{Frame, MIN_FRAME_LEN};

use crate::cmd::{parse_hex, DecodeArgs};
use crate::exit::{CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_frame, OutputFormat};

pub fn run(args: DecodeArgs, format: OutputFormat) -> CliResult<i32> {
    let bytes = parse_hex(&args.hex)?;
    let frame = decode(bytes)?;
    print_frame(&frame, None, format);
    Ok(SUCCESS)
}

/// Verify `bytes`, naming the first check that fails.
fn decode(bytes: Vec<u8>) -> CliResult<Frame> {
    if bytes.len() < MIN_FRAME_LEN {
        return Err(invalid(format!(
            "frame too short ({} bytes, minimum {MIN_FRAME_LEN})",
            bytes.len()
        )));
    }
    if !is_header(&bytes, 0) {
        return Err(invalid(format!(
            "bad header {:02X}{:02X}, expected 55AA",
            bytes[0], bytes[1]
        )));
    }
    if !is_length_consistent(&bytes) {
        return Err(invalid(format!(
            "length field says {} but {} bytes follow the header",
            length(&bytes).unwrap_or_default(),
            bytes.len() - 2
        )));
    }
    let expected = checksum(&bytes);
    let actual = bytes[bytes.len() - 1];
    Frame::parse(bytes).ok_or_else(|| {
        invalid(format!(
            "checksum mismatch: frame carries {actual:02X}, computed {expected:02X}"
        ))
    })
}

fn invalid(message: String) -> CliError {
    CliError::new(DATA_INVALID, message)
}

#[cfg(test)]
mod tests {
    use devgate_frame::command::realtime_ack;
    use devgate_frame::{CommandType, DeviceId};

    use super::*;

    #[test]
    fn decodes_valid_frame() {
        let bytes = realtime_ack(DeviceId([1, 2, 3, 4]), 7).unwrap().to_vec();
        let frame = decode(bytes).unwrap();
        assert_eq!(frame.command(), Some(CommandType::RealtimeAck));
        assert_eq!(frame.sequence(), Some(7));
    }

    #[test]
    fn reports_the_failing_check() {
        let good = realtime_ack(DeviceId([1, 2, 3, 4]), 7).unwrap().to_vec();

        let mut bad_header = good.clone();
        bad_header[1] = 0xAB;
        assert!(decode(bad_header).unwrap_err().message.contains("header"));

        let mut bad_length = good.clone();
        bad_length[3] += 1;
        assert!(decode(bad_length).unwrap_err().message.contains("length"));

        let mut bad_sum = good.clone();
        let last = bad_sum.len() - 1;
        bad_sum[last] ^= 0xFF;
        let err = decode(bad_sum).unwrap_err();
        assert_eq!(err.code, DATA_INVALID);
        assert!(err.message.contains("checksum"));

        assert!(decode(good[..5].to_vec()).unwrap_err().message.contains("short"));
    }
}
