use std::net::{SocketAddr, UdpSocket};
use std::time::Duration;

use devgate_frame::{verify, Frame, MAX_FRAME_LEN};

use crate::cmd::{parse_hex, SendArgs};
use crate::config::parse_duration;
use crate::exit::{io_error, CliError, CliResult, DATA_INVALID, SUCCESS};
use crate::output::{print_frame, to_hex, OutputFormat};

pub fn run(args: SendArgs, format: OutputFormat) -> CliResult<i32> {
    let wait_timeout = parse_duration(&args.wait_timeout)?;
    let payload = parse_hex(&args.hex)?;
    if !args.force && !verify(&payload) {
        return Err(CliError::new(
            DATA_INVALID,
            "payload is not a valid frame (use --force to send anyway)",
        ));
    }

    let socket = UdpSocket::bind(args.bind).map_err(|err| io_error("bind failed", err))?;
    socket
        .send_to(&payload, args.addr)
        .map_err(|err| io_error("send failed", err))?;
    tracing::debug!(peer = %args.addr, len = payload.len(), "frame sent");

    if args.wait {
        let (reply, from) = wait_for_reply(&socket, args.addr, wait_timeout)?;
        let frame = Frame::parse(reply.clone()).ok_or_else(|| {
            CliError::new(
                DATA_INVALID,
                format!("reply from {from} is not a valid frame: {}", to_hex(&reply)),
            )
        })?;
        print_frame(&frame, Some(from), format);
    }

    Ok(SUCCESS)
}

/// First datagram from `addr` within `timeout`; others are ignored.
fn wait_for_reply(
    socket: &UdpSocket,
    addr: SocketAddr,
    timeout: Duration,
) -> CliResult<(Vec<u8>, SocketAddr)> {
    socket
        .set_read_timeout(Some(timeout))
        .map_err(|err| io_error("set timeout failed", err))?;
    let mut buf = vec![0u8; MAX_FRAME_LEN];
    loop {
        let (n, from) = socket
            .recv_from(&mut buf)
            .map_err(|err| io_error("no reply", err))?;
        if from == addr {
            return Ok((buf[..n].to_vec(), from));
        }
        tracing::debug!(peer = %from, len = n, "ignoring datagram from unexpected peer");
    }
}
