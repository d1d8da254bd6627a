//! Command types and the builders for gateway → device commands.
//!
//! Payload layouts are fixed-offset; every builder validates its arguments,
//! allocates with [`build_frame`], fills the payload and finishes with
//! [`with_checksum`].

use bytes::Bytes;

use crate::codec::{build_frame, with_checksum, DeviceId, Frame, PAYLOAD_OFFSET};
use crate::error::ProtocolError;
use crate::numeric::{
    read_timestamp, read_u16, read_u32, write_timestamp, write_u16, write_u32,
    TIMESTAMP_MILLIS_WIDTH, TIMESTAMP_SECS_WIDTH,
};

type Result<T> = std::result::Result<T, ProtocolError>;

/// Highest switch index addressable by a switch-state command.
pub const MAX_SWITCH_INDEX: u8 = 15;

/// Most packets a single retransmission request may ask for.
pub const MAX_RETRANSMIT_COUNT: u16 = 512;

macro_rules! wire_enum {
    (
        $(#[$meta:meta])*
        $name:ident, $kind:literal {
            $($(#[$vmeta:meta])* $variant:ident = $code:literal => $label:literal,)+
        }
    ) => {
        $(#[$meta])*
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
        #[repr(u8)]
        pub enum $name {
            $($(#[$vmeta])* $variant = $code,)+
        }

        impl $name {
            /// Wire value.
            pub const fn code(self) -> u8 {
                self as u8
            }

            /// Human-readable name.
            pub const fn name(self) -> &'static str {
                match self {
                    $(Self::$variant => $label,)+
                }
            }
        }

        impl TryFrom<u8> for $name {
            type Error = ProtocolError;

            fn try_from(value: u8) -> Result<Self> {
                match value {
                    $($code => Ok(Self::$variant),)+
                    other => Err(ProtocolError::InvalidEnum {
                        kind: $kind,
                        value: other,
                    }),
                }
            }
        }

        impl From<$name> for u8 {
            fn from(value: $name) -> u8 {
                value.code()
            }
        }

        impl std::str::FromStr for $name {
            type Err = ProtocolError;

            /// Accepts the name, or the wire value in decimal or `0x` hex.
            fn from_str(input: &str) -> Result<Self> {
                match input {
                    $($label => return Ok(Self::$variant),)+
                    _ => {}
                }
                let code = match input.strip_prefix("0x").or_else(|| input.strip_prefix("0X")) {
                    Some(hex) => u8::from_str_radix(hex, 16).ok(),
                    None => input.parse::<u8>().ok(),
                };
                match code {
                    Some(code) => Self::try_from(code),
                    None => Err(ProtocolError::UnknownName {
                        kind: $kind,
                        name: input.to_string(),
                    }),
                }
            }
        }
    };
}

wire_enum! {
    /// Command type byte at offset 8.
    CommandType, "command type" {
        /// Device announces itself.
        Register = 0x01 => "register",
        RegisterAck = 0x02 => "register-ack",
        /// Device uploads a realtime report.
        Realtime = 0x03 => "realtime",
        RealtimeAck = 0x04 => "realtime-ack",
        RetransmissionRequest = 0x08 => "retransmission-request",
        TimeCalibration = 0x09 => "time-calibration",
        DeleteLog = 0x0A => "delete-log",
        SwitchState = 0x0B => "switch-state",
        Unregister = 0x0C => "unregister",
        BluetoothMac = 0x0D => "bluetooth-mac",
        UploadRange = 0x10 => "upload-range",
        CustomMessage = 0xFE => "custom-message",
    }
}

wire_enum! {
    /// Device class announced in a register frame.
    DeviceType, "device type" {
        Meter = 0x01 => "meter",
        Switch = 0x02 => "switch",
        Sensor = 0x03 => "sensor",
        Lock = 0x04 => "lock",
    }
}

wire_enum! {
    /// Outcome carried by a register-ack.
    RegisterResult, "register result" {
        Accepted = 0x00 => "accepted",
        Rejected = 0x01 => "rejected",
        UnsupportedDevice = 0x02 => "unsupported-device",
    }
}

wire_enum! {
    /// Log category targeted by delete-log.
    LogKind, "log kind" {
        Alarm = 0x01 => "alarm",
        Operation = 0x02 => "operation",
        Report = 0x03 => "report",
        All = 0xFF => "all",
    }
}

wire_enum! {
    /// Target state for a switch-state command.
    SwitchState, "switch state" {
        Off = 0x00 => "off",
        On = 0x01 => "on",
        Toggle = 0x02 => "toggle",
    }
}

wire_enum! {
    /// Bluetooth MAC command operation.
    MacOperation, "mac operation" {
        Get = 0x00 => "get",
        Set = 0x01 => "set",
    }
}

fn out_of_range(field: &'static str, value: i64, min: i64, max: i64) -> ProtocolError {
    ProtocolError::OutOfRange {
        field,
        value,
        min,
        max,
    }
}

fn build(
    device_id: DeviceId,
    command: CommandType,
    payload_len: usize,
    fill: impl FnOnce(&mut [u8]) -> Result<()>,
) -> Result<Bytes> {
    let mut buf = build_frame(device_id, command.code(), payload_len)?;
    let end = PAYLOAD_OFFSET + payload_len;
    fill(&mut buf[PAYLOAD_OFFSET..end])?;
    Ok(with_checksum(buf).freeze())
}

/// `[u32 seq][u8 result][6B timestamp]`
pub fn register_ack(
    device_id: DeviceId,
    seq: u32,
    result: RegisterResult,
    unix_millis: u64,
) -> Result<Bytes> {
    build(device_id, CommandType::RegisterAck, 11, |p| {
        write_u32(p, 0, seq)?;
        p[4] = result.code();
        write_timestamp(p, 5, TIMESTAMP_MILLIS_WIDTH, unix_millis)
    })
}

/// `[u32 seq]`
pub fn realtime_ack(device_id: DeviceId, seq: u32) -> Result<Bytes> {
    build(device_id, CommandType::RealtimeAck, 4, |p| write_u32(p, 0, seq))
}

/// `[u32 seq]`
pub fn unregister_ack(device_id: DeviceId, seq: u32) -> Result<Bytes> {
    build(device_id, CommandType::Unregister, 4, |p| write_u32(p, 0, seq))
}

/// `[u32 first seq][u16 count]`
pub fn retransmission_request(device_id: DeviceId, first_seq: u32, count: u16) -> Result<Bytes> {
    if count == 0 || count > MAX_RETRANSMIT_COUNT {
        return Err(out_of_range(
            "retransmit count",
            i64::from(count),
            1,
            i64::from(MAX_RETRANSMIT_COUNT),
        ));
    }
    build(device_id, CommandType::RetransmissionRequest, 6, |p| {
        write_u32(p, 0, first_seq)?;
        write_u16(p, 4, count)
    })
}

/// `[6B timestamp]`
pub fn time_calibration(device_id: DeviceId, unix_millis: u64) -> Result<Bytes> {
    build(device_id, CommandType::TimeCalibration, 6, |p| {
        write_timestamp(p, 0, TIMESTAMP_MILLIS_WIDTH, unix_millis)
    })
}

/// `[u8 kind][4B before]`
pub fn delete_log(device_id: DeviceId, kind: LogKind, before_unix_millis: u64) -> Result<Bytes> {
    build(device_id, CommandType::DeleteLog, 5, |p| {
        p[0] = kind.code();
        write_timestamp(p, 1, TIMESTAMP_SECS_WIDTH, before_unix_millis)
    })
}

/// `[u8 index][u8 state]`
pub fn switch_state(device_id: DeviceId, index: u8, state: SwitchState) -> Result<Bytes> {
    if index > MAX_SWITCH_INDEX {
        return Err(out_of_range(
            "switch index",
            i64::from(index),
            0,
            i64::from(MAX_SWITCH_INDEX),
        ));
    }
    build(device_id, CommandType::SwitchState, 2, |p| {
        p[0] = index;
        p[1] = state.code();
        Ok(())
    })
}

/// `[u8 op][6B MAC]`; a get carries an all-zero MAC.
pub fn bluetooth_mac(device_id: DeviceId, op: MacOperation, mac: [u8; 6]) -> Result<Bytes> {
    let mac = match op {
        MacOperation::Get => [0u8; 6],
        MacOperation::Set => mac,
    };
    build(device_id, CommandType::BluetoothMac, 7, |p| {
        p[0] = op.code();
        p[1..7].copy_from_slice(&mac);
        Ok(())
    })
}

/// `[4B start secs][4B end secs]`
pub fn upload_range(device_id: DeviceId, start_secs: u32, end_secs: u32) -> Result<Bytes> {
    if start_secs > end_secs {
        return Err(out_of_range(
            "upload range start",
            i64::from(start_secs),
            0,
            i64::from(end_secs),
        ));
    }
    build(device_id, CommandType::UploadRange, 8, |p| {
        write_u32(p, 0, start_secs)?;
        write_u32(p, 4, end_secs)
    })
}

/// Opaque body, bounded by the 16-bit length field.
pub fn custom_message(device_id: DeviceId, body: &[u8]) -> Result<Bytes> {
    build(device_id, CommandType::CustomMessage, body.len(), |p| {
        p.copy_from_slice(body);
        Ok(())
    })
}

/// Device-side register frame: `[u32 seq][u8 device type]`.
pub fn register_request(device_id: DeviceId, seq: u32, device_type: DeviceType) -> Result<Bytes> {
    build(device_id, CommandType::Register, 5, |p| {
        write_u32(p, 0, seq)?;
        p[4] = device_type.code();
        Ok(())
    })
}

/// Device-side realtime report: `[u32 seq][data]`.
pub fn realtime_report(device_id: DeviceId, seq: u32, data: &[u8]) -> Result<Bytes> {
    let len = data.len().checked_add(4).ok_or(ProtocolError::PayloadTooLarge {
        size: data.len(),
        max: crate::codec::MAX_PAYLOAD,
    })?;
    build(device_id, CommandType::Realtime, len, |p| {
        write_u32(p, 0, seq)?;
        p[4..].copy_from_slice(data);
        Ok(())
    })
}

/// Device-side unregister; same layout as the acknowledgement.
pub fn unregister_request(device_id: DeviceId, seq: u32) -> Result<Bytes> {
    unregister_ack(device_id, seq)
}

/// Fields of an inbound register frame.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RegisterRequest {
    pub seq: u32,
    /// Raw device type byte; may not map to a known [`DeviceType`].
    pub device_type: u8,
}

impl RegisterRequest {
    pub fn parse(frame: &Frame) -> Option<Self> {
        if frame.command() != Some(CommandType::Register) {
            return None;
        }
        let payload = frame.payload();
        Some(Self {
            seq: read_u32(payload, 0)?,
            device_type: *payload.get(4)?,
        })
    }

    pub fn known_device_type(&self) -> Option<DeviceType> {
        DeviceType::try_from(self.device_type).ok()
    }
}

/// Decode the payload of a known command into labelled fields.
///
/// Unknown types, and payloads too short for their layout, fall back to a
/// hex dump of the payload.
pub fn describe_payload(frame: &Frame) -> Vec<(&'static str, String)> {
    let p = frame.payload();
    let described = frame.command().and_then(|command| describe(command, p));
    described.unwrap_or_else(|| vec![("payload", hex(p))])
}

fn describe(command: CommandType, p: &[u8]) -> Option<Vec<(&'static str, String)>> {
    let enum_name = |byte: u8, name: Option<&'static str>| match name {
        Some(name) => name.to_string(),
        None => format!("0x{byte:02X}"),
    };
    let fields = match command {
        CommandType::Register => {
            let ty = *p.get(4)?;
            vec![
                ("seq", read_u32(p, 0)?.to_string()),
                (
                    "device_type",
                    enum_name(ty, DeviceType::try_from(ty).ok().map(DeviceType::name)),
                ),
            ]
        }
        CommandType::RegisterAck => {
            let result = *p.get(4)?;
            vec![
                ("seq", read_u32(p, 0)?.to_string()),
                (
                    "result",
                    enum_name(
                        result,
                        RegisterResult::try_from(result)
                            .ok()
                            .map(RegisterResult::name),
                    ),
                ),
                (
                    "timestamp_ms",
                    read_timestamp(p, 5, TIMESTAMP_MILLIS_WIDTH)?.to_string(),
                ),
            ]
        }
        CommandType::Realtime => vec![
            ("seq", read_u32(p, 0)?.to_string()),
            ("data", hex(&p[4..])),
        ],
        CommandType::RealtimeAck | CommandType::Unregister => {
            vec![("seq", read_u32(p, 0)?.to_string())]
        }
        CommandType::RetransmissionRequest => vec![
            ("first_seq", read_u32(p, 0)?.to_string()),
            ("count", read_u16(p, 4)?.to_string()),
        ],
        CommandType::TimeCalibration => vec![(
            "timestamp_ms",
            read_timestamp(p, 0, TIMESTAMP_MILLIS_WIDTH)?.to_string(),
        )],
        CommandType::DeleteLog => {
            let kind = *p.first()?;
            vec![
                (
                    "kind",
                    enum_name(kind, LogKind::try_from(kind).ok().map(LogKind::name)),
                ),
                (
                    "before_ms",
                    read_timestamp(p, 1, TIMESTAMP_SECS_WIDTH)?.to_string(),
                ),
            ]
        }
        CommandType::SwitchState => {
            let state = *p.get(1)?;
            vec![
                ("index", p.first()?.to_string()),
                (
                    "state",
                    enum_name(state, SwitchState::try_from(state).ok().map(SwitchState::name)),
                ),
            ]
        }
        CommandType::BluetoothMac => {
            let op = *p.first()?;
            let mac = p.get(1..7)?;
            vec![
                (
                    "op",
                    enum_name(op, MacOperation::try_from(op).ok().map(MacOperation::name)),
                ),
                (
                    "mac",
                    mac.iter()
                        .map(|b| format!("{b:02X}"))
                        .collect::<Vec<_>>()
                        .join(":"),
                ),
            ]
        }
        CommandType::UploadRange => vec![
            ("start_secs", read_u32(p, 0)?.to_string()),
            ("end_secs", read_u32(p, 4)?.to_string()),
        ],
        CommandType::CustomMessage => vec![("body", hex(p))],
    };
    Some(fields)
}

fn hex(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02X}")).collect()
}
