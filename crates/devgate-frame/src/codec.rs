use std::fmt;
use std::str::FromStr;

use bytes::{BufMut, Bytes, BytesMut};

use crate::command::CommandType;
use crate::error::ProtocolError;
use crate::numeric::read_u32;

/// Magic bytes opening every frame.
pub const MAGIC: [u8; 2] = [0x55, 0xAA];

/// Offset of the big-endian 16-bit length field.
pub const LENGTH_OFFSET: usize = 2;

/// Offset of the 4-byte device identifier.
pub const DEVICE_ID_OFFSET: usize = 4;

/// Offset of the command type byte.
pub const COMMAND_OFFSET: usize = 8;

/// Offset of the first payload byte.
pub const PAYLOAD_OFFSET: usize = 9;

/// Fixed overhead: magic + length + device id + type + checksum.
pub const FRAME_OVERHEAD: usize = PAYLOAD_OFFSET + 1;

/// Smallest frame that carries a device id and command type.
pub const MIN_FRAME_LEN: usize = FRAME_OVERHEAD;

/// Bytes a stream decoder must see before it can compute a frame length.
pub const LENGTH_PROBE_LEN: usize = LENGTH_OFFSET + 2;

/// Largest payload whose frame still fits the 16-bit length field.
pub const MAX_PAYLOAD: usize = u16::MAX as usize + MAGIC.len() - FRAME_OVERHEAD;

/// Largest complete frame on the wire.
pub const MAX_FRAME_LEN: usize = u16::MAX as usize + MAGIC.len();

/// Four-byte device identifier carried in every frame.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct DeviceId(pub [u8; 4]);

impl DeviceId {
    pub const fn new(bytes: [u8; 4]) -> Self {
        Self(bytes)
    }

    pub const fn as_bytes(&self) -> &[u8; 4] {
        &self.0
    }

    /// The identifier as a big-endian integer.
    pub const fn as_u32(&self) -> u32 {
        u32::from_be_bytes(self.0)
    }
}

impl From<u32> for DeviceId {
    fn from(value: u32) -> Self {
        Self(value.to_be_bytes())
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for byte in self.0 {
            write!(f, "{byte:02X}")?;
        }
        Ok(())
    }
}

impl fmt::Debug for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "DeviceId({self})")
    }
}

/// Error returned when parsing a device id from hex text.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("device id must be 8 hex digits, got {0:?}")]
pub struct ParseDeviceIdError(pub String);

impl FromStr for DeviceId {
    type Err = ParseDeviceIdError;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        let trimmed = s.trim();
        let digits = trimmed
            .strip_prefix("0x")
            .or_else(|| trimmed.strip_prefix("0X"))
            .unwrap_or(trimmed);
        if digits.len() != 8 {
            return Err(ParseDeviceIdError(s.to_string()));
        }
        u32::from_str_radix(digits, 16)
            .map(DeviceId::from)
            .map_err(|_| ParseDeviceIdError(s.to_string()))
    }
}

/// Returns true if the magic bytes are present at `offset`.
///
/// Out-of-range offsets simply do not match.
pub fn is_header(buf: &[u8], offset: usize) -> bool {
    match offset.checked_add(MAGIC.len()) {
        Some(end) => buf.get(offset..end) == Some(&MAGIC[..]),
        None => false,
    }
}

/// Declared length (bytes after the magic), if the field is present.
pub fn length(buf: &[u8]) -> Option<usize> {
    let field = buf.get(LENGTH_OFFSET..LENGTH_OFFSET + 2)?;
    Some(u16::from_be_bytes([field[0], field[1]]) as usize)
}

/// Returns true if the declared length equals `buf.len() - 2`.
pub fn is_length_consistent(buf: &[u8]) -> bool {
    length(buf).is_some_and(|declared| declared + MAGIC.len() == buf.len())
}

/// Sum of every byte except the last, truncated to 8 bits.
pub fn checksum(buf: &[u8]) -> u8 {
    let body = match buf.split_last() {
        Some((_, body)) => body,
        None => return 0,
    };
    body.iter().fold(0u8, |acc, byte| acc.wrapping_add(*byte))
}

/// Compares the trailing byte against the computed checksum.
pub fn verify_checksum(buf: &[u8]) -> bool {
    buf.last().is_some_and(|last| *last == checksum(buf))
}

/// Header, length and checksum, checked in that order.
///
/// Each check only reads bytes the previous one proved present, so
/// truncated buffers are safe to pass.
pub fn verify(buf: &[u8]) -> bool {
    is_header(buf, 0) && is_length_consistent(buf) && verify_checksum(buf)
}

/// Device id at its fixed offset.
pub fn device_id(buf: &[u8]) -> Option<DeviceId> {
    let field = buf.get(DEVICE_ID_OFFSET..DEVICE_ID_OFFSET + 4)?;
    Some(DeviceId([field[0], field[1], field[2], field[3]]))
}

/// Command type byte at its fixed offset.
pub fn command_type(buf: &[u8]) -> Option<u8> {
    buf.get(COMMAND_OFFSET).copied()
}

/// Payload bytes between the command type and the checksum.
pub fn payload(buf: &[u8]) -> Option<&[u8]> {
    if buf.len() < MIN_FRAME_LEN {
        return None;
    }
    buf.get(PAYLOAD_OFFSET..buf.len() - 1)
}

/// Allocate a frame with header, length, device id and type filled in.
///
/// Payload bytes and the checksum are left zeroed for the caller; finish
/// with [`with_checksum`].
pub fn build_frame(
    device_id: DeviceId,
    command: u8,
    payload_len: usize,
) -> std::result::Result<BytesMut, ProtocolError> {
    if payload_len > MAX_PAYLOAD {
        return Err(ProtocolError::PayloadTooLarge {
            size: payload_len,
            max: MAX_PAYLOAD,
        });
    }
    let total = FRAME_OVERHEAD + payload_len;
    let mut buf = BytesMut::with_capacity(total);
    buf.put_slice(&MAGIC);
    buf.put_u16((total - MAGIC.len()) as u16);
    buf.put_slice(device_id.as_bytes());
    buf.put_u8(command);
    buf.put_bytes(0, payload_len + 1);
    Ok(buf)
}

/// Write the trailing checksum in place.
pub fn set_checksum(buf: &mut [u8]) {
    let sum = checksum(buf);
    if let Some(last) = buf.last_mut() {
        *last = sum;
    }
}

/// Set the trailing checksum and hand the buffer back.
pub fn with_checksum(mut buf: BytesMut) -> BytesMut {
    set_checksum(&mut buf);
    buf
}

/// A verified frame.
///
/// Construction goes through [`Frame::parse`], so every accessor can index
/// fixed offsets without further checks.
#[derive(Clone, PartialEq, Eq)]
pub struct Frame {
    bytes: Bytes,
}

impl Frame {
    /// Verify `bytes` and wrap them; `None` for anything malformed.
    pub fn parse(bytes: impl Into<Bytes>) -> Option<Self> {
        let bytes = bytes.into();
        if bytes.len() < MIN_FRAME_LEN || !verify(&bytes) {
            return None;
        }
        Some(Self { bytes })
    }

    pub fn device_id(&self) -> DeviceId {
        let b = &self.bytes[DEVICE_ID_OFFSET..DEVICE_ID_OFFSET + 4];
        DeviceId([b[0], b[1], b[2], b[3]])
    }

    pub fn command_type(&self) -> u8 {
        self.bytes[COMMAND_OFFSET]
    }

    /// Known command type, if the byte maps to one.
    pub fn command(&self) -> Option<CommandType> {
        CommandType::try_from(self.command_type()).ok()
    }

    pub fn payload(&self) -> &[u8] {
        &self.bytes[PAYLOAD_OFFSET..self.bytes.len() - 1]
    }

    /// Leading big-endian packet sequence number, for commands that carry one.
    pub fn sequence(&self) -> Option<u32> {
        read_u32(self.payload(), 0)
    }

    pub fn checksum(&self) -> u8 {
        self.bytes[self.bytes.len() - 1]
    }

    /// The total wire size of this frame.
    pub fn wire_size(&self) -> usize {
        self.bytes.len()
    }

    pub fn as_bytes(&self) -> &Bytes {
        &self.bytes
    }

    pub fn into_bytes(self) -> Bytes {
        self.bytes
    }
}

impl fmt::Debug for Frame {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Frame")
            .field("device_id", &self.device_id())
            .field("command_type", &format_args!("0x{:02X}", self.command_type()))
            .field("payload_len", &self.payload().len())
            .finish()
    }
}

impl AsRef<[u8]> for Frame {
    fn as_ref(&self) -> &[u8] {
        &self.bytes
    }
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;

    use super::*;

    const TEST_ID: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD]);

    fn register_ack_scenario() -> Vec<u8> {
        // 13 bytes after the magic: length(2) + id(4) + type(1) + payload(5) + checksum(1).
        let mut frame = vec![
            0x55, 0xAA, 0x00, 0x0D, 0xAA, 0xBB, 0xCC, 0xDD, 0x02, 0x00, 0x00, 0x00, 0x05, 0x00,
            0x00,
        ];
        set_checksum(&mut frame);
        frame
    }

    #[test]
    fn concrete_register_ack_frame_verifies() {
        let frame = register_ack_scenario();
        assert_eq!(frame.len(), 15);
        assert!(verify(&frame));
        assert_eq!(device_id(&frame), Some(DeviceId([0xAA, 0xBB, 0xCC, 0xDD])));
        assert_eq!(command_type(&frame), Some(0x02));
    }

    #[test]
    fn declared_length_must_match_byte_length() {
        let mut frame = register_ack_scenario();
        frame.pop();
        set_checksum(&mut frame);
        assert!(is_header(&frame, 0));
        assert!(!is_length_consistent(&frame));
        assert!(!verify(&frame));
    }

    #[test]
    fn verify_reports_false_on_truncated_buffers() {
        assert!(!verify(&[]));
        assert!(!verify(&[0x55]));
        assert!(!verify(&[0x55, 0xAA]));
        assert!(!verify(&[0x55, 0xAA, 0x00]));
        assert!(!verify(&[0x00, 0xAA, 0x00, 0x02]));
        assert_eq!(device_id(&[0x55, 0xAA, 0x00]), None);
        assert_eq!(command_type(&[0x55; 8]), None);
        assert_eq!(payload(&[0x55; 9]), None);
    }

    #[test]
    fn header_check_handles_offsets() {
        let buf = [0x00, 0x55, 0xAA];
        assert!(!is_header(&buf, 0));
        assert!(is_header(&buf, 1));
        assert!(!is_header(&buf, 2));
        assert!(!is_header(&buf, usize::MAX));
    }

    #[test]
    fn checksum_is_stable() {
        let frame = register_ack_scenario();
        assert_eq!(checksum(&frame), checksum(&frame));
        assert_eq!(checksum(&[]), 0);
        assert_eq!(checksum(&[0xFF]), 0);
        assert_eq!(checksum(&[0xFF, 0x02, 0x00]), 0x01);
    }

    #[test]
    fn build_frame_fills_fixed_fields() {
        let buf = build_frame(DeviceId::from(0x0102_0304), 0x09, 6).unwrap();
        assert_eq!(buf.len(), FRAME_OVERHEAD + 6);
        assert!(is_header(&buf, 0));
        assert!(is_length_consistent(&buf));
        assert_eq!(device_id(&buf), Some(DeviceId([1, 2, 3, 4])));
        assert_eq!(command_type(&buf), Some(0x09));

        let buf = with_checksum(buf);
        assert!(verify(&buf));
    }

    #[test]
    fn build_frame_rejects_oversized_payload() {
        assert!(build_frame(TEST_ID, 0xFE, MAX_PAYLOAD).is_ok());
        let err = build_frame(TEST_ID, 0xFE, MAX_PAYLOAD + 1).unwrap_err();
        assert!(matches!(err, ProtocolError::PayloadTooLarge { .. }));
    }

    #[test]
    fn frame_parse_exposes_fields() {
        let frame = Frame::parse(register_ack_scenario()).unwrap();
        assert_eq!(frame.device_id().to_string(), "AABBCCDD");
        assert_eq!(frame.command(), Some(CommandType::RegisterAck));
        assert_eq!(frame.payload(), &[0x00, 0x00, 0x00, 0x05, 0x00]);
        assert_eq!(frame.sequence(), Some(5));
        assert_eq!(frame.wire_size(), 15);
    }

    #[test]
    fn frame_parse_rejects_short_but_consistent_buffers() {
        let mut tiny = vec![0x55, 0xAA, 0x00, 0x03, 0x00];
        set_checksum(&mut tiny);
        assert!(verify(&tiny));
        assert!(Frame::parse(tiny).is_none());
    }

    #[test]
    fn device_id_parses_hex() {
        assert_eq!("AABBCCDD".parse::<DeviceId>().unwrap().as_u32(), 0xAABB_CCDD);
        assert_eq!("0x00000001".parse::<DeviceId>().unwrap(), DeviceId::from(1));
        assert!("ABC".parse::<DeviceId>().is_err());
        assert!("GGGGGGGG".parse::<DeviceId>().is_err());
    }

    fn framed_body() -> impl Strategy<Value = Vec<u8>> {
        proptest::collection::vec(any::<u8>(), 0..64).prop_map(|body| {
            let total = FRAME_OVERHEAD + body.len();
            let mut buf = Vec::with_capacity(total);
            buf.extend_from_slice(&MAGIC);
            buf.extend_from_slice(&((total - 2) as u16).to_be_bytes());
            buf.extend_from_slice(&[0x11, 0x22, 0x33, 0x44, 0x03]);
            buf.extend_from_slice(&body);
            buf.push(0);
            buf
        })
    }

    proptest! {
        #[test]
        fn with_checksum_always_verifies(buf in framed_body()) {
            let buf = with_checksum(BytesMut::from(&buf[..]));
            prop_assert!(verify(&buf));
        }

        #[test]
        fn any_single_byte_mutation_fails_verification(
            buf in framed_body(),
            index in any::<prop::sample::Index>(),
            delta in 1u8..=255,
        ) {
            let mut buf = with_checksum(BytesMut::from(&buf[..])).to_vec();
            let target = index.index(buf.len() - 1);
            buf[target] = buf[target].wrapping_add(delta);
            prop_assert!(!verify(&buf));
        }
    }
}
