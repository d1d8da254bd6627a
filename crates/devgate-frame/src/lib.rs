//! Checksummed device frame codec and stream decoding.
//!
//! Every frame on the wire is laid out as:
//! - 2-byte magic `55 AA`
//! - big-endian 16-bit length of everything after the magic
//! - 4-byte device id and 1-byte command type
//! - payload, then a 1-byte additive checksum of all preceding bytes
//!
//! Decoding never fails loudly: malformed input yields `false` or `None`.
//! Building frames validates arguments and returns [`ProtocolError`].

pub mod codec;
pub mod command;
pub mod decoder;
pub mod error;
pub mod numeric;
pub mod reader;

pub use codec::{
    build_frame, checksum, verify, with_checksum, DeviceId, Frame, ParseDeviceIdError,
    FRAME_OVERHEAD, MAGIC, MAX_FRAME_LEN, MAX_PAYLOAD, MIN_FRAME_LEN,
};
pub use command::{
    CommandType, DeviceType, LogKind, MacOperation, RegisterRequest, RegisterResult, SwitchState,
};
pub use decoder::{DecoderConfig, DecoderState, FrameContext, StreamDecoder};
pub use error::{FrameError, ProtocolError, Result};
pub use reader::FrameReader;
