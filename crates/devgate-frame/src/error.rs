/// Errors raised on the encode path.
///
/// These are programmer errors (bad enumeration values, impossible sizes),
/// never network noise: the decode path reports malformed input with
/// booleans and `Option` instead.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ProtocolError {
    /// A raw byte does not map to a known enumeration value.
    #[error("invalid {kind} value 0x{value:02X}")]
    InvalidEnum { kind: &'static str, value: u8 },

    /// A name does not match any enumeration value.
    #[error("unknown {kind} `{name}`")]
    UnknownName { kind: &'static str, name: String },

    /// An argument is outside the range accepted by a command.
    #[error("{field} out of range ({value}, allowed {min}..={max})")]
    OutOfRange {
        field: &'static str,
        value: i64,
        min: i64,
        max: i64,
    },

    /// The frame would not fit the 16-bit length field.
    #[error("payload too large ({size} bytes, max {max})")]
    PayloadTooLarge { size: usize, max: usize },

    /// A buffer does not have the size the operation requires.
    #[error("buffer size mismatch (expected {expected} bytes, got {actual})")]
    BufferSize { expected: usize, actual: usize },

    /// A numeric field width is not supported by the encoder.
    #[error("unsupported field width {0}")]
    UnsupportedWidth(usize),
}

/// Errors that can occur while reading frames from a byte stream.
#[derive(Debug, thiserror::Error)]
pub enum FrameError {
    /// An I/O error occurred while reading frames.
    #[error("frame I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The stream ended before a complete frame was received.
    #[error("connection closed (incomplete frame)")]
    ConnectionClosed,
}

pub type Result<T> = std::result::Result<T, FrameError>;
