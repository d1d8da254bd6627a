use std::net::SocketAddr;

use devgate_frame::{CommandType, DeviceId, ProtocolError};

/// Errors that can occur in session and gateway operations.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// Transport-level error.
    #[error("transport error: {0}")]
    Transport(#[from] devgate_transport::TransportError),

    /// A reply could not be encoded.
    #[error("protocol error: {0}")]
    Protocol(#[from] ProtocolError),

    /// A frame passed verification but its payload is too short for its command.
    #[error("malformed {command} payload from device {device}")]
    MalformedPayload {
        command: &'static str,
        device: DeviceId,
    },

    /// The outbound queue refused a reply.
    #[error("reply to {peer} dropped (link closed or send queue full)")]
    ReplyDropped { peer: SocketAddr },

    /// A configuration value is unusable.
    #[error("invalid gateway config: {0}")]
    InvalidConfig(String),

    /// Failed to spawn a background thread.
    #[error("failed to spawn {name} thread: {source}")]
    Spawn {
        name: String,
        source: std::io::Error,
    },
}

impl SessionError {
    pub(crate) fn malformed(command: CommandType, device: DeviceId) -> Self {
        Self::MalformedPayload {
            command: command.name(),
            device,
        }
    }
}

pub type Result<T> = std::result::Result<T, SessionError>;
