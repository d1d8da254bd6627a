//! Reporting for packets that cannot be routed or parsed.

use std::fmt;
use std::net::SocketAddr;

/// Why a packet ended up at the unknown-packet callback.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UnknownReason {
    /// Shorter than the minimum datagram length.
    Undersized,
    /// Longer than the maximum read length.
    Oversized,
    /// Failed frame verification.
    Malformed,
    /// Valid frame with no handler for its command type.
    Unhandled(u8),
    /// Bytes dropped by a stream decoder while resynchronizing.
    Discarded,
}

impl fmt::Display for UnknownReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Undersized => f.write_str("undersized"),
            Self::Oversized => f.write_str("oversized"),
            Self::Malformed => f.write_str("malformed"),
            Self::Unhandled(command) => write!(f, "unhandled command 0x{command:02X}"),
            Self::Discarded => f.write_str("discarded"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PacketContext {
    pub remote: SocketAddr,
    pub len: usize,
    pub reason: UnknownReason,
}

/// Receives malformed or unroutable packets along with a bounded hex sample.
pub trait UnknownPacketHandler: Send + Sync {
    fn on_unknown(&self, ctx: &PacketContext, raw: &[u8], sample: &str);
}

/// Logs every unknown packet at `warn`.
#[derive(Debug, Clone, Copy, Default)]
pub struct LogUnknownPackets;

impl UnknownPacketHandler for LogUnknownPackets {
    fn on_unknown(&self, ctx: &PacketContext, _raw: &[u8], sample: &str) {
        tracing::warn!(
            peer = %ctx.remote,
            len = ctx.len,
            reason = %ctx.reason,
            sample,
            "unknown packet"
        );
    }
}

/// Uppercase hex of at most `max` bytes, with `..` appended when truncated.
pub fn hex_sample(raw: &[u8], max: usize) -> String {
    let shown = &raw[..raw.len().min(max)];
    let mut out = String::with_capacity(shown.len() * 2 + 2);
    for byte in shown {
        out.push_str(&format!("{byte:02X}"));
    }
    if raw.len() > max {
        out.push_str("..");
    }
    out
}

/// Build the sample and invoke the handler.
pub fn report(
    handler: &dyn UnknownPacketHandler,
    remote: SocketAddr,
    reason: UnknownReason,
    raw: &[u8],
    sample_len: usize,
) {
    let ctx = PacketContext {
        remote,
        len: raw.len(),
        reason,
    };
    handler.on_unknown(&ctx, raw, &hex_sample(raw, sample_len));
}
