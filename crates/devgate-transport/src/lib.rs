//! Datagram and stream transports for the device gateway.
//!
//! - [`Multiplexer`] turns one UDP socket into per-peer [`VirtualChannel`]s,
//!   each pinned to one worker thread.
//! - [`SendQueue`] serializes outbound writes on a dedicated thread.
//! - [`TcpAcceptor`] serves stream connections through the same
//!   [`ChannelHandler`] interface.

pub mod channel;
pub mod error;
pub mod mux;
pub mod sender;
pub mod socket;
pub mod tcp;
pub mod unknown;
mod worker;

pub use channel::{
    source_address, ChannelHandler, HandlerFactory, Link, PeerKey, PeerKeyFn, VirtualChannel,
};
pub use error::{Result, TransportError};
pub use mux::{Multiplexer, MultiplexerBuilder, MuxConfig};
pub use sender::{Executor, OutboundSink, OutboundTask, SendQueue, SendQueueConfig};
pub use socket::{bind_tcp, bind_udp, SocketConfig};
pub use tcp::{TcpAcceptor, TcpConfig, TcpLink};
pub use unknown::{
    hex_sample, LogUnknownPackets, PacketContext, UnknownPacketHandler, UnknownReason,
};
