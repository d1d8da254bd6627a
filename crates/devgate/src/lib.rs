//! Gateway for checksummed, length-prefixed binary device protocols.
//!
//! devgate terminates device traffic over UDP and TCP, presents each remote
//! peer as its own logical connection, and tracks device liveness.
//!
//! # Crate Structure
//!
//! - [`frame`]: Frame codec, command builders and the resynchronizing stream decoder
//! - [`transport`]: UDP virtual-channel multiplexer, send queue and TCP transport
//! - [`session`]: Device session registry, dispatch table and gateway (behind `session` feature)

/// Re-export frame types.
pub mod frame {
    pub use devgate_frame::*;
}

/// Re-export transport types.
pub mod transport {
    pub use devgate_transport::*;
}

/// Re-export session types (requires `session` feature).
#[cfg(feature = "session")]
pub mod session {
    pub use devgate_session::*;
}
