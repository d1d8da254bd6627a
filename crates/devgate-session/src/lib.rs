//! Device sessions and the gateway built on top of them.
//!
//! This is the "just works" layer. A [`Gateway`] binds the transports,
//! verifies every inbound frame, keeps one [`DeviceSession`] per device id
//! in a [`SessionRegistry`], and answers through a [`DispatchTable`].

pub mod clock;
pub mod dispatch;
pub mod error;
pub mod gateway;
pub mod handler;
pub mod registry;
pub mod session;
pub mod sweeper;

pub use clock::{Clock, ManualClock, SystemClock};
pub use dispatch::{CommandHandler, DispatchContext, DispatchTable, DispatchTableBuilder};
pub use error::{Result, SessionError};
pub use gateway::{Gateway, GatewayConfig, GatewayContext};
pub use handler::ProtocolHandler;
pub use registry::{RegistryConfig, SessionListener, SessionRegistry};
pub use session::DeviceSession;
pub use sweeper::Sweeper;
