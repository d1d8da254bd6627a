//! Command-type to handler table, built once at startup.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use bytes::Bytes;
use devgate_frame::command::{self, RegisterRequest};
use devgate_frame::{CommandType, Frame, RegisterResult};
use devgate_transport::Link;

use crate::error::{Result, SessionError};
use crate::registry::SessionRegistry;
use crate::session::DeviceSession;

/// Everything a command handler may touch for one inbound frame.
pub struct DispatchContext<'a> {
    pub link: &'a Arc<dyn Link>,
    pub session: &'a Arc<DeviceSession>,
    pub registry: &'a SessionRegistry,
    pub now_millis: u64,
}

impl DispatchContext<'_> {
    /// Queue `frame` back to the device on its current link.
    pub fn reply(&self, frame: Bytes) -> Result<()> {
        if self.link.write(frame) {
            Ok(())
        } else {
            Err(SessionError::ReplyDropped {
                peer: self.link.remote_addr(),
            })
        }
    }
}

/// Handles one command type. Runs on the link's worker thread.
pub trait CommandHandler: Send + Sync {
    fn handle(&self, ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()>;
}

impl<F> CommandHandler for F
where
    F: Fn(&DispatchContext<'_>, &Frame) -> Result<()> + Send + Sync,
{
    fn handle(&self, ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()> {
        self(ctx, frame)
    }
}

#[derive(Default)]
pub struct DispatchTableBuilder {
    handlers: HashMap<u8, Arc<dyn CommandHandler>>,
}

impl DispatchTableBuilder {
    pub fn on(self, command: CommandType, handler: impl CommandHandler + 'static) -> Self {
        self.on_code(command.code(), handler)
    }

    /// Register a handler for a raw type byte outside [`CommandType`].
    pub fn on_code(mut self, code: u8, handler: impl CommandHandler + 'static) -> Self {
        self.handlers.insert(code, Arc::new(handler));
        self
    }

    pub fn build(self) -> DispatchTable {
        DispatchTable {
            handlers: self.handlers,
        }
    }
}

/// Immutable map from command type byte to handler.
pub struct DispatchTable {
    handlers: HashMap<u8, Arc<dyn CommandHandler>>,
}

impl DispatchTable {
    pub fn builder() -> DispatchTableBuilder {
        DispatchTableBuilder::default()
    }

    /// Register and realtime with acknowledgements, unregister, and
    /// liveness-only handling of device replies to gateway commands.
    pub fn with_defaults() -> DispatchTableBuilder {
        Self::builder()
            .on(CommandType::Register, handle_register)
            .on(CommandType::Realtime, handle_realtime)
            .on(CommandType::Unregister, handle_unregister)
            .on(CommandType::RetransmissionRequest, handle_device_reply)
            .on(CommandType::TimeCalibration, handle_device_reply)
            .on(CommandType::DeleteLog, handle_device_reply)
            .on(CommandType::SwitchState, handle_device_reply)
            .on(CommandType::BluetoothMac, handle_device_reply)
            .on(CommandType::UploadRange, handle_device_reply)
            .on(CommandType::CustomMessage, handle_device_reply)
    }

    pub fn handles(&self, code: u8) -> bool {
        self.handlers.contains_key(&code)
    }

    /// Run the handler for `frame`'s type; `None` if there is none.
    pub fn dispatch(&self, ctx: &DispatchContext<'_>, frame: &Frame) -> Option<Result<()>> {
        let handler = self.handlers.get(&frame.command_type())?;
        Some(handler.handle(ctx, frame))
    }
}

impl fmt::Debug for DispatchTable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut codes: Vec<u8> = self.handlers.keys().copied().collect();
        codes.sort_unstable();
        f.debug_struct("DispatchTable")
            .field("codes", &codes)
            .finish()
    }
}

fn handle_register(ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()> {
    let device = frame.device_id();
    let request =
        RegisterRequest::parse(frame).ok_or_else(|| SessionError::malformed(CommandType::Register, device))?;
    ctx.session.refresh(request.seq, ctx.now_millis);

    let result = match request.known_device_type() {
        Some(device_type) => {
            tracing::info!(
                device = %device,
                peer = %ctx.link.remote_addr(),
                device_type = device_type.name(),
                "device registered"
            );
            RegisterResult::Accepted
        }
        None => {
            tracing::warn!(
                device = %device,
                device_type = request.device_type,
                "register rejected: unsupported device type"
            );
            ctx.registry.remove_if_same(device, ctx.session);
            RegisterResult::UnsupportedDevice
        }
    };
    ctx.reply(command::register_ack(
        device,
        request.seq,
        result,
        ctx.now_millis,
    )?)
}

fn handle_realtime(ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()> {
    let device = frame.device_id();
    let seq = frame
        .sequence()
        .ok_or_else(|| SessionError::malformed(CommandType::Realtime, device))?;
    if let Some(previous) = ctx.session.refresh(seq, ctx.now_millis) {
        if seq != previous.wrapping_add(1) {
            tracing::debug!(device = %device, previous, seq, "sequence discontinuity");
        }
    }
    ctx.reply(command::realtime_ack(device, seq)?)
}

fn handle_unregister(ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()> {
    let device = frame.device_id();
    let seq = frame
        .sequence()
        .ok_or_else(|| SessionError::malformed(CommandType::Unregister, device))?;
    if ctx.registry.remove_if_same(device, ctx.session) {
        tracing::info!(device = %device, peer = %ctx.link.remote_addr(), "device unregistered");
    }
    ctx.reply(command::unregister_ack(device, seq)?)
}

fn handle_device_reply(_ctx: &DispatchContext<'_>, frame: &Frame) -> Result<()> {
    tracing::debug!(
        device = %frame.device_id(),
        command = frame.command().map_or("unknown", CommandType::name),
        len = frame.payload().len(),
        "device reply"
    );
    Ok(())
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use devgate_frame::command::{describe_payload, realtime_report, register_request};
    use devgate_frame::{DeviceId, DeviceType};

    use super::*;
    use crate::registry::RegistryConfig;
    use crate::session::test_support::MemoryLink;

    const ID: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD]);

    struct Fixture {
        link: Arc<MemoryLink>,
        dyn_link: Arc<dyn Link>,
        session: Arc<DeviceSession>,
        registry: SessionRegistry,
    }

    impl Fixture {
        fn new() -> Self {
            let link = MemoryLink::new(7);
            let dyn_link: Arc<dyn Link> = link.clone();
            let session = Arc::new(DeviceSession::new(ID, Arc::clone(&dyn_link), 0));
            let registry = SessionRegistry::new(RegistryConfig {
                expiry_window: Duration::from_secs(60),
                ..RegistryConfig::default()
            });
            registry.put(Arc::clone(&session));
            Self {
                link,
                dyn_link,
                session,
                registry,
            }
        }

        fn ctx(&self, now_millis: u64) -> DispatchContext<'_> {
            DispatchContext {
                link: &self.dyn_link,
                session: &self.session,
                registry: &self.registry,
                now_millis,
            }
        }
    }

    fn frame(bytes: Bytes) -> Frame {
        Frame::parse(bytes).expect("valid frame")
    }

    #[test]
    fn register_replies_with_accepted_ack() {
        let fx = Fixture::new();
        let table = DispatchTable::with_defaults().build();
        let request = frame(register_request(ID, 41, DeviceType::Meter).unwrap());

        table.dispatch(&fx.ctx(1_700_000_000_123), &request).unwrap().unwrap();

        let written = fx.link.take_written();
        assert_eq!(written.len(), 1);
        let ack = frame(written[0].clone());
        assert_eq!(ack.command(), Some(CommandType::RegisterAck));
        assert_eq!(ack.device_id(), ID);
        assert_eq!(ack.sequence(), Some(41));
        assert_eq!(ack.payload()[4], RegisterResult::Accepted.code());
        assert_eq!(ack.wire_size(), devgate_frame::FRAME_OVERHEAD + 11);
        assert_eq!(fx.session.last_sequence(), Some(41));
        assert!(fx.registry.get(ID).is_some());
    }

    #[test]
    fn unsupported_device_type_is_rejected_and_dropped() {
        let fx = Fixture::new();
        let table = DispatchTable::with_defaults().build();
        let mut raw = register_request(ID, 1, DeviceType::Meter).unwrap().to_vec();
        raw[13] = 0x7F;
        let last = raw.len() - 1;
        raw[last] = devgate_frame::checksum(&raw);
        let request = frame(Bytes::from(raw));

        table.dispatch(&fx.ctx(10), &request).unwrap().unwrap();

        let ack = frame(fx.link.take_written().remove(0));
        assert_eq!(ack.payload()[4], RegisterResult::UnsupportedDevice.code());
        assert!(fx.registry.get(ID).is_none());
    }

    #[test]
    fn realtime_acks_out_of_order_sequences() {
        let fx = Fixture::new();
        let table = DispatchTable::with_defaults().build();

        for seq in [5, 3] {
            let report = frame(realtime_report(ID, seq, &[1, 2, 3]).unwrap());
            table.dispatch(&fx.ctx(100), &report).unwrap().unwrap();
        }

        let acks: Vec<Option<u32>> = fx
            .link
            .take_written()
            .into_iter()
            .map(|raw| frame(raw).sequence())
            .collect();
        assert_eq!(acks, vec![Some(5), Some(3)]);
        assert_eq!(fx.session.last_sequence(), Some(3));
        assert_eq!(fx.session.last_received(), 100);
    }

    #[test]
    fn unregister_removes_session_and_acks() {
        let fx = Fixture::new();
        let table = DispatchTable::with_defaults().build();
        let request = frame(command::unregister_request(ID, 9).unwrap());

        table.dispatch(&fx.ctx(5), &request).unwrap().unwrap();

        assert!(fx.registry.is_empty());
        let ack = frame(fx.link.take_written().remove(0));
        assert_eq!(ack.command(), Some(CommandType::Unregister));
        assert_eq!(ack.sequence(), Some(9));
    }

    #[test]
    fn short_realtime_payload_is_malformed() {
        let fx = Fixture::new();
        let table = DispatchTable::with_defaults().build();
        let mut raw = command::custom_message(ID, &[1, 2]).unwrap().to_vec();
        raw[8] = CommandType::Realtime.code();
        let last = raw.len() - 1;
        raw[last] = devgate_frame::checksum(&raw);

        let err = table
            .dispatch(&fx.ctx(0), &frame(Bytes::from(raw)))
            .unwrap()
            .unwrap_err();
        assert!(matches!(err, SessionError::MalformedPayload { command: "realtime", .. }));
        assert!(fx.link.take_written().is_empty());
    }

    #[test]
    fn closed_link_drops_reply() {
        let fx = Fixture::new();
        fx.link.close();
        let table = DispatchTable::with_defaults().build();
        let report = frame(realtime_report(ID, 1, &[]).unwrap());

        let err = table.dispatch(&fx.ctx(0), &report).unwrap().unwrap_err();
        assert!(matches!(err, SessionError::ReplyDropped { .. }));
    }

    #[test]
    fn custom_handlers_and_unhandled_codes() {
        let fx = Fixture::new();
        let table = DispatchTable::builder()
            .on_code(0x42, |ctx: &DispatchContext<'_>, frame: &Frame| {
                ctx.reply(command::custom_message(frame.device_id(), b"pong")?)
            })
            .build();
        assert!(table.handles(0x42));
        assert!(!table.handles(CommandType::Register.code()));

        let mut raw = command::custom_message(ID, b"ping").unwrap().to_vec();
        raw[8] = 0x42;
        let last = raw.len() - 1;
        raw[last] = devgate_frame::checksum(&raw);
        table
            .dispatch(&fx.ctx(0), &frame(Bytes::from(raw)))
            .unwrap()
            .unwrap();
        let reply = frame(fx.link.take_written().remove(0));
        assert_eq!(describe_payload(&reply), vec![("body", "70696E67".to_string())]);

        let register = frame(register_request(ID, 1, DeviceType::Lock).unwrap());
        assert!(table.dispatch(&fx.ctx(0), &register).is_none());
    }
}
