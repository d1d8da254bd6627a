//! Gateway with an extra command handler and a session listener.
//!
//! Run with:
//!   cargo run --example custom-dispatch
//!
//! In another terminal:
//!   cargo run --features cli -- build register --device AABBCCDD --format pretty
//!   cargo run --features cli -- send 127.0.0.1:7700 <HEX> --wait

use std::sync::Arc;
use std::time::Duration;

use devgate::frame::command;
use devgate::frame::{CommandType, DeviceId, Frame};
use devgate::session::{
    DeviceSession, DispatchContext, DispatchTable, Gateway, GatewayConfig, GatewayContext,
    RegistryConfig, SessionListener, SessionRegistry,
};

struct Announce;

impl SessionListener for Announce {
    fn on_addition(
        &self,
        id: DeviceId,
        session: &Arc<DeviceSession>,
        previous: Option<&Arc<DeviceSession>>,
    ) {
        eprintln!(
            "device {id} online at {} (replaced: {})",
            session.link().remote_addr(),
            previous.is_some()
        );
    }

    fn on_removal(&self, id: DeviceId, _session: &Arc<DeviceSession>) {
        eprintln!("device {id} offline");
    }
}

/// Answer every custom message with the same body reversed.
fn reverse_custom(ctx: &DispatchContext<'_>, frame: &Frame) -> devgate::session::Result<()> {
    let mut body = frame.payload().to_vec();
    body.reverse();
    ctx.reply(command::custom_message(frame.device_id(), &body)?)
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let registry = SessionRegistry::new(RegistryConfig {
        expiry_window: Duration::from_secs(60),
        sweep_interval: Duration::from_secs(5),
    })
    .with_listener(Arc::new(Announce));

    let dispatch = DispatchTable::with_defaults()
        .on(CommandType::CustomMessage, reverse_custom)
        .build();

    let config = GatewayConfig {
        udp_addr: "127.0.0.1:7700".parse()?,
        tcp_addr: Some("127.0.0.1:7701".parse()?),
        ..GatewayConfig::default()
    };
    let gateway = Gateway::start(config, GatewayContext::new(Arc::new(registry), dispatch))?;
    eprintln!(
        "Listening on udp {} tcp {:?}",
        gateway.udp_addr(),
        gateway.tcp_addr()
    );

    loop {
        std::thread::sleep(Duration::from_secs(10));
        eprintln!("{} sessions", gateway.registry().len());
    }
}
