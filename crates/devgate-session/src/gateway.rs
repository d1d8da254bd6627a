//! Wiring of registry, dispatch table and transports into one running gateway.

use std::net::SocketAddr;
use std::sync::Arc;

use devgate_transport::{
    ChannelHandler, HandlerFactory, Link, LogUnknownPackets, Multiplexer, MuxConfig, TcpAcceptor,
    TcpConfig, UnknownPacketHandler,
};

use crate::clock::{Clock, SystemClock};
use crate::dispatch::DispatchTable;
use crate::error::{Result, SessionError};
use crate::handler::ProtocolHandler;
use crate::registry::SessionRegistry;
use crate::sweeper::Sweeper;

/// Shared state handed to every [`ProtocolHandler`].
pub struct GatewayContext {
    pub registry: Arc<SessionRegistry>,
    pub dispatch: DispatchTable,
    pub unknown: Arc<dyn UnknownPacketHandler>,
    pub clock: Arc<dyn Clock>,
    pub unknown_sample_len: usize,
}

impl GatewayContext {
    pub fn new(registry: Arc<SessionRegistry>, dispatch: DispatchTable) -> Self {
        Self {
            registry,
            dispatch,
            unknown: Arc::new(LogUnknownPackets),
            clock: Arc::new(SystemClock),
            unknown_sample_len: MuxConfig::default().unknown_sample_len,
        }
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    pub fn with_unknown_handler(mut self, unknown: Arc<dyn UnknownPacketHandler>) -> Self {
        self.unknown = unknown;
        self
    }

    /// A factory creating one [`ProtocolHandler`] per link.
    pub fn handler_factory(self: &Arc<Self>) -> Arc<dyn HandlerFactory> {
        let ctx = Arc::clone(self);
        Arc::new(move |_link: &Arc<dyn Link>| -> Box<dyn ChannelHandler> {
            Box::new(ProtocolHandler::new(Arc::clone(&ctx)))
        })
    }
}

impl std::fmt::Debug for GatewayContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("GatewayContext")
            .field("registry", &self.registry)
            .field("dispatch", &self.dispatch)
            .field("unknown_sample_len", &self.unknown_sample_len)
            .finish_non_exhaustive()
    }
}

/// Everything needed to start a [`Gateway`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GatewayConfig {
    pub udp_addr: SocketAddr,
    /// TCP is served only when set.
    pub tcp_addr: Option<SocketAddr>,
    pub mux: MuxConfig,
    pub tcp: TcpConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            udp_addr: SocketAddr::from(([0, 0, 0, 0], 7700)),
            tcp_addr: None,
            mux: MuxConfig::default(),
            tcp: TcpConfig::default(),
        }
    }
}

impl GatewayConfig {
    pub fn validate(&self) -> Result<()> {
        self.mux.validate()?;
        if self.tcp_addr.is_some() && self.tcp.max_frame_len < devgate_frame::MIN_FRAME_LEN {
            return Err(SessionError::InvalidConfig(format!(
                "tcp max_frame_len must be at least {}",
                devgate_frame::MIN_FRAME_LEN
            )));
        }
        Ok(())
    }
}

/// A running gateway. Dropping it shuts everything down.
pub struct Gateway {
    ctx: Arc<GatewayContext>,
    mux: Multiplexer,
    tcp: Option<TcpAcceptor>,
    sweeper: Sweeper,
}

impl Gateway {
    /// Bind UDP (and TCP if configured), then start receiving and sweeping.
    ///
    /// Expiry and sweep timing come from the context's registry.
    pub fn start(config: GatewayConfig, mut ctx: GatewayContext) -> Result<Self> {
        config.validate()?;
        let registry_config = ctx.registry.config().clone();
        registry_config.validate()?;
        ctx.unknown_sample_len = config.mux.unknown_sample_len;
        let ctx = Arc::new(ctx);
        let factory = ctx.handler_factory();

        let mux = Multiplexer::builder(config.mux.clone())
            .unknown_handler(Arc::clone(&ctx.unknown))
            .bind(config.udp_addr, Arc::clone(&factory))?;
        mux.start()?;

        let tcp = match config.tcp_addr {
            Some(addr) => Some(TcpAcceptor::bind(
                addr,
                config.tcp.clone(),
                factory,
                Arc::clone(&ctx.unknown),
            )?),
            None => None,
        };

        let sweeper = Sweeper::spawn(
            Arc::clone(&ctx.registry),
            Arc::clone(&ctx.clock),
            registry_config.sweep_interval,
        )?;

        tracing::info!(
            udp = %mux.local_addr(),
            tcp = ?tcp.as_ref().map(TcpAcceptor::local_addr),
            expiry_secs = registry_config.expiry_window.as_secs(),
            "gateway started"
        );
        Ok(Self {
            ctx,
            mux,
            tcp,
            sweeper,
        })
    }

    pub fn udp_addr(&self) -> SocketAddr {
        self.mux.local_addr()
    }

    pub fn tcp_addr(&self) -> Option<SocketAddr> {
        self.tcp.as_ref().map(TcpAcceptor::local_addr)
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.ctx.registry
    }

    pub fn context(&self) -> &Arc<GatewayContext> {
        &self.ctx
    }

    pub fn multiplexer(&self) -> &Multiplexer {
        &self.mux
    }

    pub fn tcp_acceptor(&self) -> Option<&TcpAcceptor> {
        self.tcp.as_ref()
    }

    /// Stop the sweeper and every transport. Idempotent.
    pub fn shutdown(&self) {
        self.sweeper.stop();
        if let Some(tcp) = &self.tcp {
            tcp.shutdown();
        }
        self.mux.shutdown();
    }
}

impl Drop for Gateway {
    fn drop(&mut self) {
        self.shutdown();
    }
}

#[cfg(test)]
mod tests {
    use std::net::{TcpStream, UdpSocket};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    use devgate_frame::command::{realtime_report, register_request, unregister_request};
    use devgate_frame::{CommandType, DeviceId, DeviceType, Frame, FrameReader, RegisterResult};
    use devgate_transport::{PacketContext, UnknownReason};

    use super::*;
    use crate::clock::ManualClock;
    use crate::registry::RegistryConfig;

    const ID: DeviceId = DeviceId([0xAA, 0xBB, 0xCC, 0xDD]);

    #[derive(Default)]
    struct Unknowns(Mutex<Vec<UnknownReason>>);

    impl UnknownPacketHandler for Unknowns {
        fn on_unknown(&self, ctx: &PacketContext, _raw: &[u8], _sample: &str) {
            self.0.lock().unwrap().push(ctx.reason);
        }
    }

    fn loopback_config(tcp: bool) -> GatewayConfig {
        let local = SocketAddr::from(([127, 0, 0, 1], 0));
        let mut config = GatewayConfig {
            udp_addr: local,
            tcp_addr: tcp.then_some(local),
            ..GatewayConfig::default()
        };
        config.mux.workers = 2;
        config
    }

    fn start(tcp: bool) -> (Gateway, Arc<ManualClock>, Arc<Unknowns>) {
        let clock = Arc::new(ManualClock::new(1_700_000_000_000));
        let unknowns = Arc::new(Unknowns::default());
        let registry = Arc::new(SessionRegistry::new(RegistryConfig {
            expiry_window: Duration::from_secs(60),
            sweep_interval: Duration::from_millis(20),
        }));
        let ctx = GatewayContext::new(registry, DispatchTable::with_defaults().build())
            .with_clock(clock.clone())
            .with_unknown_handler(unknowns.clone());
        let gateway = Gateway::start(loopback_config(tcp), ctx).expect("gateway start");
        (gateway, clock, unknowns)
    }

    fn exchange(client: &UdpSocket, gateway: SocketAddr, frame: &[u8]) -> Frame {
        client.send_to(frame, gateway).unwrap();
        let mut buf = [0u8; 256];
        let (n, _) = client.recv_from(&mut buf).unwrap();
        Frame::parse(buf[..n].to_vec()).expect("valid reply")
    }

    fn wait_until(mut done: impl FnMut() -> bool) -> bool {
        let deadline = Instant::now() + Duration::from_secs(2);
        while Instant::now() < deadline {
            if done() {
                return true;
            }
            thread::sleep(Duration::from_millis(5));
        }
        done()
    }

    #[test]
    fn udp_device_lifecycle() {
        let (gateway, _clock, unknowns) = start(false);
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let addr = gateway.udp_addr();

        let ack = exchange(&client, addr, &register_request(ID, 1, DeviceType::Meter).unwrap());
        assert_eq!(ack.command(), Some(CommandType::RegisterAck));
        assert_eq!(ack.payload()[4], RegisterResult::Accepted.code());
        assert_eq!(gateway.registry().len(), 1);

        let ack = exchange(&client, addr, &realtime_report(ID, 2, &[7, 7]).unwrap());
        assert_eq!(ack.command(), Some(CommandType::RealtimeAck));
        assert_eq!(ack.sequence(), Some(2));
        assert_eq!(gateway.registry().get(ID).unwrap().last_sequence(), Some(2));

        let ack = exchange(&client, addr, &unregister_request(ID, 3).unwrap());
        assert_eq!(ack.command(), Some(CommandType::Unregister));
        assert!(gateway.registry().is_empty());

        client.send_to(&[0x55, 0xAA, 0x00, 0x08, 1, 2, 3, 4, 5, 6], addr).unwrap();
        client.send_to(&[0x01, 0x02], addr).unwrap();
        assert!(wait_until(|| unknowns.0.lock().unwrap().len() == 2));
        let seen = unknowns.0.lock().unwrap().clone();
        assert!(seen.contains(&UnknownReason::Malformed));
        assert!(seen.contains(&UnknownReason::Undersized));

        gateway.shutdown();
        assert!(!gateway.multiplexer().is_running());
    }

    #[test]
    fn silent_devices_are_swept() {
        let (gateway, clock, _unknowns) = start(false);
        let client = UdpSocket::bind("127.0.0.1:0").unwrap();
        client
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();

        exchange(
            &client,
            gateway.udp_addr(),
            &register_request(ID, 1, DeviceType::Lock).unwrap(),
        );
        assert_eq!(gateway.registry().len(), 1);

        clock.advance(Duration::from_secs(59));
        thread::sleep(Duration::from_millis(60));
        assert_eq!(gateway.registry().len(), 1);

        clock.advance(Duration::from_secs(1));
        assert!(wait_until(|| gateway.registry().is_empty()));
    }

    #[test]
    fn tcp_device_registers_through_stream() {
        let (gateway, _clock, _unknowns) = start(true);
        let tcp_addr = gateway.tcp_addr().expect("tcp enabled");

        let mut stream = TcpStream::connect(tcp_addr).unwrap();
        stream
            .set_read_timeout(Some(Duration::from_secs(2)))
            .unwrap();
        let request = register_request(ID, 5, DeviceType::Sensor).unwrap();
        let mut wire = vec![0x00, 0x13];
        wire.extend_from_slice(&request);
        std::io::Write::write_all(&mut stream, &wire).unwrap();

        let mut reader = FrameReader::new(stream);
        let ack = reader.read_frame().unwrap();
        assert_eq!(ack.command(), Some(CommandType::RegisterAck));
        assert_eq!(ack.sequence(), Some(5));
        assert!(wait_until(|| gateway.registry().len() == 1));
        assert!(gateway.registry().get(ID).unwrap().link().remote_addr().port() > 0);
    }

    #[test]
    fn invalid_config_is_rejected() {
        let ctx = GatewayContext::new(
            Arc::new(SessionRegistry::new(RegistryConfig {
                expiry_window: Duration::ZERO,
                ..RegistryConfig::default()
            })),
            DispatchTable::builder().build(),
        );
        let err = Gateway::start(loopback_config(false), ctx).err().unwrap();
        assert!(matches!(err, SessionError::InvalidConfig(_)));

        let mut config = loopback_config(false);
        config.mux.min_datagram_len = config.mux.max_read_len + 1;
        let ctx = GatewayContext::new(
            Arc::new(SessionRegistry::new(RegistryConfig::default())),
            DispatchTable::builder().build(),
        );
        let err = Gateway::start(config, ctx).err().unwrap();
        assert!(matches!(err, SessionError::Transport(_)));
    }
}
