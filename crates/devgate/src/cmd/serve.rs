use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use devgate_frame::DeviceId;
use devgate_session::{
    DeviceSession, DispatchTable, Gateway, GatewayContext, SessionListener, SessionRegistry,
};

use crate::cmd::ServeArgs;
use crate::config::{parse_duration, FileConfig};
use crate::exit::{session_error, CliError, CliResult, INTERNAL, SUCCESS};
use crate::output::{print_event, OutputFormat};

const POLL_INTERVAL: Duration = Duration::from_millis(100);

/// Prints session additions and removals as they happen.
struct PrintSessions {
    format: OutputFormat,
}

impl SessionListener for PrintSessions {
    fn on_addition(
        &self,
        id: DeviceId,
        session: &Arc<DeviceSession>,
        previous: Option<&Arc<DeviceSession>>,
    ) {
        let mut fields = vec![
            ("device", id.to_string()),
            ("peer", session.link().remote_addr().to_string()),
        ];
        if let Some(previous) = previous {
            fields.push(("replaced_peer", previous.link().remote_addr().to_string()));
        }
        print_event("session_added", &fields, self.format);
    }

    fn on_removal(&self, id: DeviceId, session: &Arc<DeviceSession>) {
        print_event(
            "session_removed",
            &[
                ("device", id.to_string()),
                ("peer", session.link().remote_addr().to_string()),
                ("last_received", session.last_received().to_string()),
            ],
            self.format,
        );
    }
}

pub fn run(args: ServeArgs, format: OutputFormat) -> CliResult<i32> {
    let run_for = args.run_for.as_deref().map(parse_duration).transpose()?;
    let (gateway_config, registry_config) = FileConfig::resolve(&args)?.into_parts()?;

    let registry = SessionRegistry::new(registry_config)
        .with_listener(Arc::new(PrintSessions { format }));
    let ctx = GatewayContext::new(
        Arc::new(registry),
        DispatchTable::with_defaults().build(),
    );
    let gateway =
        Gateway::start(gateway_config, ctx).map_err(|err| session_error("start failed", err))?;

    let running = Arc::new(AtomicBool::new(true));
    install_ctrlc_handler(running.clone())?;

    print_event(
        "listening",
        &[
            ("udp", gateway.udp_addr().to_string()),
            (
                "tcp",
                gateway
                    .tcp_addr()
                    .map_or_else(|| "-".to_string(), |addr| addr.to_string()),
            ),
        ],
        format,
    );

    let started = Instant::now();
    while running.load(Ordering::SeqCst) {
        if run_for.is_some_and(|limit| started.elapsed() >= limit) {
            break;
        }
        thread::sleep(POLL_INTERVAL);
    }

    let sessions = gateway.registry().len();
    gateway.shutdown();
    print_event(
        "stopped",
        &[
            ("sessions", sessions.to_string()),
            ("uptime_ms", started.elapsed().as_millis().to_string()),
        ],
        format,
    );
    Ok(SUCCESS)
}

fn install_ctrlc_handler(running: Arc<AtomicBool>) -> CliResult<()> {
    ctrlc::set_handler(move || {
        running.store(false, Ordering::SeqCst);
    })
    .map_err(|err| CliError::new(INTERNAL, format!("signal handler setup failed: {err}")))
}
