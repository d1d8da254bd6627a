use std::sync::Arc;

use bytes::Bytes;
use devgate_frame::{CommandType, Frame};
use devgate_transport::unknown::report;
use devgate_transport::{ChannelHandler, Link, UnknownReason};

use crate::dispatch::DispatchContext;
use crate::gateway::GatewayContext;
use crate::session::DeviceSession;

/// Per-link protocol state: verifies frames, keeps the session current,
/// then hands the frame to the dispatch table.
pub struct ProtocolHandler {
    ctx: Arc<GatewayContext>,
    frames: u64,
}

impl ProtocolHandler {
    pub fn new(ctx: Arc<GatewayContext>) -> Self {
        Self { ctx, frames: 0 }
    }

    /// Frames accepted on this link so far.
    pub fn frames(&self) -> u64 {
        self.frames
    }

    fn unknown(&self, link: &Arc<dyn Link>, reason: UnknownReason, raw: &[u8]) {
        report(
            self.ctx.unknown.as_ref(),
            link.remote_addr(),
            reason,
            raw,
            self.ctx.unknown_sample_len,
        );
    }

    fn session_for(&self, link: &Arc<dyn Link>, frame: &Frame, now: u64) -> Arc<DeviceSession> {
        let id = frame.device_id();
        let registering = frame.command() == Some(CommandType::Register);
        match self.ctx.registry.get(id) {
            Some(existing) if existing.is_bound_to(link) && !registering => {
                existing.touch(now);
                existing
            }
            _ => {
                let session = Arc::new(DeviceSession::new(id, Arc::clone(link), now));
                self.ctx.registry.put(Arc::clone(&session));
                session
            }
        }
    }
}

impl ChannelHandler for ProtocolHandler {
    fn on_open(&mut self, link: &Arc<dyn Link>) {
        tracing::debug!(link = link.id(), peer = %link.remote_addr(), "link opened");
    }

    fn on_frame(&mut self, link: &Arc<dyn Link>, raw: Bytes) {
        let Some(frame) = Frame::parse(raw.clone()) else {
            self.unknown(link, UnknownReason::Malformed, &raw);
            return;
        };
        if !self.ctx.dispatch.handles(frame.command_type()) {
            self.unknown(link, UnknownReason::Unhandled(frame.command_type()), &raw);
            return;
        }
        self.frames += 1;

        let now = self.ctx.clock.now_millis();
        let session = self.session_for(link, &frame, now);
        let dispatch = DispatchContext {
            link,
            session: &session,
            registry: &self.ctx.registry,
            now_millis: now,
        };
        if let Some(Err(err)) = self.ctx.dispatch.dispatch(&dispatch, &frame) {
            tracing::warn!(
                device = %frame.device_id(),
                peer = %link.remote_addr(),
                command = format_args!("0x{:02X}", frame.command_type()),
                error = %err,
                "command handler failed"
            );
        }
    }

    fn on_close(&mut self, link: &Arc<dyn Link>) {
        tracing::debug!(
            link = link.id(),
            peer = %link.remote_addr(),
            frames = self.frames,
            "link closed"
        );
    }
}
