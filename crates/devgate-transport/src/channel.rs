//! Virtual channels and the link abstraction shared with stream transports.

use std::fmt;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender};

use crate::sender::{OutboundTask, SendQueue};

/// Identity of a virtual channel.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum PeerKey {
    /// Keyed by datagram source address.
    Addr(SocketAddr),
    /// Keyed by a caller-derived value, e.g. something carried in the packet.
    Custom(u64),
}

impl fmt::Display for PeerKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Addr(addr) => write!(f, "{addr}"),
            Self::Custom(value) => write!(f, "#{value:016x}"),
        }
    }
}

/// Derives the peer key for a datagram.
pub type PeerKeyFn = Arc<dyn Fn(SocketAddr, &[u8]) -> PeerKey + Send + Sync>;

/// Default peer key: the source address.
pub fn source_address(src: SocketAddr, _packet: &[u8]) -> PeerKey {
    PeerKey::Addr(src)
}

/// A logical connection to one remote peer.
///
/// Implemented by UDP virtual channels and TCP connections alike.
pub trait Link: Send + Sync {
    fn id(&self) -> u64;

    fn remote_addr(&self) -> SocketAddr;

    /// Queue `payload` for the peer; `false` if closed or the queue is full.
    fn write(&self, payload: Bytes) -> bool;

    /// Close the link. Idempotent.
    fn close(&self);

    fn is_open(&self) -> bool;
}

impl fmt::Debug for dyn Link {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Link")
            .field("id", &self.id())
            .field("remote", &self.remote_addr())
            .field("open", &self.is_open())
            .finish()
    }
}

/// Per-link protocol state, owned by the thread that serves the link.
pub trait ChannelHandler: Send {
    fn on_open(&mut self, link: &Arc<dyn Link>);

    fn on_frame(&mut self, link: &Arc<dyn Link>, frame: Bytes);

    fn on_close(&mut self, link: &Arc<dyn Link>);
}

/// Creates one [`ChannelHandler`] per new link.
pub trait HandlerFactory: Send + Sync {
    fn create(&self, link: &Arc<dyn Link>) -> Box<dyn ChannelHandler>;
}

impl<F> HandlerFactory for F
where
    F: Fn(&Arc<dyn Link>) -> Box<dyn ChannelHandler> + Send + Sync,
{
    fn create(&self, link: &Arc<dyn Link>) -> Box<dyn ChannelHandler> {
        self(link)
    }
}

/// Removes a channel from whatever table owns it.
pub(crate) trait ChannelCloser: Send + Sync {
    fn close_channel(&self, channel: &VirtualChannel);
}

/// A per-peer logical connection over a shared UDP socket.
pub struct VirtualChannel {
    id: u64,
    key: PeerKey,
    remote: SocketAddr,
    worker: usize,
    open: AtomicBool,
    scheduled: AtomicBool,
    inbound_tx: Sender<Bytes>,
    inbound_rx: Receiver<Bytes>,
    epoch: Instant,
    last_active_ms: AtomicU64,
    sender: SendQueue,
    closer: Weak<dyn ChannelCloser>,
    me: Weak<VirtualChannel>,
}

pub(crate) struct ChannelParams {
    pub id: u64,
    pub key: PeerKey,
    pub remote: SocketAddr,
    pub worker: usize,
    pub inbound_capacity: usize,
    pub epoch: Instant,
    pub sender: SendQueue,
    pub closer: Weak<dyn ChannelCloser>,
}

impl VirtualChannel {
    pub(crate) fn new(params: ChannelParams) -> Arc<Self> {
        let (inbound_tx, inbound_rx) = channel::bounded(params.inbound_capacity.max(1));
        let now_ms = params.epoch.elapsed().as_millis() as u64;
        Arc::new_cyclic(|me| Self {
            id: params.id,
            key: params.key,
            remote: params.remote,
            worker: params.worker,
            open: AtomicBool::new(true),
            scheduled: AtomicBool::new(false),
            inbound_tx,
            inbound_rx,
            epoch: params.epoch,
            last_active_ms: AtomicU64::new(now_ms),
            sender: params.sender,
            closer: params.closer,
            me: me.clone(),
        })
    }

    pub fn key(&self) -> &PeerKey {
        &self.key
    }

    /// Index of the worker that serves this channel.
    pub fn worker(&self) -> usize {
        self.worker
    }

    /// Datagrams received but not yet handed to the handler.
    pub fn queued(&self) -> usize {
        self.inbound_rx.len()
    }

    pub fn idle_for(&self, now: Instant) -> Duration {
        let last = self.epoch + Duration::from_millis(self.last_active_ms.load(Ordering::Relaxed));
        now.saturating_duration_since(last)
    }

    pub(crate) fn touch(&self, now: Instant) {
        let ms = now.saturating_duration_since(self.epoch).as_millis() as u64;
        self.last_active_ms.fetch_max(ms, Ordering::Relaxed);
    }

    pub(crate) fn self_arc(&self) -> Option<Arc<VirtualChannel>> {
        self.me.upgrade()
    }

    pub(crate) fn enqueue(&self, datagram: Bytes) -> bool {
        self.is_open() && self.inbound_tx.try_send(datagram).is_ok()
    }

    /// Returns true when the caller must route a drain to the worker.
    pub(crate) fn mark_scheduled(&self) -> bool {
        !self.scheduled.swap(true, Ordering::AcqRel)
    }

    pub(crate) fn begin_drain(&self) {
        self.scheduled.store(false, Ordering::Release);
    }

    pub(crate) fn next_inbound(&self) -> Option<Bytes> {
        self.inbound_rx.try_recv().ok()
    }

    pub(crate) fn release_queued(&self) -> usize {
        self.inbound_rx.try_iter().count()
    }

    /// Flip to closed; true only for the call that did it.
    pub(crate) fn mark_closed(&self) -> bool {
        self.open.swap(false, Ordering::AcqRel)
    }
}

impl Link for VirtualChannel {
    fn id(&self) -> u64 {
        self.id
    }

    fn remote_addr(&self) -> SocketAddr {
        self.remote
    }

    fn write(&self, payload: Bytes) -> bool {
        self.is_open() && self.sender.submit(OutboundTask::new(self.remote, payload))
    }

    fn close(&self) {
        match self.closer.upgrade() {
            Some(closer) => closer.close_channel(self),
            None => {
                if self.mark_closed() {
                    self.release_queued();
                }
            }
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

impl fmt::Debug for VirtualChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("VirtualChannel")
            .field("id", &self.id)
            .field("key", &self.key)
            .field("worker", &self.worker)
            .field("open", &self.is_open())
            .field("queued", &self.queued())
            .finish()
    }
}
