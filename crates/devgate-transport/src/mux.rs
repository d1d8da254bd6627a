//! One UDP socket, many virtual channels.
//!
//! The channel table is the only shared structure: datagrams are keyed,
//! queued on their channel and drained by the channel's pinned worker, so
//! handlers never need locks of their own.

use std::io::ErrorKind;
use std::net::{SocketAddr, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};

use bytes::Bytes;
use crossbeam::channel::{self, RecvTimeoutError, Sender};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use devgate_frame::MIN_FRAME_LEN;

use crate::channel::{
    source_address, ChannelCloser, ChannelParams, HandlerFactory, Link, PeerKey, PeerKeyFn,
    VirtualChannel,
};
use crate::error::{Result, TransportError};
use crate::sender::{SendQueue, SendQueueConfig};
use crate::socket::{bind_udp, SocketConfig};
use crate::unknown::{self, LogUnknownPackets, UnknownPacketHandler, UnknownReason};
use crate::worker::{WorkerEvent, WorkerPool};

/// Multiplexer configuration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MuxConfig {
    /// Shorter datagrams go straight to the unknown-packet handler.
    pub min_datagram_len: usize,
    /// Receive buffer size; longer datagrams are treated as unknown.
    pub max_read_len: usize,
    /// Bytes of an unknown packet included in its hex sample.
    pub unknown_sample_len: usize,
    pub workers: usize,
    pub inbound_queue_capacity: usize,
    /// Channels idle this long are closed by the reaper.
    pub idle_timeout: Duration,
    pub reap_interval: Duration,
    pub socket: SocketConfig,
    pub send: SendQueueConfig,
}

impl Default for MuxConfig {
    fn default() -> Self {
        Self {
            min_datagram_len: MIN_FRAME_LEN,
            max_read_len: 2048,
            unknown_sample_len: 32,
            workers: 4,
            inbound_queue_capacity: 256,
            idle_timeout: Duration::from_secs(300),
            reap_interval: Duration::from_secs(5),
            socket: SocketConfig::default(),
            send: SendQueueConfig::default(),
        }
    }
}

impl MuxConfig {
    pub fn validate(&self) -> Result<()> {
        let invalid = |msg: &str| Err(TransportError::InvalidConfig(msg.to_string()));
        if self.workers == 0 {
            return invalid("workers must be at least 1");
        }
        if self.max_read_len == 0 || self.min_datagram_len > self.max_read_len {
            return invalid("min_datagram_len must not exceed max_read_len");
        }
        if self.inbound_queue_capacity == 0 || self.send.capacity == 0 {
            return invalid("queue capacities must be at least 1");
        }
        if self.idle_timeout.is_zero()
            || self.reap_interval.is_zero()
            || self.socket.read_timeout.is_zero()
        {
            return invalid("idle_timeout, reap_interval and read_timeout must be non-zero");
        }
        Ok(())
    }
}

struct Shared {
    config: MuxConfig,
    socket: Arc<UdpSocket>,
    local_addr: SocketAddr,
    channels: DashMap<PeerKey, Arc<VirtualChannel>>,
    sender: SendQueue,
    workers: WorkerPool,
    peer_key_fn: PeerKeyFn,
    unknown: Arc<dyn UnknownPacketHandler>,
    next_id: AtomicU64,
    running: AtomicBool,
    epoch: Instant,
    me: Weak<Shared>,
}

impl Shared {
    fn on_datagram_received(&self, src: SocketAddr, payload: &[u8]) {
        let len = payload.len();
        if len < self.config.min_datagram_len {
            self.report(src, UnknownReason::Undersized, payload);
            return;
        }
        if len > self.config.max_read_len {
            self.report(src, UnknownReason::Oversized, payload);
            return;
        }

        let key = (self.peer_key_fn)(src, payload);
        let channel = match self.channels.entry(key.clone()) {
            Entry::Occupied(entry) => Arc::clone(entry.get()),
            Entry::Vacant(entry) => {
                let channel = self.new_channel(key, src);
                // Open must reach the worker before any receiver can see the channel.
                if !self
                    .workers
                    .dispatch(channel.worker(), WorkerEvent::Open(Arc::clone(&channel)))
                {
                    tracing::error!(peer = %src, "worker unavailable, dropping new channel");
                    return;
                }
                entry.insert(Arc::clone(&channel));
                channel
            }
        };

        channel.touch(Instant::now());

        if !channel.enqueue(Bytes::copy_from_slice(payload)) {
            tracing::warn!(peer = %src, channel = channel.id(), len, "inbound queue full or closed, dropping datagram");
            return;
        }
        if channel.mark_scheduled()
            && !self
                .workers
                .dispatch(channel.worker(), WorkerEvent::Drain(Arc::clone(&channel)))
        {
            tracing::error!(peer = %src, channel = channel.id(), "worker unavailable, dropping datagram");
        }
    }

    fn new_channel(&self, key: PeerKey, remote: SocketAddr) -> Arc<VirtualChannel> {
        let worker = self.workers.index_for(&key);
        let closer: Weak<dyn ChannelCloser> = self.me.clone();
        VirtualChannel::new(ChannelParams {
            id: self.next_id.fetch_add(1, Ordering::Relaxed),
            key,
            remote,
            worker,
            inbound_capacity: self.config.inbound_queue_capacity,
            epoch: self.epoch,
            sender: self.sender.clone(),
            closer,
        })
    }

    fn report(&self, src: SocketAddr, reason: UnknownReason, payload: &[u8]) {
        unknown::report(
            self.unknown.as_ref(),
            src,
            reason,
            payload,
            self.config.unknown_sample_len,
        );
    }

    fn reap_idle(&self, now: Instant) -> usize {
        let idle: Vec<Arc<VirtualChannel>> = self
            .channels
            .iter()
            .filter(|entry| entry.value().idle_for(now) >= self.config.idle_timeout)
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in &idle {
            tracing::debug!(channel = channel.id(), peer = %channel.key(), "closing idle channel");
            self.close_channel(channel);
        }
        idle.len()
    }

    fn receive_loop(&self) {
        let mut buf = vec![0u8; self.config.max_read_len + 1];
        while self.running.load(Ordering::Acquire) {
            match self.socket.recv_from(&mut buf) {
                Ok((n, src)) => self.on_datagram_received(src, &buf[..n]),
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) => {}
                Err(err) => {
                    tracing::warn!(addr = %self.local_addr, error = %err, "udp receive failed");
                }
            }
        }
        tracing::debug!(addr = %self.local_addr, "udp receive loop exited");
    }
}

impl ChannelCloser for Shared {
    fn close_channel(&self, channel: &VirtualChannel) {
        if !channel.mark_closed() {
            return;
        }
        self.channels.remove_if(channel.key(), |_, current| {
            std::ptr::eq(Arc::as_ptr(current), channel)
        });
        let released = channel.release_queued();
        if let Some(channel) = channel.self_arc() {
            let worker = channel.worker();
            self.workers.dispatch(worker, WorkerEvent::Close(channel));
        }
        tracing::debug!(channel = channel.id(), peer = %channel.key(), released, "channel removed");
    }
}

/// Configures a [`Multiplexer`] before it is built.
pub struct MultiplexerBuilder {
    config: MuxConfig,
    peer_key_fn: PeerKeyFn,
    unknown: Arc<dyn UnknownPacketHandler>,
}

impl MultiplexerBuilder {
    pub fn new(config: MuxConfig) -> Self {
        Self {
            config,
            peer_key_fn: Arc::new(source_address),
            unknown: Arc::new(LogUnknownPackets),
        }
    }

    pub fn peer_key_fn(mut self, peer_key_fn: PeerKeyFn) -> Self {
        self.peer_key_fn = peer_key_fn;
        self
    }

    pub fn unknown_handler(mut self, handler: Arc<dyn UnknownPacketHandler>) -> Self {
        self.unknown = handler;
        self
    }

    /// Bind `addr` and build.
    pub fn bind(self, addr: SocketAddr, factory: Arc<dyn HandlerFactory>) -> Result<Multiplexer> {
        let socket = bind_udp(addr, &self.config.socket)?;
        self.build(socket, factory)
    }

    /// Build over an already bound socket. The send queue and workers start
    /// here; call [`Multiplexer::start`] to begin receiving.
    pub fn build(self, socket: UdpSocket, factory: Arc<dyn HandlerFactory>) -> Result<Multiplexer> {
        self.config.validate()?;
        socket.set_read_timeout(Some(self.config.socket.read_timeout))?;
        let local_addr = socket.local_addr()?;
        let socket = Arc::new(socket);
        let sender = SendQueue::new(socket.clone(), self.config.send.clone());
        sender.start()?;
        let workers = match WorkerPool::spawn(self.config.workers, factory) {
            Ok(workers) => workers,
            Err(err) => {
                sender.stop();
                return Err(err);
            }
        };

        let shared = Arc::new_cyclic(|me| Shared {
            config: self.config,
            socket,
            local_addr,
            channels: DashMap::new(),
            sender,
            workers,
            peer_key_fn: self.peer_key_fn,
            unknown: self.unknown,
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
            epoch: Instant::now(),
            me: me.clone(),
        });
        tracing::info!(addr = %local_addr, workers = shared.config.workers, "multiplexer ready");
        Ok(Multiplexer {
            shared,
            threads: Mutex::new(Vec::new()),
            stop_tx: Mutex::new(None),
        })
    }
}

/// Demultiplexes one UDP socket into per-peer [`VirtualChannel`]s.
pub struct Multiplexer {
    shared: Arc<Shared>,
    threads: Mutex<Vec<JoinHandle<()>>>,
    stop_tx: Mutex<Option<Sender<()>>>,
}

impl std::fmt::Debug for Multiplexer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Multiplexer").finish_non_exhaustive()
    }
}

impl Multiplexer {
    pub fn builder(config: MuxConfig) -> MultiplexerBuilder {
        MultiplexerBuilder::new(config)
    }

    /// Spawn the receive loop and the idle reaper. A second call is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut threads = self.threads.lock().unwrap_or_else(PoisonError::into_inner);
        if !threads.is_empty() {
            return Ok(());
        }
        if !self.shared.running.load(Ordering::Acquire) {
            return Err(TransportError::Shutdown);
        }

        let shared = Arc::clone(&self.shared);
        let name = "devgate-udp-recv".to_string();
        threads.push(
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || shared.receive_loop())
                .map_err(|source| TransportError::Spawn { name, source })?,
        );

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let shared = Arc::clone(&self.shared);
        let interval = shared.config.reap_interval;
        let name = "devgate-reaper".to_string();
        threads.push(
            thread::Builder::new()
                .name(name.clone())
                .spawn(move || loop {
                    match stop_rx.recv_timeout(interval) {
                        Err(RecvTimeoutError::Timeout) => {
                            shared.reap_idle(Instant::now());
                        }
                        _ => break,
                    }
                })
                .map_err(|source| TransportError::Spawn { name, source })?,
        );
        *self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner) = Some(stop_tx);
        Ok(())
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    /// Route one datagram; the receive loop calls this for every read.
    pub fn on_datagram_received(&self, src: SocketAddr, payload: &[u8]) {
        self.shared.on_datagram_received(src, payload);
    }

    /// Close `channel` if it is still the live instance for its key.
    pub fn close(&self, channel: &VirtualChannel) {
        self.shared.close_channel(channel);
    }

    pub fn write(&self, channel: &VirtualChannel, payload: Bytes) -> bool {
        channel.write(payload)
    }

    pub fn get(&self, key: &PeerKey) -> Option<Arc<VirtualChannel>> {
        self.shared
            .channels
            .get(key)
            .map(|entry| Arc::clone(entry.value()))
    }

    pub fn channel_count(&self) -> usize {
        self.shared.channels.len()
    }

    /// Close every channel idle at `now`; returns how many were closed.
    pub fn reap_idle(&self, now: Instant) -> usize {
        self.shared.reap_idle(now)
    }

    pub fn sender(&self) -> &SendQueue {
        &self.shared.sender
    }

    pub fn is_running(&self) -> bool {
        self.shared.running.load(Ordering::Acquire)
    }

    /// Stop receiving, close all channels, then stop workers and the sender.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        drop(self.stop_tx.lock().unwrap_or_else(PoisonError::into_inner).take());
        let threads = std::mem::take(&mut *self.threads.lock().unwrap_or_else(PoisonError::into_inner));
        for handle in threads {
            let _ = handle.join();
        }

        let open: Vec<Arc<VirtualChannel>> = self
            .shared
            .channels
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for channel in &open {
            self.shared.close_channel(channel);
        }
        self.shared.workers.shutdown();
        self.shared.sender.stop();
        tracing::info!(addr = %self.shared.local_addr, closed = open.len(), "multiplexer shut down");
    }
}

impl Drop for Multiplexer {
    fn drop(&mut self) {
        self.shutdown();
    }
}
