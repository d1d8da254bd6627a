//! Fixed pool of I/O workers; each owns the handlers of the channels
//! pinned to it.

use std::collections::hash_map::DefaultHasher;
use std::collections::HashMap;
use std::hash::{Hash, Hasher};
use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use crossbeam::channel::{self, Sender};

use crate::channel::{ChannelHandler, HandlerFactory, Link, PeerKey, VirtualChannel};
use crate::error::{Result, TransportError};

pub(crate) enum WorkerEvent {
    Open(Arc<VirtualChannel>),
    Drain(Arc<VirtualChannel>),
    Close(Arc<VirtualChannel>),
    Stop,
}

pub(crate) struct WorkerPool {
    senders: Vec<Sender<WorkerEvent>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

impl WorkerPool {
    pub(crate) fn spawn(count: usize, factory: Arc<dyn HandlerFactory>) -> Result<Self> {
        if count == 0 {
            return Err(TransportError::InvalidConfig(
                "worker count must be at least 1".to_string(),
            ));
        }
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for index in 0..count {
            let (tx, rx) = channel::unbounded();
            let factory = Arc::clone(&factory);
            let name = format!("devgate-io-{index}");
            let handle = thread::Builder::new()
                .name(name.clone())
                .spawn(move || {
                    let mut worker = Worker {
                        index,
                        factory,
                        handlers: HashMap::new(),
                    };
                    for event in rx {
                        if !worker.handle(event) {
                            break;
                        }
                    }
                    worker.close_all();
                })
                .map_err(|source| TransportError::Spawn { name, source })?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders,
            handles: Mutex::new(handles),
        })
    }

    /// Worker index for `key`; stable for the lifetime of the pool.
    pub(crate) fn index_for(&self, key: &PeerKey) -> usize {
        let mut hasher = DefaultHasher::new();
        key.hash(&mut hasher);
        (hasher.finish() % self.senders.len() as u64) as usize
    }

    pub(crate) fn dispatch(&self, index: usize, event: WorkerEvent) -> bool {
        match self.senders.get(index) {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    pub(crate) fn shutdown(&self) {
        for tx in &self.senders {
            let _ = tx.send(WorkerEvent::Stop);
        }
        let handles = std::mem::take(
            &mut *self.handles.lock().unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for handle in handles {
            if handle.thread().id() != current {
                let _ = handle.join();
            }
        }
    }
}

struct Worker {
    index: usize,
    factory: Arc<dyn HandlerFactory>,
    handlers: HashMap<u64, Box<dyn ChannelHandler>>,
}

impl Worker {
    /// Returns false on stop.
    fn handle(&mut self, event: WorkerEvent) -> bool {
        match event {
            WorkerEvent::Open(channel) => self.open(&channel),
            WorkerEvent::Drain(channel) => self.drain(&channel),
            WorkerEvent::Close(channel) => self.close(&channel),
            WorkerEvent::Stop => return false,
        }
        true
    }

    fn open(&mut self, channel: &Arc<VirtualChannel>) {
        if !channel.is_open() || self.handlers.contains_key(&channel.id()) {
            return;
        }
        let link: Arc<dyn Link> = channel.clone();
        let mut handler = self.factory.create(&link);
        handler.on_open(&link);
        self.handlers.insert(channel.id(), handler);
        tracing::debug!(worker = self.index, channel = channel.id(), peer = %channel.key(), "channel opened");
    }

    fn drain(&mut self, channel: &Arc<VirtualChannel>) {
        channel.begin_drain();
        let Some(handler) = self.handlers.get_mut(&channel.id()) else {
            return;
        };
        let link: Arc<dyn Link> = channel.clone();
        while channel.is_open() {
            let Some(datagram) = channel.next_inbound() else {
                break;
            };
            let result = panic::catch_unwind(AssertUnwindSafe(|| handler.on_frame(&link, datagram)));
            if result.is_err() {
                tracing::error!(channel = channel.id(), peer = %link.remote_addr(), "channel handler panicked");
            }
        }
    }

    fn close(&mut self, channel: &Arc<VirtualChannel>) {
        channel.release_queued();
        if let Some(mut handler) = self.handlers.remove(&channel.id()) {
            let link: Arc<dyn Link> = channel.clone();
            handler.on_close(&link);
            tracing::debug!(worker = self.index, channel = channel.id(), "channel closed");
        }
    }

    fn close_all(&mut self) {
        let remaining = self.handlers.len();
        self.handlers.clear();
        if remaining > 0 {
            tracing::debug!(worker = self.index, remaining, "dropped handlers at worker stop");
        }
    }
}
