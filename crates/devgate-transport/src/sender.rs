//! Bounded outbound queue drained by one dedicated thread.
//!
//! Producers never block: [`SendQueue::submit`] reports `false` when the
//! queue is stopped or full. Tasks leave the queue in submission order.

use std::fmt;
use std::io::{self, Write};
use std::net::{SocketAddr, TcpStream, UdpSocket};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use crossbeam::channel::{self, Receiver, Sender, TrySendError};

use crate::error::{Result, TransportError};

/// Destination for outbound bytes.
pub trait OutboundSink: Send + Sync + 'static {
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<()>;
}

impl OutboundSink for UdpSocket {
    fn send_to(&self, payload: &[u8], target: SocketAddr) -> io::Result<()> {
        UdpSocket::send_to(self, payload, target).map(|_| ())
    }
}

/// A connected stream ignores the target address.
impl OutboundSink for TcpStream {
    fn send_to(&self, payload: &[u8], _target: SocketAddr) -> io::Result<()> {
        let mut stream = self;
        stream.write_all(payload)
    }
}

/// Runs dequeued tasks somewhere other than the sender thread.
pub trait Executor: Send + Sync {
    fn execute(&self, job: Box<dyn FnOnce() + Send>);
}

/// One pending datagram or stream write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutboundTask {
    pub target: SocketAddr,
    pub payload: Bytes,
}

impl OutboundTask {
    pub fn new(target: SocketAddr, payload: Bytes) -> Self {
        Self { target, payload }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SendQueueConfig {
    pub capacity: usize,
    pub thread_name: String,
}

impl Default for SendQueueConfig {
    fn default() -> Self {
        Self {
            capacity: 1024,
            thread_name: "devgate-sender".to_string(),
        }
    }
}

#[derive(Default)]
struct WorkerState {
    handle: Option<JoinHandle<()>>,
    shutdown: Option<Sender<()>>,
}

struct Inner {
    sink: Arc<dyn OutboundSink>,
    executor: Option<Arc<dyn Executor>>,
    thread_name: String,
    tx: Sender<OutboundTask>,
    rx: Receiver<OutboundTask>,
    running: AtomicBool,
    state: Mutex<WorkerState>,
    sent: AtomicU64,
    failed: AtomicU64,
}

impl Inner {
    fn dispatch(self: &Arc<Self>, task: OutboundTask) {
        match &self.executor {
            Some(executor) => {
                let inner = Arc::clone(self);
                executor.execute(Box::new(move || inner.deliver(&task)));
            }
            None => self.deliver(&task),
        }
    }

    fn deliver(&self, task: &OutboundTask) {
        match self.sink.send_to(&task.payload, task.target) {
            Ok(()) => {
                self.sent.fetch_add(1, Ordering::Relaxed);
            }
            Err(err) => {
                self.failed.fetch_add(1, Ordering::Relaxed);
                tracing::warn!(
                    peer = %task.target,
                    len = task.payload.len(),
                    error = %err,
                    "outbound send failed"
                );
            }
        }
    }

    fn run(self: Arc<Self>, shutdown: Receiver<()>) {
        loop {
            channel::select! {
                recv(self.rx) -> task => match task {
                    Ok(task) if self.running.load(Ordering::Acquire) => self.dispatch(task),
                    _ => break,
                },
                recv(shutdown) -> _ => break,
            }
        }
        tracing::debug!(thread = %self.thread_name, "send queue worker exited");
    }
}

/// Cloneable handle to a bounded send queue and its worker thread.
#[derive(Clone)]
pub struct SendQueue {
    inner: Arc<Inner>,
}

impl SendQueue {
    pub fn new(sink: Arc<dyn OutboundSink>, config: SendQueueConfig) -> Self {
        Self::build(sink, config, None)
    }

    /// Hand every dequeued task to `executor` instead of sending inline.
    pub fn with_executor(
        sink: Arc<dyn OutboundSink>,
        config: SendQueueConfig,
        executor: Arc<dyn Executor>,
    ) -> Self {
        Self::build(sink, config, Some(executor))
    }

    fn build(
        sink: Arc<dyn OutboundSink>,
        config: SendQueueConfig,
        executor: Option<Arc<dyn Executor>>,
    ) -> Self {
        let (tx, rx) = channel::bounded(config.capacity.max(1));
        Self {
            inner: Arc::new(Inner {
                sink,
                executor,
                thread_name: config.thread_name,
                tx,
                rx,
                running: AtomicBool::new(false),
                state: Mutex::new(WorkerState::default()),
                sent: AtomicU64::new(0),
                failed: AtomicU64::new(0),
            }),
        }
    }

    /// Spawn the worker and wait until it is running. A second call is a no-op.
    pub fn start(&self) -> Result<()> {
        let mut state = self
            .inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        if state.handle.is_some() {
            return Ok(());
        }

        let (ready_tx, ready_rx) = channel::bounded::<()>(1);
        let (shutdown_tx, shutdown_rx) = channel::bounded::<()>(0);
        let inner = Arc::clone(&self.inner);
        self.inner.running.store(true, Ordering::Release);

        let spawned = thread::Builder::new()
            .name(self.inner.thread_name.clone())
            .spawn(move || {
                let _ = ready_tx.send(());
                inner.run(shutdown_rx);
            });
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                self.inner.running.store(false, Ordering::Release);
                return Err(TransportError::Spawn {
                    name: self.inner.thread_name.clone(),
                    source,
                });
            }
        };

        if ready_rx.recv().is_err() {
            self.inner.running.store(false, Ordering::Release);
            return Err(TransportError::Shutdown);
        }
        state.handle = Some(handle);
        state.shutdown = Some(shutdown_tx);
        tracing::debug!(thread = %self.inner.thread_name, "send queue started");
        Ok(())
    }

    /// Stop the worker and drop everything still queued. Idempotent.
    pub fn stop(&self) {
        if !self.inner.running.swap(false, Ordering::AcqRel) {
            return;
        }
        let (handle, shutdown) = {
            let mut state = self
                .inner
                .state
                .lock()
                .unwrap_or_else(PoisonError::into_inner);
            (state.handle.take(), state.shutdown.take())
        };
        drop(shutdown);

        let cleared = self.inner.rx.try_iter().count();
        if let Some(handle) = handle {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
        tracing::debug!(thread = %self.inner.thread_name, cleared, "send queue stopped");
    }

    /// Queue a task without blocking.
    pub fn submit(&self, task: OutboundTask) -> bool {
        if !self.inner.running.load(Ordering::Acquire) {
            return false;
        }
        match self.inner.tx.try_send(task) {
            Ok(()) => true,
            Err(TrySendError::Full(task)) => {
                tracing::debug!(peer = %task.target, "send queue full, dropping task");
                false
            }
            Err(TrySendError::Disconnected(_)) => false,
        }
    }

    pub fn is_running(&self) -> bool {
        self.inner.running.load(Ordering::Acquire)
    }

    /// Tasks waiting for the worker.
    pub fn pending(&self) -> usize {
        self.inner.rx.len()
    }

    pub fn sent_count(&self) -> u64 {
        self.inner.sent.load(Ordering::Relaxed)
    }

    pub fn failed_count(&self) -> u64 {
        self.inner.failed.load(Ordering::Relaxed)
    }
}

impl fmt::Debug for SendQueue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SendQueue")
            .field("thread", &self.inner.thread_name)
            .field("running", &self.is_running())
            .field("pending", &self.pending())
            .finish()
    }
}
