//! TCP stream transport: one reader thread and one send queue per
//! connection, with frames recovered by [`StreamDecoder`].

use std::io::{ErrorKind, Read};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use devgate_frame::{StreamDecoder, MAX_FRAME_LEN};

use crate::channel::{HandlerFactory, Link};
use crate::error::{Result, TransportError};
use crate::sender::{OutboundTask, SendQueue, SendQueueConfig};
use crate::socket::{bind_tcp, SocketConfig};
use crate::unknown::{self, UnknownPacketHandler, UnknownReason};

const READ_CHUNK_SIZE: usize = 8 * 1024;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TcpConfig {
    pub max_frame_len: usize,
    pub unknown_sample_len: usize,
    /// Sleep between non-blocking accept attempts.
    pub accept_poll: Duration,
    pub socket: SocketConfig,
    pub send: SendQueueConfig,
}

impl Default for TcpConfig {
    fn default() -> Self {
        Self {
            max_frame_len: MAX_FRAME_LEN,
            unknown_sample_len: 32,
            accept_poll: Duration::from_millis(50),
            socket: SocketConfig::default(),
            send: SendQueueConfig {
                capacity: 256,
                thread_name: "devgate-tcp-send".to_string(),
            },
        }
    }
}

/// One accepted TCP connection.
pub struct TcpLink {
    id: u64,
    remote: SocketAddr,
    stream: Arc<TcpStream>,
    open: AtomicBool,
    sender: SendQueue,
}

impl Link for TcpLink {
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
        if self.open.swap(false, Ordering::AcqRel) {
            let _ = self.stream.shutdown(Shutdown::Both);
            self.sender.stop();
            tracing::debug!(connection = self.id, peer = %self.remote, "tcp connection closed");
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::Acquire)
    }
}

struct Shared {
    config: TcpConfig,
    listener: TcpListener,
    local_addr: SocketAddr,
    factory: Arc<dyn HandlerFactory>,
    unknown: Arc<dyn UnknownPacketHandler>,
    connections: DashMap<u64, Arc<TcpLink>>,
    readers: Mutex<Vec<JoinHandle<()>>>,
    next_id: AtomicU64,
    running: AtomicBool,
}

impl Shared {
    fn accept_loop(self: &Arc<Self>) {
        while self.running.load(Ordering::Acquire) {
            match self.listener.accept() {
                Ok((stream, remote)) => {
                    if let Err(err) = self.serve(stream, remote) {
                        tracing::warn!(peer = %remote, error = %err, "failed to start tcp connection");
                    }
                }
                Err(err) if err.kind() == ErrorKind::WouldBlock => {
                    thread::sleep(self.config.accept_poll);
                }
                Err(err) => {
                    tracing::warn!(addr = %self.local_addr, error = %err, "tcp accept failed");
                    thread::sleep(self.config.accept_poll);
                }
            }
        }
    }

    fn serve(self: &Arc<Self>, stream: TcpStream, remote: SocketAddr) -> Result<()> {
        stream.set_nonblocking(false)?;
        stream.set_read_timeout(Some(self.config.socket.read_timeout))?;
        stream.set_nodelay(true)?;

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let writer = Arc::new(stream.try_clone()?);
        let sender = SendQueue::new(
            writer.clone(),
            SendQueueConfig {
                thread_name: format!("{}-{id}", self.config.send.thread_name),
                ..self.config.send.clone()
            },
        );
        sender.start()?;
        let link = Arc::new(TcpLink {
            id,
            remote,
            stream: writer,
            open: AtomicBool::new(true),
            sender,
        });
        self.connections.insert(id, Arc::clone(&link));

        let shared = Arc::clone(self);
        let name = format!("devgate-tcp-{id}");
        let spawned = thread::Builder::new()
            .name(name.clone())
            .spawn(move || shared.connection_loop(link, stream));
        let handle = match spawned {
            Ok(handle) => handle,
            Err(source) => {
                if let Some((_, link)) = self.connections.remove(&id) {
                    link.close();
                }
                return Err(TransportError::Spawn { name, source });
            }
        };

        let mut readers = self.readers.lock().unwrap_or_else(PoisonError::into_inner);
        readers.retain(|reader| !reader.is_finished());
        readers.push(handle);
        tracing::debug!(connection = id, peer = %remote, "tcp connection accepted");
        Ok(())
    }

    fn connection_loop(&self, link: Arc<TcpLink>, mut stream: TcpStream) {
        let dyn_link: Arc<dyn Link> = link.clone();
        let mut handler = self.factory.create(&dyn_link);
        handler.on_open(&dyn_link);

        let unknown = Arc::clone(&self.unknown);
        let remote = link.remote;
        let sample_len = self.config.unknown_sample_len;
        let mut decoder = StreamDecoder::device_protocol(self.config.max_frame_len).with_discard_hook(
            Box::new(move |bytes: &[u8]| {
                unknown::report(unknown.as_ref(), remote, UnknownReason::Discarded, bytes, sample_len)
            }),
        );

        let mut chunk = [0u8; READ_CHUNK_SIZE];
        while link.is_open() && self.running.load(Ordering::Acquire) {
            let read = match stream.read(&mut chunk) {
                Ok(0) => break,
                Ok(n) => n,
                Err(err)
                    if matches!(
                        err.kind(),
                        ErrorKind::WouldBlock | ErrorKind::TimedOut | ErrorKind::Interrupted
                    ) =>
                {
                    continue
                }
                Err(err) => {
                    tracing::debug!(connection = link.id, peer = %remote, error = %err, "tcp read failed");
                    break;
                }
            };
            for frame in decoder.feed(&chunk[..read]) {
                let result =
                    panic::catch_unwind(AssertUnwindSafe(|| handler.on_frame(&dyn_link, frame)));
                if result.is_err() {
                    tracing::error!(connection = link.id, peer = %remote, "connection handler panicked");
                }
            }
        }

        link.close();
        handler.on_close(&dyn_link);
        self.connections.remove(&link.id);
    }
}

/// Accepts TCP connections and serves each on its own thread.
pub struct TcpAcceptor {
    shared: Arc<Shared>,
    accept_thread: Mutex<Option<JoinHandle<()>>>,
}

impl TcpAcceptor {
    pub fn bind(
        addr: SocketAddr,
        config: TcpConfig,
        factory: Arc<dyn HandlerFactory>,
        unknown: Arc<dyn UnknownPacketHandler>,
    ) -> Result<Self> {
        let listener = bind_tcp(addr, &config.socket)?;
        listener.set_nonblocking(true)?;
        let local_addr = listener.local_addr()?;

        let shared = Arc::new(Shared {
            config,
            listener,
            local_addr,
            factory,
            unknown,
            connections: DashMap::new(),
            readers: Mutex::new(Vec::new()),
            next_id: AtomicU64::new(1),
            running: AtomicBool::new(true),
        });

        let accept_shared = Arc::clone(&shared);
        let name = "devgate-tcp-accept".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || accept_shared.accept_loop())
            .map_err(|source| TransportError::Spawn { name, source })?;
        tracing::info!(addr = %local_addr, "tcp acceptor listening");

        Ok(Self {
            shared,
            accept_thread: Mutex::new(Some(handle)),
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.shared.local_addr
    }

    pub fn connection_count(&self) -> usize {
        self.shared.connections.len()
    }

    /// Stop accepting, close every connection and wait for reader threads.
    pub fn shutdown(&self) {
        if !self.shared.running.swap(false, Ordering::AcqRel) {
            return;
        }
        if let Some(handle) = self
            .accept_thread
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            let _ = handle.join();
        }

        let open: Vec<Arc<TcpLink>> = self
            .shared
            .connections
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect();
        for link in &open {
            link.close();
        }

        let readers = std::mem::take(
            &mut *self
                .shared
                .readers
                .lock()
                .unwrap_or_else(PoisonError::into_inner),
        );
        let current = thread::current().id();
        for reader in readers {
            if reader.thread().id() != current {
                let _ = reader.join();
            }
        }
        tracing::info!(addr = %self.shared.local_addr, closed = open.len(), "tcp acceptor shut down");
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.shutdown();
    }
}
