use std::sync::{Arc, Mutex, PoisonError};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use crossbeam::channel::{self, RecvTimeoutError, Sender};

use crate::clock::Clock;
use crate::error::{Result, SessionError};
use crate::registry::SessionRegistry;

/// Background thread running [`SessionRegistry::sweep`] at a fixed interval.
pub struct Sweeper {
    stop_tx: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Sweeper {
    pub fn spawn(
        registry: Arc<SessionRegistry>,
        clock: Arc<dyn Clock>,
        interval: Duration,
    ) -> Result<Self> {
        if interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "sweep interval must be non-zero".into(),
            ));
        }

        let (stop_tx, stop_rx) = channel::bounded::<()>(0);
        let name = "devgate-sweeper".to_string();
        let handle = thread::Builder::new()
            .name(name.clone())
            .spawn(move || loop {
                match stop_rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {
                        let expired = registry.sweep(clock.now_millis());
                        if expired > 0 {
                            tracing::debug!(expired, remaining = registry.len(), "sweep finished");
                        }
                    }
                    _ => break,
                }
            })
            .map_err(|source| SessionError::Spawn { name, source })?;

        Ok(Self {
            stop_tx: Mutex::new(Some(stop_tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Stop the thread and wait for it. A second call is a no-op.
    pub fn stop(&self) {
        drop(
            self.stop_tx
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .take(),
        );
        if let Some(handle) = self
            .handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
        {
            if handle.thread().id() != thread::current().id() {
                let _ = handle.join();
            }
        }
    }

    pub fn is_running(&self) -> bool {
        self.handle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .as_ref()
            .is_some_and(|handle| !handle.is_finished())
    }
}

impl Drop for Sweeper {
    fn drop(&mut self) {
        self.stop();
    }
}
