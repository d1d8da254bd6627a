//! Device-id keyed session table with add/remove notifications.

use std::panic::{self, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use dashmap::DashMap;
use devgate_frame::DeviceId;

use crate::error::{Result, SessionError};
use crate::session::DeviceSession;

/// Observes session additions and removals.
///
/// Called after the change is visible in the registry, while registry
/// mutations are held off, so listeners observe changes in registry order.
/// Listeners may read the registry but must not mutate it. Panics are
/// caught and logged; they never abort a put or a sweep.
pub trait SessionListener: Send + Sync {
    /// `previous` is the session this one replaced, if any.
    fn on_addition(
        &self,
        id: DeviceId,
        session: &Arc<DeviceSession>,
        previous: Option<&Arc<DeviceSession>>,
    );

    fn on_removal(&self, id: DeviceId, session: &Arc<DeviceSession>);
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RegistryConfig {
    /// Sessions silent this long are removed by the sweep.
    pub expiry_window: Duration,
    pub sweep_interval: Duration,
}

impl Default for RegistryConfig {
    fn default() -> Self {
        Self {
            expiry_window: Duration::from_secs(180),
            sweep_interval: Duration::from_secs(10),
        }
    }
}

impl RegistryConfig {
    pub fn validate(&self) -> Result<()> {
        if self.expiry_window.is_zero() || self.sweep_interval.is_zero() {
            return Err(SessionError::InvalidConfig(
                "expiry_window and sweep_interval must be non-zero".into(),
            ));
        }
        Ok(())
    }
}

/// At most one session per device id.
pub struct SessionRegistry {
    config: RegistryConfig,
    sessions: DashMap<DeviceId, Arc<DeviceSession>>,
    listeners: Vec<Arc<dyn SessionListener>>,
    /// Held across each mutation and its notifications.
    mutations: Mutex<()>,
}

impl SessionRegistry {
    pub fn new(config: RegistryConfig) -> Self {
        Self {
            config,
            sessions: DashMap::new(),
            listeners: Vec::new(),
            mutations: Mutex::new(()),
        }
    }

    pub fn with_listener(mut self, listener: Arc<dyn SessionListener>) -> Self {
        self.listeners.push(listener);
        self
    }

    pub fn config(&self) -> &RegistryConfig {
        &self.config
    }

    pub fn get(&self, id: DeviceId) -> Option<Arc<DeviceSession>> {
        self.sessions.get(&id).map(|entry| Arc::clone(entry.value()))
    }

    /// Install `session`, replacing any session for the same device.
    ///
    /// Fires `on_removal(old)` then `on_addition(new, old)`.
    pub fn put(&self, session: Arc<DeviceSession>) -> Option<Arc<DeviceSession>> {
        let id = session.device_id();
        let _serial = self.serialize();
        let previous = self.sessions.insert(id, Arc::clone(&session));
        if let Some(old) = previous.as_ref().filter(|old| !Arc::ptr_eq(old, &session)) {
            tracing::debug!(device = %id, old_peer = %old.link().remote_addr(), new_peer = %session.link().remote_addr(), "session replaced");
            self.notify_removal(id, old);
        }
        self.notify_addition(id, &session, previous.as_ref());
        previous
    }

    pub fn remove(&self, id: DeviceId) -> Option<Arc<DeviceSession>> {
        let _serial = self.serialize();
        let (_, removed) = self.sessions.remove(&id)?;
        self.notify_removal(id, &removed);
        Some(removed)
    }

    /// Remove the entry for `id` only if it is still `session`.
    pub fn remove_if_same(&self, id: DeviceId, session: &Arc<DeviceSession>) -> bool {
        let _serial = self.serialize();
        match self
            .sessions
            .remove_if(&id, |_, current| Arc::ptr_eq(current, session))
        {
            Some((_, removed)) => {
                self.notify_removal(id, &removed);
                true
            }
            None => false,
        }
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<DeviceSession>> {
        self.sessions
            .iter()
            .map(|entry| Arc::clone(entry.value()))
            .collect()
    }

    /// Remove every session silent for at least the expiry window.
    ///
    /// Candidates are collected first; each is then removed only if it is
    /// still the registered instance and still expired.
    pub fn sweep(&self, now_millis: u64) -> usize {
        let window = self.config.expiry_window.as_millis() as u64;
        let candidates: Vec<Arc<DeviceSession>> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired(now_millis, window))
            .map(|entry| Arc::clone(entry.value()))
            .collect();

        let mut removed = 0;
        for candidate in candidates {
            let id = candidate.device_id();
            let _serial = self.serialize();
            let evicted = self.sessions.remove_if(&id, |_, current| {
                Arc::ptr_eq(current, &candidate) && current.is_expired(now_millis, window)
            });
            if let Some((_, session)) = evicted {
                removed += 1;
                tracing::info!(
                    device = %id,
                    idle_ms = now_millis.saturating_sub(session.last_received()),
                    "session expired"
                );
                self.notify_removal(id, &session);
            }
        }
        removed
    }

    fn serialize(&self) -> MutexGuard<'_, ()> {
        self.mutations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn notify_addition(
        &self,
        id: DeviceId,
        session: &Arc<DeviceSession>,
        previous: Option<&Arc<DeviceSession>>,
    ) {
        for listener in &self.listeners {
            let outcome = panic::catch_unwind(AssertUnwindSafe(|| {
                listener.on_addition(id, session, previous)
            }));
            if outcome.is_err() {
                tracing::error!(device = %id, "session listener panicked on addition");
            }
        }
    }

    fn notify_removal(&self, id: DeviceId, session: &Arc<DeviceSession>) {
        for listener in &self.listeners {
            let outcome =
                panic::catch_unwind(AssertUnwindSafe(|| listener.on_removal(id, session)));
            if outcome.is_err() {
                tracing::error!(device = %id, "session listener panicked on removal");
            }
        }
    }
}

impl std::fmt::Debug for SessionRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionRegistry")
            .field("config", &self.config)
            .field("sessions", &self.sessions.len())
            .field("listeners", &self.listeners.len())
            .finish()
    }
}
