use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use devgate_frame::DeviceId;
use devgate_transport::Link;

const NO_SEQUENCE: u64 = u64::MAX;

/// Liveness state for one device, bound to the link it last spoke on.
pub struct DeviceSession {
    device_id: DeviceId,
    link: Arc<dyn Link>,
    last_sequence: AtomicU64,
    last_received: AtomicU64,
    online_since: u64,
}

impl DeviceSession {
    pub fn new(device_id: DeviceId, link: Arc<dyn Link>, now_millis: u64) -> Self {
        Self {
            device_id,
            link,
            last_sequence: AtomicU64::new(NO_SEQUENCE),
            last_received: AtomicU64::new(now_millis),
            online_since: now_millis,
        }
    }

    pub fn device_id(&self) -> DeviceId {
        self.device_id
    }

    pub fn link(&self) -> &Arc<dyn Link> {
        &self.link
    }

    pub fn last_sequence(&self) -> Option<u32> {
        match self.last_sequence.load(Ordering::Acquire) {
            NO_SEQUENCE => None,
            seq => Some(seq as u32),
        }
    }

    pub fn last_received(&self) -> u64 {
        self.last_received.load(Ordering::Acquire)
    }

    pub fn online_since(&self) -> u64 {
        self.online_since
    }

    /// Record `seq` and the receive time; returns the previous sequence.
    ///
    /// Out-of-order sequences are recorded as-is.
    pub fn refresh(&self, seq: u32, now_millis: u64) -> Option<u32> {
        self.last_received.store(now_millis, Ordering::Release);
        match self.last_sequence.swap(u64::from(seq), Ordering::AcqRel) {
            NO_SEQUENCE => None,
            previous => Some(previous as u32),
        }
    }

    pub fn touch(&self, now_millis: u64) {
        self.last_received.store(now_millis, Ordering::Release);
    }

    pub fn is_expired(&self, now_millis: u64, window_millis: u64) -> bool {
        now_millis.saturating_sub(self.last_received()) >= window_millis
    }

    /// True if this session is bound to exactly `link`.
    pub fn is_bound_to(&self, link: &Arc<dyn Link>) -> bool {
        std::ptr::addr_eq(Arc::as_ptr(&self.link), Arc::as_ptr(link))
    }
}

impl fmt::Debug for DeviceSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DeviceSession")
            .field("device_id", &self.device_id)
            .field("remote", &self.link.remote_addr())
            .field("last_sequence", &self.last_sequence())
            .field("last_received", &self.last_received())
            .field("online_since", &self.online_since)
            .finish()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::net::SocketAddr;
    use std::sync::atomic::AtomicBool;
    use std::sync::Mutex;

    use bytes::Bytes;

    use super::*;

    /// In-memory link that records writes.
    pub(crate) struct MemoryLink {
        pub id: u64,
        pub remote: SocketAddr,
        pub open: AtomicBool,
        pub written: Mutex<Vec<Bytes>>,
    }

    impl MemoryLink {
        pub(crate) fn new(id: u64) -> Arc<Self> {
            Arc::new(Self {
                id,
                remote: SocketAddr::from(([10, 0, 0, id as u8], 9000)),
                open: AtomicBool::new(true),
                written: Mutex::new(Vec::new()),
            })
        }

        pub(crate) fn take_written(&self) -> Vec<Bytes> {
            std::mem::take(&mut *self.written.lock().unwrap())
        }
    }

    impl Link for MemoryLink {
        fn id(&self) -> u64 {
            self.id
        }

        fn remote_addr(&self) -> SocketAddr {
            self.remote
        }

        fn write(&self, payload: Bytes) -> bool {
            if !self.is_open() {
                return false;
            }
            self.written.lock().unwrap().push(payload);
            true
        }

        fn close(&self) {
            self.open.store(false, Ordering::SeqCst);
        }

        fn is_open(&self) -> bool {
            self.open.load(Ordering::SeqCst)
        }
    }
}
