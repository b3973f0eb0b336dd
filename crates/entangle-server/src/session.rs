//! Server-side bookkeeping for one accepted connection.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Instant;

use bytes::Bytes;
use entangle_core::{ServiceId, SessionId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::store::Service;

struct Subscriptions {
    closed: bool,
    services: HashMap<ServiceId, Weak<Service>>,
}

/// One connection: its outbound frame queue and the services it mirrors.
///
/// A session links itself to a service only through
/// [`Registry`](crate::registry::Registry) operations, which keep the
/// service's client set and this subscription list in step.
pub struct Session {
    id: SessionId,
    tx: mpsc::Sender<Bytes>,
    subscriptions: Mutex<Subscriptions>,
    cancel: CancellationToken,
    dropped_frames: AtomicU64,
    connected_at: Instant,
}

impl Session {
    pub(crate) fn new(id: SessionId, tx: mpsc::Sender<Bytes>) -> Self {
        Self {
            id,
            tx,
            subscriptions: Mutex::new(Subscriptions {
                closed: false,
                services: HashMap::new(),
            }),
            cancel: CancellationToken::new(),
            dropped_frames: AtomicU64::new(0),
            connected_at: Instant::now(),
        }
    }

    /// Session id.
    pub fn id(&self) -> &SessionId {
        &self.id
    }

    /// Queue a frame for the connection's writer.
    ///
    /// Returns `false` if the queue is full or the writer is gone.
    pub fn send(&self, frame: Bytes) -> bool {
        if self.is_closed() {
            return false;
        }
        if self.tx.try_send(frame).is_ok() {
            true
        } else {
            let _ = self.dropped_frames.fetch_add(1, Ordering::Relaxed);
            false
        }
    }

    /// Frames that could not be queued.
    pub fn drop_count(&self) -> u64 {
        self.dropped_frames.load(Ordering::Relaxed)
    }

    /// Ask the connection driver to tear the socket down.
    pub fn force_close(&self) {
        self.cancel.cancel();
    }

    /// Whether [`force_close`](Self::force_close) was called.
    pub fn is_closed(&self) -> bool {
        self.cancel.is_cancelled()
    }

    /// Token cancelled when the session is force-closed.
    pub fn close_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Services this session currently mirrors.
    pub fn subscriptions(&self) -> Vec<ServiceId> {
        self.subscriptions.lock().services.keys().cloned().collect()
    }

    /// Whether this session mirrors `service_id`.
    pub fn is_subscribed(&self, service_id: &ServiceId) -> bool {
        self.subscriptions.lock().services.contains_key(service_id)
    }

    /// Time since the connection was accepted.
    pub fn age(&self) -> std::time::Duration {
        self.connected_at.elapsed()
    }

    /// Record a subscription. Fails once the session has been torn down.
    pub(crate) fn link(&self, service_id: ServiceId, service: Weak<Service>) -> bool {
        let mut subs = self.subscriptions.lock();
        if subs.closed {
            return false;
        }
        let _ = subs.services.insert(service_id, service);
        true
    }

    pub(crate) fn unlink(&self, service_id: &ServiceId) {
        let _ = self.subscriptions.lock().services.remove(service_id);
    }

    /// Mark the session closed and hand back every linked service.
    pub(crate) fn drain(&self) -> Vec<Arc<Service>> {
        let mut subs = self.subscriptions.lock();
        subs.closed = true;
        subs.services
            .drain()
            .filter_map(|(_, weak)| weak.upgrade())
            .collect()
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("id", &self.id)
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}
