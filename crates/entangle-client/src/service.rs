//! Client-side mirror of one subscribed service.
//!
//! The mirror holds every key the server chose to expose, either as data or
//! as a method stub. It is only ever changed by inbound responses: local
//! writes are sent to the server and show up once the server broadcasts
//! them back.
//!
//! Calls and fetches are correlated by [`CallId`]. Each registers a pending
//! entry before its request is sent; the entry is removed when the answer
//! arrives, when the deadline passes, or when the caller stops waiting.
//! Answers for unknown ids are dropped.
//!
//! A cached mirror keeps its values across a reconnect. Keys that the
//! resubscribe resync does not mention before `Ready` are pruned then, so
//! deletions made while disconnected still reach the mirror.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use entangle_core::{
    CallId, Codec, EntangleError, KeySelection, Request, Response, Result, ServiceId,
};
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tokio::sync::{oneshot, watch};
use tracing::{debug, warn};

use crate::adaptor::Adaptor;

/// One mirrored key.
#[derive(Clone, Debug, PartialEq)]
pub enum Member {
    /// Plain value.
    Data(Value),
    /// Remote method; invoke with [`Service::call`].
    Method,
}

/// Something that happened to a mirror.
#[derive(Clone, Debug, PartialEq)]
pub enum ServiceEvent {
    /// Initial synchronization finished.
    Ready,
    /// A key was written (`Some`) or deleted (`None`).
    Change {
        /// Affected key.
        key: String,
        /// New value.
        value: Option<Value>,
    },
    /// The server reported an out-of-band failure.
    Error(String),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum Readiness {
    Pending,
    Ready,
    Closed,
}

/// What a correlated response resolved to.
#[derive(Debug)]
enum Settled {
    Value(Value),
    Function,
    Deleted,
}

struct PendingCall {
    settle: oneshot::Sender<Result<Settled>>,
    issued_at: Instant,
    timeout: Duration,
}

type Listener = Arc<dyn Fn(&ServiceEvent) + Send + Sync>;

struct ListenerEntry {
    id: u64,
    once: bool,
    listener: Listener,
}

#[derive(Default)]
struct Mirror {
    target: BTreeMap<String, Member>,
    pending: HashMap<CallId, PendingCall>,
    listeners: Vec<ListenerEntry>,
    next_listener: u64,
    closed: bool,
    /// Keys seen since a cached reopen; `Some` until the next `Ready`.
    resynced: Option<BTreeSet<String>>,
}

impl Mirror {
    fn settle(&mut self, call_id: Option<CallId>, result: Result<Settled>) {
        let Some(call_id) = call_id else { return };
        match self.pending.remove(&call_id) {
            Some(pending) => {
                debug!(
                    call_id = %call_id,
                    elapsed_ms = pending.issued_at.elapsed().as_millis(),
                    "call settled"
                );
                let _ = pending.settle.send(result);
            }
            None => debug!(call_id = %call_id, "response for unknown call dropped"),
        }
    }

    fn mark_seen(&mut self, key: &str) {
        if let Some(seen) = self.resynced.as_mut() {
            let _ = seen.insert(key.to_owned());
        }
    }

    /// Drop keys the finished resync did not mention.
    fn prune_unseen(&mut self) -> Vec<ServiceEvent> {
        let Some(seen) = self.resynced.take() else {
            return Vec::new();
        };
        let stale: Vec<String> = self
            .target
            .keys()
            .filter(|key| !seen.contains(*key))
            .cloned()
            .collect();
        stale
            .into_iter()
            .map(|key| {
                let _ = self.target.remove(&key);
                debug!(key = %key, "pruned key missing from resync");
                ServiceEvent::Change { key, value: None }
            })
            .collect()
    }

    fn reject_all(&mut self, make: impl Fn() -> EntangleError) {
        for (_, pending) in self.pending.drain() {
            let _ = pending.settle.send(Err(make()));
        }
    }
}

pub(crate) struct ServiceInner {
    id: ServiceId,
    adaptor: Arc<Adaptor>,
    codec: Arc<Codec>,
    timeout: Duration,
    mirror: Mutex<Mirror>,
    ready: watch::Sender<Readiness>,
}

impl ServiceInner {
    /// Apply one inbound response and notify listeners.
    pub(crate) fn apply(&self, response: Response) {
        let events = {
            let mut mirror = self.mirror.lock();
            if mirror.closed {
                return;
            }
            match response {
                Response::Write {
                    key,
                    value,
                    call_id,
                    ..
                } => {
                    mirror.settle(call_id, Ok(Settled::Value(value.clone())));
                    mirror.mark_seen(&key);
                    let _ = mirror.target.insert(key.clone(), Member::Data(value.clone()));
                    vec![ServiceEvent::Change {
                        key,
                        value: Some(value),
                    }]
                }
                Response::AssignFunction { key, call_id, .. } => {
                    mirror.settle(call_id, Ok(Settled::Function));
                    mirror.mark_seen(&key);
                    let _ = mirror.target.insert(key, Member::Method);
                    Vec::new()
                }
                Response::Delete { key, call_id, .. } => {
                    mirror.settle(call_id, Ok(Settled::Deleted));
                    let _ = mirror.target.remove(&key);
                    vec![ServiceEvent::Change { key, value: None }]
                }
                Response::Ready { .. } => {
                    let mut events = mirror.prune_unseen();
                    let _ = self.ready.send_replace(Readiness::Ready);
                    events.push(ServiceEvent::Ready);
                    events
                }
                Response::CallResult { call_id, value, .. } => {
                    mirror.settle(Some(call_id), Ok(Settled::Value(value)));
                    Vec::new()
                }
                Response::CallError {
                    call_id, message, ..
                } => {
                    mirror.settle(Some(call_id), Err(EntangleError::RemoteCall { message }));
                    Vec::new()
                }
                Response::ServiceError { message, .. } => {
                    warn!(service_id = %self.id, message = %message, "service error");
                    vec![ServiceEvent::Error(message)]
                }
            }
        };
        for event in &events {
            self.emit(event);
        }
    }

    /// A fresh transport opened. Uncached mirrors start empty; cached ones
    /// keep their values and prune what the resync leaves out.
    pub(crate) fn on_open(&self, cached: bool) {
        let mut mirror = self.mirror.lock();
        if cached {
            mirror.resynced = Some(BTreeSet::new());
        } else {
            mirror.target.clear();
        }
    }

    /// The transport closed.
    pub(crate) fn on_close(&self, cached: bool) {
        let mut mirror = self.mirror.lock();
        if mirror.closed {
            return;
        }
        if !cached {
            mirror.target.clear();
        }
        mirror.reject_all(|| EntangleError::ConnectionLost);
        let _ = self.ready.send_replace(Readiness::Pending);
    }

    /// The service was unsubscribed.
    pub(crate) fn close(&self) {
        let mut mirror = self.mirror.lock();
        mirror.closed = true;
        mirror.listeners.clear();
        mirror.reject_all(|| EntangleError::Cancelled);
        let _ = self.ready.send_replace(Readiness::Closed);
    }

    fn emit(&self, event: &ServiceEvent) {
        let listeners: Vec<Listener> = {
            let mut mirror = self.mirror.lock();
            let snapshot = mirror
                .listeners
                .iter()
                .map(|entry| Arc::clone(&entry.listener))
                .collect();
            mirror.listeners.retain(|entry| !entry.once);
            snapshot
        };
        for listener in listeners {
            listener(event);
        }
    }

    fn add_listener(&self, once: bool, listener: Listener) -> u64 {
        let mut mirror = self.mirror.lock();
        mirror.next_listener += 1;
        let id = mirror.next_listener;
        mirror.listeners.push(ListenerEntry { id, once, listener });
        id
    }

    fn ensure_open(&self) -> Result<()> {
        if self.mirror.lock().closed {
            return Err(EntangleError::NotSubscribed {
                service_id: self.id.clone(),
            });
        }
        Ok(())
    }

    fn send(&self, request: &Request) -> Result<()> {
        self.ensure_open()?;
        let frame = self.codec.encode(request)?;
        self.adaptor.send(frame)
    }
}

/// Removes a pending entry when the waiting future finishes or is dropped.
struct PendingGuard<'a> {
    inner: &'a ServiceInner,
    call_id: CallId,
}

impl Drop for PendingGuard<'_> {
    fn drop(&mut self) {
        let _ = self.inner.mirror.lock().pending.remove(&self.call_id);
    }
}

/// Handle to one mirrored service. Cheap to clone.
#[derive(Clone)]
pub struct Service {
    inner: Arc<ServiceInner>,
}

impl Service {
    pub(crate) fn new(
        id: ServiceId,
        adaptor: Arc<Adaptor>,
        codec: Arc<Codec>,
        timeout: Duration,
    ) -> Self {
        let (ready, _) = watch::channel(Readiness::Pending);
        Self {
            inner: Arc::new(ServiceInner {
                id,
                adaptor,
                codec,
                timeout,
                mirror: Mutex::new(Mirror::default()),
                ready,
            }),
        }
    }

    pub(crate) fn inner(&self) -> &ServiceInner {
        &self.inner
    }

    /// Service id.
    pub fn id(&self) -> &ServiceId {
        &self.inner.id
    }

    /// Default call deadline.
    pub fn timeout(&self) -> Duration {
        self.inner.timeout
    }

    /// Value of a data key.
    pub fn get(&self, key: &str) -> Option<Value> {
        match self.inner.mirror.lock().target.get(key) {
            Some(Member::Data(value)) => Some(value.clone()),
            _ => None,
        }
    }

    /// The mirrored member under `key`.
    pub fn member(&self, key: &str) -> Option<Member> {
        self.inner.mirror.lock().target.get(key).cloned()
    }

    /// Whether `key` is mirrored at all.
    pub fn contains(&self, key: &str) -> bool {
        self.inner.mirror.lock().target.contains_key(key)
    }

    /// Whether `key` is a remote method.
    pub fn is_method(&self, key: &str) -> bool {
        matches!(self.inner.mirror.lock().target.get(key), Some(Member::Method))
    }

    /// Every mirrored key, data and methods, sorted.
    pub fn keys(&self) -> Vec<String> {
        self.inner.mirror.lock().target.keys().cloned().collect()
    }

    /// Data keys and their values.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.inner
            .mirror
            .lock()
            .target
            .iter()
            .filter_map(|(key, member)| match member {
                Member::Data(value) => Some((key.clone(), value.clone())),
                Member::Method => None,
            })
            .collect()
    }

    /// Data keys exposed by `selection`, for building narrower views.
    pub fn snapshot_selected(&self, selection: &KeySelection) -> Map<String, Value> {
        self.snapshot()
            .into_iter()
            .filter(|(key, _)| selection.is_exposed(key))
            .collect()
    }

    /// Write `value` through to the server.
    ///
    /// The mirror changes when the server broadcasts the write back. A
    /// refused write is answered with the authoritative value instead.
    pub fn set(&self, key: impl Into<String>, value: impl Into<Value>) -> Result<()> {
        let key = key.into();
        if self.is_method(&key) {
            return Err(EntangleError::InvalidAssignment { key });
        }
        self.inner.send(&Request::Write {
            service_id: self.inner.id.clone(),
            key,
            value: value.into(),
        })
    }

    /// Assign a member. Only data can be assigned; methods are defined by
    /// the server.
    pub fn assign(&self, key: impl Into<String>, member: Member) -> Result<()> {
        let key = key.into();
        match member {
            Member::Data(value) => self.set(key, value),
            Member::Method => Err(EntangleError::InvalidAssignment { key }),
        }
    }

    /// Ask the server to delete a data key.
    pub fn delete(&self, key: impl Into<String>) -> Result<()> {
        let key = key.into();
        if self.is_method(&key) {
            return Err(EntangleError::InvalidAssignment { key });
        }
        self.inner.send(&Request::Delete {
            service_id: self.inner.id.clone(),
            key,
        })
    }

    /// Invoke a remote method with the default deadline.
    pub async fn call(&self, method: &str, args: Vec<Value>) -> Result<Value> {
        self.call_with_timeout(method, args, self.inner.timeout).await
    }

    /// Invoke a remote method.
    pub async fn call_with_timeout(
        &self,
        method: &str,
        args: Vec<Value>,
        timeout: Duration,
    ) -> Result<Value> {
        let call_id = CallId::generate();
        let request = Request::Call {
            service_id: self.inner.id.clone(),
            call_id: call_id.clone(),
            method: method.to_owned(),
            args,
        };
        match self.request(call_id, &request, timeout).await? {
            Settled::Value(value) => Ok(value),
            Settled::Function | Settled::Deleted => Ok(Value::Null),
        }
    }

    /// Stub bound to one method name.
    pub fn method(&self, name: impl Into<String>) -> MethodStub {
        MethodStub {
            service: self.clone(),
            name: name.into(),
        }
    }

    /// Re-read one key from the server. The mirror is updated as well.
    ///
    /// Resolves to `None` when the key no longer exists.
    pub async fn fetch(&self, key: &str) -> Result<Option<Member>> {
        let call_id = CallId::generate();
        let request = Request::Read {
            service_id: self.inner.id.clone(),
            key: key.to_owned(),
            call_id: Some(call_id.clone()),
        };
        Ok(match self.request(call_id, &request, self.inner.timeout).await? {
            Settled::Value(value) => Some(Member::Data(value)),
            Settled::Function => Some(Member::Method),
            Settled::Deleted => None,
        })
    }

    async fn request(
        &self,
        call_id: CallId,
        request: &Request,
        timeout: Duration,
    ) -> Result<Settled> {
        self.inner.ensure_open()?;
        let frame = self.inner.codec.encode(request)?;

        let (settle, rx) = oneshot::channel();
        let _ = self.inner.mirror.lock().pending.insert(
            call_id.clone(),
            PendingCall {
                settle,
                issued_at: Instant::now(),
                timeout,
            },
        );
        let _guard = PendingGuard {
            inner: &self.inner,
            call_id: call_id.clone(),
        };

        // Registered first so an immediate answer finds its entry.
        self.inner.adaptor.send(frame)?;

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(result)) => result,
            Ok(Err(_)) => Err(EntangleError::Cancelled),
            Err(_) => {
                debug!(service_id = %self.inner.id, call_id = %call_id, ?timeout, "call timed out");
                Err(EntangleError::Timeout)
            }
        }
    }

    /// Whether the initial synchronization has finished.
    pub fn is_ready(&self) -> bool {
        *self.inner.ready.borrow() == Readiness::Ready
    }

    /// Wait for the next `Ready`. Fails with `Cancelled` once unsubscribed.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut rx = self.inner.ready.subscribe();
        let state = *rx
            .wait_for(|state| *state != Readiness::Pending)
            .await
            .map_err(|_| EntangleError::Cancelled)?;
        match state {
            Readiness::Closed => Err(EntangleError::Cancelled),
            Readiness::Ready | Readiness::Pending => Ok(()),
        }
    }

    /// Register a listener for every event.
    ///
    /// Listeners run on the client's dispatcher task, in arrival order.
    pub fn on<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        let id = self.inner.add_listener(false, Arc::new(listener));
        self.handle(id)
    }

    /// Register a listener for the next event only.
    pub fn once<F>(&self, listener: F) -> ListenerHandle
    where
        F: Fn(&ServiceEvent) + Send + Sync + 'static,
    {
        let id = self.inner.add_listener(true, Arc::new(listener));
        self.handle(id)
    }

    fn handle(&self, id: u64) -> ListenerHandle {
        ListenerHandle {
            inner: Arc::downgrade(&self.inner),
            id,
        }
    }

    /// Calls and fetches still waiting for an answer.
    pub fn pending_calls(&self) -> usize {
        self.inner.mirror.lock().pending.len()
    }

    /// Deadline of the oldest pending call, if any.
    pub fn next_deadline(&self) -> Option<Instant> {
        self.inner
            .mirror
            .lock()
            .pending
            .values()
            .map(|p| p.issued_at + p.timeout)
            .min()
    }

    /// Whether the service is still subscribed.
    pub fn is_subscribed(&self) -> bool {
        !self.inner.mirror.lock().closed
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let mirror = self.inner.mirror.lock();
        f.debug_struct("Service")
            .field("id", &self.inner.id)
            .field("keys", &mirror.target.len())
            .field("pending", &mirror.pending.len())
            .field("closed", &mirror.closed)
            .finish_non_exhaustive()
    }
}

/// Returned by [`Service::on`] and [`Service::once`].
#[derive(Debug)]
pub struct ListenerHandle {
    inner: Weak<ServiceInner>,
    id: u64,
}

impl ListenerHandle {
    /// Stop listening. Returns `false` if the listener was already gone.
    pub fn remove(self) -> bool {
        let Some(inner) = self.inner.upgrade() else {
            return false;
        };
        let mut mirror = inner.mirror.lock();
        let before = mirror.listeners.len();
        mirror.listeners.retain(|entry| entry.id != self.id);
        mirror.listeners.len() != before
    }
}

/// A remote method bound to its service.
#[derive(Clone, Debug)]
pub struct MethodStub {
    service: Service,
    name: String,
}

impl MethodStub {
    /// Method name.
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Invoke the method.
    pub async fn call(&self, args: Vec<Value>) -> Result<Value> {
        self.service.call(&self.name, args).await
    }
}
