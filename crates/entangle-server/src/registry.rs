//! Service registry and per-connection dispatch.
//!
//! The registry owns every registered [`Service`] and every live
//! [`Session`]. Connection drivers call [`Registry::accept`] once, feed each
//! inbound frame to [`Registry::handle_frame`] in arrival order, and call
//! [`Registry::close_session`] when the socket goes away.
//!
//! Requests for an id that is not registered are ignored. Unregistering a
//! service sends nothing to its subscribers; they simply stop receiving
//! updates for it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use dashmap::DashMap;
use entangle_core::{Codec, ExposeOptions, Request, Response, ServiceId, SessionId};
use metrics::{counter, gauge};
use parking_lot::RwLock;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::config::ServerConfig;
use crate::handler;
use crate::metrics::{REQUESTS_TOTAL, SESSIONS_ACTIVE};
use crate::object::Object;
use crate::session::Session;
use crate::store::{Service, Store};

/// Registered services and connected sessions.
pub struct Registry {
    services: RwLock<HashMap<ServiceId, Arc<Service>>>,
    sessions: DashMap<SessionId, Arc<Session>>,
    codec: Arc<Codec>,
    send_queue: usize,
    call_timeout: Duration,
}

impl Registry {
    /// Create an empty registry using the limits and codec in `config`.
    pub fn new(config: &ServerConfig) -> Self {
        Self {
            services: RwLock::new(HashMap::new()),
            sessions: DashMap::new(),
            codec: Arc::new(Codec::new(config.codec.clone())),
            send_queue: config.max_send_queue.max(1),
            call_timeout: config.call_timeout(),
        }
    }

    /// Codec used for every frame.
    pub fn codec(&self) -> &Codec {
        &self.codec
    }

    /// Register `object` under `id` and return its store.
    ///
    /// Permissions are resolved now from `options` and never recomputed.
    /// A service already registered under `id` is replaced; its subscribers
    /// stop receiving updates.
    pub fn register(
        &self,
        id: impl Into<ServiceId>,
        object: Object,
        options: ExposeOptions,
    ) -> Store {
        let id = id.into();
        let service = Arc::new(Service::new(
            id.clone(),
            object,
            options,
            Arc::clone(&self.codec),
        ));
        let previous = self.services.write().insert(id.clone(), Arc::clone(&service));
        if let Some(previous) = previous {
            warn!(service_id = %id, "replacing registered service");
            previous.clear_clients();
        }
        info!(service_id = %id, "service registered");
        Store::new(service)
    }

    /// Register the output of `view(object)` instead of `object` itself.
    ///
    /// Members the view leaves out do not exist as far as clients are
    /// concerned, whatever the permission options say.
    pub fn register_with_view<F>(
        &self,
        id: impl Into<ServiceId>,
        object: Object,
        view: F,
        options: ExposeOptions,
    ) -> Store
    where
        F: FnOnce(Object) -> Object,
    {
        self.register(id, view(object), options)
    }

    /// Remove a service. Its subscribers are not notified.
    pub fn unregister(&self, id: &str) -> bool {
        let Some(service) = self.services.write().remove(id) else {
            return false;
        };
        service.clear_clients();
        info!(service_id = %id, "service unregistered");
        true
    }

    /// Store for a registered service.
    pub fn store(&self, id: &str) -> Option<Store> {
        self.services.read().get(id).cloned().map(Store::new)
    }

    /// Registered ids, sorted.
    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.services.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Number of registered services.
    pub fn service_count(&self) -> usize {
        self.services.read().len()
    }

    /// Number of live sessions.
    pub fn session_count(&self) -> usize {
        self.sessions.len()
    }

    /// Create a session for a new connection.
    ///
    /// The receiver yields encoded frames for the connection's writer.
    pub fn accept(&self) -> (Arc<Session>, mpsc::Receiver<Bytes>) {
        let (tx, rx) = mpsc::channel(self.send_queue);
        let session = Arc::new(Session::new(SessionId::generate(), tx));
        let _ = self
            .sessions
            .insert(session.id().clone(), Arc::clone(&session));
        gauge!(SESSIONS_ACTIVE).increment(1.0);
        info!(session_id = %session.id(), "session opened");
        (session, rx)
    }

    /// Decode and apply one inbound frame.
    ///
    /// Must run inside a Tokio runtime: calls are spawned onto their own
    /// task. An undecodable frame closes the session.
    pub fn handle_frame(&self, session: &Arc<Session>, frame: &[u8]) {
        match self.codec.decode::<Request>(frame) {
            Ok(request) => self.handle_request(session, request),
            Err(err) => {
                warn!(
                    session_id = %session.id(),
                    error = %err,
                    "undecodable frame, closing session"
                );
                let notice = Response::ServiceError {
                    service_id: ServiceId::from(""),
                    message: format!("malformed frame: {err}"),
                };
                if let Ok(frame) = self.codec.encode(&notice) {
                    let _ = session.send(frame);
                }
                session.force_close();
                self.close_session(session);
            }
        }
    }

    /// Apply one decoded request.
    pub fn handle_request(&self, session: &Arc<Session>, request: Request) {
        if session.is_closed() {
            return;
        }
        counter!(REQUESTS_TOTAL, "op" => request.op_name()).increment(1);
        let service = self.services.read().get(request.service_id()).cloned();
        let Some(service) = service else {
            debug!(
                session_id = %session.id(),
                service_id = %request.service_id(),
                op = request.op_name(),
                "request for unknown service ignored"
            );
            return;
        };
        handler::dispatch(&service, session, request, self.call_timeout);
    }

    /// Tear a session down and unlink it from every service it mirrors.
    ///
    /// Idempotent.
    pub fn close_session(&self, session: &Session) {
        for service in session.drain() {
            service.detach(session.id());
        }
        session.force_close();
        if self.sessions.remove(session.id()).is_some() {
            gauge!(SESSIONS_ACTIVE).decrement(1.0);
            info!(
                session_id = %session.id(),
                dropped_frames = session.drop_count(),
                "session closed"
            );
        }
    }

    /// Close every live session. Returns how many were still open.
    pub fn close_all(&self) -> usize {
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        for session in &sessions {
            self.close_session(session);
        }
        sessions.len()
    }

    /// Send `response` to every connected session, subscribed or not.
    ///
    /// Returns the number of sessions it was queued for. Sessions whose
    /// queue is unavailable are closed.
    pub fn broadcast(&self, response: &Response) -> usize {
        let frame = match self.codec.encode(response) {
            Ok(frame) => frame,
            Err(err) => {
                warn!(error = %err, "failed to encode broadcast");
                return 0;
            }
        };
        let sessions: Vec<Arc<Session>> = self
            .sessions
            .iter()
            .map(|e| Arc::clone(e.value()))
            .collect();
        let mut delivered = 0;
        for session in sessions {
            if session.send(frame.clone()) {
                delivered += 1;
            } else {
                warn!(session_id = %session.id(), "broadcast dropped, closing session");
                self.close_session(&session);
            }
        }
        delivered
    }
}

impl Default for Registry {
    fn default() -> Self {
        Self::new(&ServerConfig::default())
    }
}
