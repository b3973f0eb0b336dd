//! Registered services and the [`Store`] accessor layer.
//!
//! Every mutation of a registered object goes through a [`Store`]. A
//! successful write or delete on a readable key is broadcast to every
//! subscribed session before the call returns, while the object lock is
//! still held, so all sessions observe mutations in the order they happened.
//!
//! Lock order: object, then client set, then a session's subscriptions.

use std::collections::HashMap;
use std::sync::Arc;

use bytes::Bytes;
use entangle_core::{
    CallId, Codec, EntangleError, ExposeOptions, Permission, PermissionTable, Response, ServiceId,
    SessionId,
};
use metrics::counter;
use parking_lot::Mutex;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use crate::metrics::{BROADCASTS_TOTAL, SESSIONS_FAILED_TOTAL};
use crate::object::{Member, Method, Object};
use crate::session::Session;

/// A registered object with its permission table and subscribers.
pub struct Service {
    id: ServiceId,
    object: Mutex<Object>,
    permissions: PermissionTable,
    clients: Mutex<HashMap<SessionId, Arc<Session>>>,
    codec: Arc<Codec>,
}

impl Service {
    pub(crate) fn new(
        id: ServiceId,
        object: Object,
        options: ExposeOptions,
        codec: Arc<Codec>,
    ) -> Self {
        let permissions = PermissionTable::resolve(options, object.keys());
        Self {
            id,
            object: Mutex::new(object),
            permissions,
            clients: Mutex::new(HashMap::new()),
            codec,
        }
    }

    pub(crate) fn id(&self) -> &ServiceId {
        &self.id
    }

    pub(crate) fn permissions(&self) -> &PermissionTable {
        &self.permissions
    }

    /// Response describing the current state of `key`.
    fn state_of(&self, object: &Object, key: &str, call_id: Option<CallId>) -> Response {
        let service_id = self.id.clone();
        let key = key.to_owned();
        match object.get(&key) {
            Some(Member::Data(value)) => Response::Write {
                service_id,
                key,
                value: value.clone(),
                call_id,
            },
            Some(Member::Method(_)) => Response::AssignFunction {
                service_id,
                key,
                call_id,
            },
            None => Response::Delete {
                service_id,
                key,
                call_id,
            },
        }
    }

    fn encode(&self, response: &Response) -> Option<Bytes> {
        match self.codec.encode(response) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(service_id = %self.id, error = %err, "failed to encode response");
                None
            }
        }
    }

    /// Send `response` to one session. A failed send tears the session down.
    pub(crate) fn send_to(&self, session: &Session, response: &Response) -> bool {
        let Some(frame) = self.encode(response) else {
            return false;
        };
        if session.send(frame) {
            true
        } else {
            self.fail_session(session, "send queue unavailable");
            false
        }
    }

    /// Best-effort `ServiceError`, then force the session closed and drop it
    /// from this service.
    pub(crate) fn fail_session(&self, session: &Session, reason: &str) {
        warn!(
            service_id = %self.id,
            session_id = %session.id(),
            reason,
            "dropping session"
        );
        counter!(SESSIONS_FAILED_TOTAL).increment(1);
        let notice = Response::ServiceError {
            service_id: self.id.clone(),
            message: reason.to_owned(),
        };
        if let Some(frame) = self.encode(&notice) {
            let _ = session.send(frame);
        }
        session.force_close();
        let _ = self.clients.lock().remove(session.id());
        session.unlink(&self.id);
    }

    /// Send `response` to every subscriber. Caller holds the object lock.
    fn fan_out(&self, response: &Response) {
        let clients: Vec<Arc<Session>> = self.clients.lock().values().cloned().collect();
        if clients.is_empty() {
            return;
        }
        let Some(frame) = self.encode(response) else {
            return;
        };
        counter!(BROADCASTS_TOTAL).increment(1);
        for session in clients {
            if !session.send(frame.clone()) {
                self.fail_session(&session, "send queue unavailable");
            }
        }
    }

    /// Add `session` as a subscriber and send it the full exposed state.
    pub(crate) fn subscribe(self: &Arc<Self>, session: &Arc<Session>) -> bool {
        let object = self.object.lock();
        {
            let mut clients = self.clients.lock();
            let _ = clients.insert(session.id().clone(), Arc::clone(session));
            if !session.link(self.id.clone(), Arc::downgrade(self)) {
                let _ = clients.remove(session.id());
                return false;
            }
        }
        for key in object.keys() {
            if !self.permissions.is_readable(key) {
                continue;
            }
            if !self.send_to(session, &self.state_of(&object, key, None)) {
                return false;
            }
        }
        drop(object);
        debug!(service_id = %self.id, session_id = %session.id(), "session subscribed");
        self.send_to(
            session,
            &Response::Ready {
                service_id: self.id.clone(),
            },
        )
    }

    pub(crate) fn unsubscribe(&self, session: &Session) {
        let _ = self.clients.lock().remove(session.id());
        session.unlink(&self.id);
    }

    pub(crate) fn detach(&self, session_id: &SessionId) {
        let _ = self.clients.lock().remove(session_id);
    }

    /// Drop every subscriber link in both directions.
    pub(crate) fn clear_clients(&self) {
        let clients: Vec<Arc<Session>> = self.clients.lock().drain().map(|(_, s)| s).collect();
        for session in clients {
            session.unlink(&self.id);
        }
    }

    pub(crate) fn subscriber_count(&self) -> usize {
        self.clients.lock().len()
    }

    /// Look up a callable member that clients may invoke.
    pub(crate) fn callable(&self, key: &str) -> Result<Arc<dyn Method>, EntangleError> {
        if !self.permissions.is_readable(key) {
            return Err(EntangleError::NotReadable);
        }
        match self.object.lock().get(key) {
            Some(Member::Method(method)) => Ok(Arc::clone(method)),
            _ => Err(EntangleError::NotAFunction {
                key: key.to_owned(),
            }),
        }
    }

    /// Send `session` the authoritative state of `key` if it may see it.
    pub(crate) fn resync(&self, session: &Session, key: &str, call_id: Option<CallId>) -> bool {
        if !self.permissions.is_readable(key) {
            return false;
        }
        let response = {
            let object = self.object.lock();
            self.state_of(&object, key, call_id)
        };
        self.send_to(session, &response)
    }
}

impl std::fmt::Debug for Service {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Service")
            .field("id", &self.id)
            .field("subscribers", &self.subscriber_count())
            .finish_non_exhaustive()
    }
}

/// Accessor layer over one registered object.
///
/// Cheap to clone. Method bodies receive one so their writes broadcast like
/// any other mutation.
#[derive(Clone, Debug)]
pub struct Store {
    service: Arc<Service>,
}

impl Store {
    pub(crate) fn new(service: Arc<Service>) -> Self {
        Self { service }
    }

    pub(crate) fn service(&self) -> &Arc<Service> {
        &self.service
    }

    /// Id the object is registered under.
    pub fn service_id(&self) -> &ServiceId {
        &self.service.id
    }

    /// Data value of `key`. `None` for methods and missing keys.
    pub fn get(&self, key: &str) -> Option<Value> {
        self.service
            .object
            .lock()
            .get(key)
            .and_then(Member::as_data)
            .cloned()
    }

    /// Whether `key` is a method.
    pub fn is_method(&self, key: &str) -> bool {
        self.service
            .object
            .lock()
            .get(key)
            .is_some_and(Member::is_method)
    }

    /// Whether `key` exists.
    pub fn contains(&self, key: &str) -> bool {
        self.service.object.lock().contains(key)
    }

    /// All member names.
    pub fn keys(&self) -> Vec<String> {
        self.service.object.lock().keys().map(str::to_owned).collect()
    }

    /// Copy of every data member.
    pub fn snapshot(&self) -> Map<String, Value> {
        self.service
            .object
            .lock()
            .iter()
            .filter_map(|(k, m)| m.as_data().map(|v| (k.clone(), v.clone())))
            .collect()
    }

    /// Set a data member and broadcast it.
    ///
    /// Method members cannot be overwritten.
    pub fn set(
        &self,
        key: impl Into<String>,
        value: impl Into<Value>,
    ) -> Result<(), EntangleError> {
        let key = key.into();
        let value = value.into();
        let mut object = self.service.object.lock();
        if object.get(&key).is_some_and(Member::is_method) {
            return Err(EntangleError::InvalidAssignment { key });
        }
        let _ = object.insert(key.clone(), Member::Data(value.clone()));
        if self.service.permissions.is_readable(&key) {
            self.service.fan_out(&Response::Write {
                service_id: self.service.id.clone(),
                key,
                value,
                call_id: None,
            });
        }
        Ok(())
    }

    /// Read-modify-write a data member atomically and broadcast the result.
    ///
    /// `f` runs under the object lock and must not touch this store.
    pub fn update<F>(&self, key: &str, f: F) -> Result<Value, EntangleError>
    where
        F: FnOnce(Option<&Value>) -> Value,
    {
        let mut object = self.service.object.lock();
        let next = match object.get(key) {
            Some(Member::Method(_)) => {
                return Err(EntangleError::InvalidAssignment {
                    key: key.to_owned(),
                });
            }
            Some(Member::Data(current)) => f(Some(current)),
            None => f(None),
        };
        let _ = object.insert(key.to_owned(), Member::Data(next.clone()));
        if self.service.permissions.is_readable(key) {
            self.service.fan_out(&Response::Write {
                service_id: self.service.id.clone(),
                key: key.to_owned(),
                value: next.clone(),
                call_id: None,
            });
        }
        Ok(next)
    }

    /// Remove a data member and broadcast the removal.
    ///
    /// Method members cannot be deleted.
    pub fn delete(&self, key: &str) -> Result<Option<Value>, EntangleError> {
        let mut object = self.service.object.lock();
        let removed = match object.get(key) {
            Some(Member::Method(_)) => {
                return Err(EntangleError::InvalidAssignment {
                    key: key.to_owned(),
                });
            }
            Some(Member::Data(_)) => object.remove(key).and_then(|m| m.as_data().cloned()),
            None => None,
        };
        if self.service.permissions.is_readable(key) {
            self.service.fan_out(&Response::Delete {
                service_id: self.service.id.clone(),
                key: key.to_owned(),
                call_id: None,
            });
        }
        Ok(removed)
    }

    /// Effective client permission for `key`.
    pub fn permission(&self, key: &str) -> Permission {
        self.service.permissions.get(key)
    }

    /// Number of sessions currently subscribed.
    pub fn subscriber_count(&self) -> usize {
        self.service.subscriber_count()
    }
}
