//! Per-request handling for a subscribed service.
//!
//! Client writes to keys they may not write are never reported as errors.
//! The session is sent the server's current state for that key instead, which
//! puts its mirror back in sync. Calls run on their own task so a slow method
//! does not hold up later requests from the same connection.

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;
use std::time::{Duration, Instant};

use entangle_core::{CallId, EntangleError, Request, Response};
use futures::FutureExt;
use metrics::{counter, histogram};
use serde_json::Value;
use tracing::debug;

use crate::metrics::{CALL_DURATION_SECONDS, CALL_ERRORS_TOTAL, CALLS_TOTAL, WRITES_REFUSED_TOTAL};
use crate::session::Session;
use crate::store::{Service, Store};

/// Apply one decoded request from `session` to `service`.
pub(crate) fn dispatch(
    service: &Arc<Service>,
    session: &Arc<Session>,
    request: Request,
    call_timeout: Duration,
) {
    match request {
        Request::Subscribe { .. } => {
            let _ = service.subscribe(session);
        }
        Request::Unsubscribe { .. } => service.unsubscribe(session),
        Request::Read { key, call_id, .. } => read(service, session, &key, call_id),
        Request::Write { key, value, .. } => write(service, session, key, value),
        Request::Delete { key, .. } => delete(service, session, &key),
        Request::Call {
            call_id,
            method,
            args,
            ..
        } => spawn_call(
            Arc::clone(service),
            Arc::clone(session),
            call_id,
            method,
            args,
            call_timeout,
        ),
    }
}

fn read(service: &Service, session: &Session, key: &str, call_id: Option<CallId>) {
    if service.permissions().is_readable(key) {
        let _ = service.resync(session, key, call_id);
    } else if let Some(call_id) = call_id {
        let _ = service.send_to(
            session,
            &Response::CallError {
                service_id: service.id().clone(),
                call_id,
                message: EntangleError::NotReadable.to_string(),
            },
        );
    }
}

fn write(service: &Arc<Service>, session: &Session, key: String, value: Value) {
    if service.permissions().is_writable(&key) {
        match Store::new(Arc::clone(service)).set(key.clone(), value) {
            Ok(()) => return,
            Err(err) => debug!(
                service_id = %service.id(),
                key = %key,
                error = %err,
                "client write rejected"
            ),
        }
    }
    refuse(service, session, &key);
}

fn delete(service: &Arc<Service>, session: &Session, key: &str) {
    if service.permissions().is_writable(key) {
        match Store::new(Arc::clone(service)).delete(key) {
            Ok(_) => return,
            Err(err) => debug!(
                service_id = %service.id(),
                key,
                error = %err,
                "client delete rejected"
            ),
        }
    }
    refuse(service, session, key);
}

fn refuse(service: &Service, session: &Session, key: &str) {
    counter!(WRITES_REFUSED_TOTAL).increment(1);
    debug!(service_id = %service.id(), session_id = %session.id(), key, "resyncing refused write");
    let _ = service.resync(session, key, None);
}

fn spawn_call(
    service: Arc<Service>,
    session: Arc<Session>,
    call_id: CallId,
    method: String,
    args: Vec<Value>,
    timeout: Duration,
) {
    counter!(CALLS_TOTAL).increment(1);
    drop(tokio::spawn(async move {
        let start = Instant::now();
        let outcome = invoke(&service, &method, args, timeout).await;
        histogram!(CALL_DURATION_SECONDS).record(start.elapsed().as_secs_f64());

        let service_id = service.id().clone();
        let response = match outcome {
            Ok(value) => Response::CallResult {
                service_id,
                call_id,
                value,
            },
            Err(message) => {
                counter!(CALL_ERRORS_TOTAL).increment(1);
                debug!(%service_id, method = %method, message = %message, "call failed");
                Response::CallError {
                    service_id,
                    call_id,
                    message,
                }
            }
        };
        if !session.is_closed() {
            let _ = service.send_to(&session, &response);
        }
    }));
}

/// Run one method call to completion, turning every failure into a message.
async fn invoke(
    service: &Arc<Service>,
    name: &str,
    args: Vec<Value>,
    timeout: Duration,
) -> Result<Value, String> {
    let method = service.callable(name).map_err(|e| e.to_string())?;
    let store = Store::new(Arc::clone(service));
    let call = AssertUnwindSafe(method.call(store, args)).catch_unwind();
    match tokio::time::timeout(timeout, call).await {
        Ok(Ok(Ok(value))) => Ok(value),
        Ok(Ok(Err(err))) => Err(err.message().to_owned()),
        Ok(Err(panic)) => Err(panic_message(panic.as_ref())),
        Err(_elapsed) => Err(format!("\"{name}\" timed out after {timeout:?}")),
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "method panicked".to_owned()
    }
}
