//! In-memory transport wiring real clients to a real registry.

#![allow(dead_code)]

use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use entangle_client::{
    Client, ClientConfig, Transport, TransportBuilder, TransportEvents, transport_builder,
};
use entangle_core::{EntangleError, Response};
use entangle_server::{Registry, ServerConfig, Session};
use parking_lot::Mutex;
use tokio::sync::watch;

/// Server side of every in-memory connection, plus a record of what was
/// delivered to clients.
pub struct MemoryLink {
    registry: Arc<Registry>,
    sessions: Mutex<Vec<Arc<Session>>>,
    delivered: Mutex<Vec<Response>>,
    gate: watch::Sender<bool>,
}

impl MemoryLink {
    pub fn new(registry: Arc<Registry>) -> Arc<Self> {
        let (gate, _) = watch::channel(true);
        Arc::new(Self {
            registry,
            sessions: Mutex::new(Vec::new()),
            delivered: Mutex::new(Vec::new()),
            gate,
        })
    }

    pub fn builder(self: &Arc<Self>) -> TransportBuilder {
        let link = Arc::clone(self);
        transport_builder(move |events: TransportEvents| link.open_connection(events))
    }

    /// Hold new connections before `opened` until [`release`](Self::release).
    pub fn hold(&self) {
        let _ = self.gate.send_replace(false);
    }

    pub fn release(&self) {
        let _ = self.gate.send_replace(true);
    }

    /// Close every live session from the server side.
    pub fn drop_all(&self) {
        for session in self.sessions.lock().drain(..) {
            self.registry.close_session(&session);
        }
    }

    /// Every response delivered to any client so far.
    pub fn delivered(&self) -> Vec<Response> {
        self.delivered.lock().clone()
    }

    fn open_connection(self: &Arc<Self>, events: TransportEvents) -> MemoryTransport {
        let (session, mut outbound) = self.registry.accept();
        self.sessions.lock().push(Arc::clone(&session));

        let link = Arc::clone(self);
        let task_session = Arc::clone(&session);
        let mut gate = self.gate.subscribe();
        drop(tokio::spawn(async move {
            let close = task_session.close_token();
            let released = async {
                let _ = gate.wait_for(|open| *open).await;
            };
            tokio::select! {
                () = released => events.opened(),
                () = close.cancelled() => {
                    events.closed();
                    return;
                }
            }
            loop {
                tokio::select! {
                    frame = outbound.recv() => match frame {
                        Some(frame) => link.deliver(&events, frame),
                        None => break,
                    },
                    () = close.cancelled() => {
                        while let Ok(frame) = outbound.try_recv() {
                            link.deliver(&events, frame);
                        }
                        break;
                    }
                }
            }
            events.closed();
        }));

        MemoryTransport {
            registry: Arc::clone(&self.registry),
            session,
        }
    }

    fn deliver(&self, events: &TransportEvents, frame: Bytes) {
        if let Ok(response) = self.registry.codec().decode::<Response>(&frame) {
            self.delivered.lock().push(response);
        }
        events.message(frame);
    }
}

struct MemoryTransport {
    registry: Arc<Registry>,
    session: Arc<Session>,
}

impl Transport for MemoryTransport {
    fn send(&self, frame: Bytes) -> Result<(), EntangleError> {
        if self.session.is_closed() {
            return Err(EntangleError::ConnectionLost);
        }
        self.registry.handle_frame(&self.session, &frame);
        Ok(())
    }

    fn close(&self) {
        self.registry.close_session(&self.session);
    }
}

pub fn registry() -> Arc<Registry> {
    Arc::new(Registry::new(&ServerConfig::default()))
}

pub fn client(link: &Arc<MemoryLink>, config: ClientConfig) -> Client {
    Client::with_transport(link.builder(), config).expect("fresh adaptor")
}

/// Poll `condition` until it holds, failing after five seconds.
pub async fn eventually(mut condition: impl FnMut() -> bool) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(5);
    while !condition() {
        assert!(tokio::time::Instant::now() < deadline, "condition not met in time");
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}
