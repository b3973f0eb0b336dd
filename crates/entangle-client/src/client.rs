//! Client: one adaptor, one dispatcher task, any number of mirrors.
//!
//! Every transport event is handled on a single task so inbound messages
//! reach mirrors and listeners in arrival order.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use entangle_core::{Codec, EntangleError, Request, Response, Result, ServiceId};
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::adaptor::{Adaptor, AdaptorEvent};
use crate::config::ClientConfig;
use crate::service::Service;
use crate::transport::{Signal, TransportBuilder};

struct ClientShared {
    adaptor: Arc<Adaptor>,
    codec: Arc<Codec>,
    timeout: Duration,
    services: Mutex<HashMap<ServiceId, Service>>,
}

impl ClientShared {
    fn encode(&self, request: &Request) -> Option<Bytes> {
        match self.codec.encode(request) {
            Ok(frame) => Some(frame),
            Err(err) => {
                warn!(error = %err, op = request.op_name(), "failed to encode request");
                None
            }
        }
    }

    fn handle_signal(&self, signal: Signal) {
        let cached = self.adaptor.is_cached();
        let (event, services) = {
            let services = self.services.lock();
            let greeting = || {
                services
                    .keys()
                    .filter_map(|id| {
                        self.encode(&Request::Subscribe {
                            service_id: id.clone(),
                        })
                    })
                    .collect()
            };
            let Some(event) = self.adaptor.on_signal(signal, greeting) else {
                return;
            };
            let snapshot: Vec<Service> = services.values().cloned().collect();
            (event, snapshot)
        };

        match event {
            AdaptorEvent::Open => {
                for service in &services {
                    service.inner().on_open(cached);
                }
                info!(services = services.len(), "connected, resubscribed");
            }
            AdaptorEvent::Closed => {
                for service in &services {
                    service.inner().on_close(cached);
                }
                info!(reconnecting = self.adaptor.is_active(), "connection closed");
            }
            AdaptorEvent::Message(frame) => self.handle_frame(&frame),
        }
    }

    fn handle_frame(&self, frame: &[u8]) {
        let response: Response = match self.codec.decode(frame) {
            Ok(response) => response,
            Err(err) => {
                warn!(error = %err, "undecodable frame dropped");
                return;
            }
        };
        let service = self.services.lock().get(response.service_id()).cloned();
        match service {
            Some(service) => service.inner().apply(response),
            None => match response {
                Response::ServiceError { service_id, message } => {
                    warn!(
                        service_id = %service_id,
                        message = %message,
                        "connection error from server"
                    );
                }
                other => debug!(
                    service_id = %other.service_id(),
                    "response for unknown service dropped"
                ),
            },
        }
    }

    fn close_all(&self) {
        let services: Vec<Service> = self.services.lock().drain().map(|(_, s)| s).collect();
        for service in services {
            service.inner().close();
        }
    }
}

/// Mirrors remote services over one adaptor.
pub struct Client {
    shared: Arc<ClientShared>,
    dispatcher: JoinHandle<()>,
}

impl Client {
    /// Bind a client to `adaptor` and start its dispatcher task.
    ///
    /// Connects right away when `config.active` is set. Must be called
    /// inside a Tokio runtime. An adaptor can serve only one client.
    pub fn new(adaptor: Arc<Adaptor>, config: ClientConfig) -> Result<Self> {
        let signals = adaptor
            .take_signals()
            .ok_or_else(|| {
                EntangleError::Transport("adaptor is already bound to a client".into())
            })?;
        let shared = Arc::new(ClientShared {
            adaptor: Arc::clone(&adaptor),
            codec: Arc::new(Codec::new(config.codec.clone())),
            timeout: config.timeout(),
            services: Mutex::new(HashMap::new()),
        });
        let dispatcher = tokio::spawn(run_dispatcher(Arc::clone(&shared), signals));
        if config.active {
            adaptor.connect();
        }
        Ok(Self { shared, dispatcher })
    }

    /// Build the adaptor from `builder` and `config.cached`, then bind to it.
    pub fn with_transport(builder: TransportBuilder, config: ClientConfig) -> Result<Self> {
        let adaptor = Adaptor::new(builder, config.cached);
        Self::new(adaptor, config)
    }

    /// The underlying adaptor.
    pub fn adaptor(&self) -> &Arc<Adaptor> {
        &self.shared.adaptor
    }

    /// Enable auto-reconnect and connect.
    pub fn connect(&self) {
        self.shared.adaptor.connect();
    }

    /// Disable auto-reconnect and close the transport.
    pub fn disconnect(&self) {
        self.shared.adaptor.disconnect();
    }

    /// Start mirroring `service_id`.
    ///
    /// If the transport is not open yet, the subscription is sent as soon
    /// as it opens.
    pub fn subscribe(&self, service_id: impl Into<ServiceId>) -> Result<Service> {
        let service_id = service_id.into();
        let mut services = self.shared.services.lock();
        if services.contains_key(&service_id) {
            return Err(EntangleError::AlreadySubscribed { service_id });
        }
        let service = Service::new(
            service_id.clone(),
            Arc::clone(&self.shared.adaptor),
            Arc::clone(&self.shared.codec),
            self.shared.timeout,
        );
        let _ = services.insert(service_id.clone(), service.clone());

        if self.shared.adaptor.is_open() {
            let request = Request::Subscribe {
                service_id: service_id.clone(),
            };
            if let Some(frame) = self.shared.encode(&request) {
                // A failed send is retried by the resubscribe on reconnect.
                if let Err(err) = self.shared.adaptor.send(frame) {
                    warn!(service_id = %service_id, error = %err, "subscribe not sent");
                }
            }
        }
        info!(service_id = %service_id, "subscribed");
        Ok(service)
    }

    /// Stop mirroring `service_id`. Pending calls fail with `Cancelled`.
    pub fn unsubscribe(&self, service_id: &str) -> Result<()> {
        let Some(service) = self.shared.services.lock().remove(service_id) else {
            return Err(EntangleError::NotSubscribed {
                service_id: service_id.into(),
            });
        };
        service.inner().close();

        let request = Request::Unsubscribe {
            service_id: service.id().clone(),
        };
        if let Some(frame) = self.shared.encode(&request) {
            if let Err(err) = self.shared.adaptor.send(frame) {
                // No live session means nothing to unsubscribe from.
                debug!(service_id = %service_id, error = %err, "unsubscribe not sent");
            }
        }
        info!(service_id = %service_id, "unsubscribed");
        Ok(())
    }

    /// Mirror for `service_id`, if subscribed.
    pub fn service(&self, service_id: &str) -> Option<Service> {
        self.shared.services.lock().get(service_id).cloned()
    }

    /// Subscribed service ids, sorted.
    pub fn service_ids(&self) -> Vec<ServiceId> {
        let mut ids: Vec<ServiceId> = self.shared.services.lock().keys().cloned().collect();
        ids.sort();
        ids
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.dispatcher.abort();
        self.shared.adaptor.disconnect();
        self.shared.close_all();
    }
}

impl std::fmt::Debug for Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Client")
            .field("adaptor", &self.shared.adaptor)
            .field("services", &self.shared.services.lock().len())
            .finish_non_exhaustive()
    }
}

async fn run_dispatcher(shared: Arc<ClientShared>, mut signals: mpsc::UnboundedReceiver<Signal>) {
    while let Some(signal) = signals.recv().await {
        shared.handle_signal(signal);
    }
    debug!("client dispatcher stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testing::MockNet;
    use assert_matches::assert_matches;
    use serde_json::json;

    fn client(net: &Arc<MockNet>, config: ClientConfig) -> Client {
        Client::with_transport(net.builder(), config).unwrap()
    }

    /// Let the dispatcher drain its queue.
    async fn settle() {
        for _ in 0..5 {
            tokio::task::yield_now().await;
        }
    }

    fn subscribe_request(id: &str) -> Request {
        Request::Subscribe {
            service_id: id.into(),
        }
    }

    #[tokio::test]
    async fn subscribe_before_open_is_sent_on_open() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let _svc = client.subscribe("data1").unwrap();
        assert_eq!(client.adaptor().queued_frames(), 0);

        net.open();
        settle().await;
        assert_eq!(net.take_requests(), vec![subscribe_request("data1")]);
    }

    #[tokio::test]
    async fn subscribe_twice_fails() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let _svc = client.subscribe("a").unwrap();
        assert_matches!(
            client.subscribe("a"),
            Err(EntangleError::AlreadySubscribed { service_id }) if service_id.as_str() == "a"
        );
    }

    #[tokio::test]
    async fn subscribe_when_open_sends_immediately() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        net.open();
        settle().await;
        let _svc = client.subscribe("a").unwrap();
        assert_eq!(net.take_requests(), vec![subscribe_request("a")]);
    }

    #[tokio::test]
    async fn inactive_client_does_not_connect() {
        let net = MockNet::new();
        let config = ClientConfig {
            active: false,
            ..ClientConfig::default()
        };
        let client = client(&net, config);
        assert_eq!(net.built(), 0);
        let svc = client.subscribe("a").unwrap();
        assert_matches!(svc.set("x", 1), Err(EntangleError::NotConnected));
        client.connect();
        assert_eq!(net.built(), 1);
    }

    #[tokio::test]
    async fn messages_route_to_their_service() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let a = client.subscribe("a").unwrap();
        let b = client.subscribe("b").unwrap();
        net.open();
        settle().await;

        net.reply(&Response::Write {
            service_id: "b".into(),
            key: "k".into(),
            value: json!(1),
            call_id: None,
        });
        net.reply(&Response::Ready {
            service_id: "unknown".into(),
        });
        settle().await;
        assert_eq!(b.get("k"), Some(json!(1)));
        assert_eq!(a.get("k"), None);
    }

    #[tokio::test]
    async fn reconnect_resubscribes_and_keeps_cached_state() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let svc = client.subscribe("a").unwrap();
        net.open();
        settle().await;
        net.reply(&Response::Write {
            service_id: "a".into(),
            key: "x".into(),
            value: json!(1),
            call_id: None,
        });
        settle().await;
        let _ = net.take_requests();

        net.close();
        settle().await;
        assert_eq!(net.built(), 2);
        assert_eq!(svc.get("x"), Some(json!(1)));

        net.open();
        settle().await;
        assert_eq!(net.take_requests(), vec![subscribe_request("a")]);
        assert_eq!(svc.get("x"), Some(json!(1)));
    }

    #[tokio::test]
    async fn uncached_client_clears_mirror_on_close() {
        let net = MockNet::new();
        let config = ClientConfig {
            cached: false,
            ..ClientConfig::default()
        };
        let client = client(&net, config);
        let svc = client.subscribe("a").unwrap();
        net.open();
        settle().await;
        net.reply(&Response::Write {
            service_id: "a".into(),
            key: "x".into(),
            value: json!(1),
            call_id: None,
        });
        settle().await;
        assert_eq!(svc.get("x"), Some(json!(1)));

        net.close();
        settle().await;
        assert!(svc.keys().is_empty());
    }

    #[tokio::test]
    async fn close_rejects_pending_calls() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let svc = client.subscribe("a").unwrap();
        net.open();
        settle().await;

        let caller = svc.clone();
        let call = tokio::spawn(async move { caller.call("slow", vec![]).await });
        settle().await;
        net.close();
        assert_matches!(call.await.unwrap(), Err(EntangleError::ConnectionLost));
    }

    #[tokio::test]
    async fn unsubscribe_cancels_and_forgets() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let svc = client.subscribe("a").unwrap();
        net.open();
        settle().await;
        let _ = net.take_requests();

        let caller = svc.clone();
        let call = tokio::spawn(async move { caller.call("slow", vec![]).await });
        settle().await;
        client.unsubscribe("a").unwrap();
        assert_matches!(call.await.unwrap(), Err(EntangleError::Cancelled));
        assert!(client.service("a").is_none());
        assert!(client.service_ids().is_empty());
        assert_matches!(
            net.take_requests().last(),
            Some(Request::Unsubscribe { service_id }) if service_id.as_str() == "a"
        );
        assert_matches!(client.unsubscribe("a"), Err(EntangleError::NotSubscribed { .. }));
    }

    #[tokio::test]
    async fn adaptor_binds_to_one_client() {
        let net = MockNet::new();
        let adaptor = Adaptor::new(net.builder(), true);
        let _first = Client::new(Arc::clone(&adaptor), ClientConfig::default()).unwrap();
        assert_matches!(
            Client::new(adaptor, ClientConfig::default()),
            Err(EntangleError::Transport(_))
        );
    }

    #[tokio::test]
    async fn disconnect_stops_reconnect_and_notifies() {
        let net = MockNet::new();
        let client = client(&net, ClientConfig::default());
        let svc = client.subscribe("a").unwrap();
        net.open();
        settle().await;
        net.reply(&Response::Ready {
            service_id: "a".into(),
        });
        settle().await;
        assert!(svc.is_ready());

        client.disconnect();
        settle().await;
        assert!(!svc.is_ready());
        assert!(!client.adaptor().is_active());
        assert_eq!(net.built(), 1);
    }
}
