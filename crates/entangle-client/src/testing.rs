//! Scripted transport for unit tests.

use std::sync::Arc;

use bytes::Bytes;
use entangle_core::{Codec, EntangleError, Request, Response};
use parking_lot::Mutex;

use crate::transport::{Transport, TransportBuilder, TransportEvents, transport_builder};

#[derive(Default)]
struct NetState {
    built: Vec<TransportEvents>,
    sent: Vec<Bytes>,
    close_calls: usize,
    fail_sends: bool,
}

/// Records everything the adaptor does; the test drives the other side.
#[derive(Default)]
pub(crate) struct MockNet {
    state: Mutex<NetState>,
    codec: Codec,
}

impl MockNet {
    pub(crate) fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub(crate) fn builder(self: &Arc<Self>) -> TransportBuilder {
        let net = Arc::clone(self);
        transport_builder(move |events: TransportEvents| {
            net.state.lock().built.push(events);
            MockTransport {
                net: Arc::clone(&net),
            }
        })
    }

    pub(crate) fn built(&self) -> usize {
        self.state.lock().built.len()
    }

    fn latest(&self) -> TransportEvents {
        self.state
            .lock()
            .built
            .last()
            .cloned()
            .expect("no transport built")
    }

    pub(crate) fn events(&self, index: usize) -> TransportEvents {
        self.state.lock().built[index].clone()
    }

    pub(crate) fn open(&self) {
        self.latest().opened();
    }

    pub(crate) fn close(&self) {
        self.latest().closed();
    }

    pub(crate) fn reply(&self, response: &Response) {
        self.latest().message(self.codec.encode(response).unwrap());
    }

    pub(crate) fn close_calls(&self) -> usize {
        self.state.lock().close_calls
    }

    pub(crate) fn fail_sends(&self, fail: bool) {
        self.state.lock().fail_sends = fail;
    }

    pub(crate) fn sent_frames(&self) -> Vec<Bytes> {
        self.state.lock().sent.clone()
    }

    /// Decoded requests sent so far, drained.
    pub(crate) fn take_requests(&self) -> Vec<Request> {
        let sent = std::mem::take(&mut self.state.lock().sent);
        sent.iter().map(|f| self.codec.decode(f).unwrap()).collect()
    }
}

struct MockTransport {
    net: Arc<MockNet>,
}

impl Transport for MockTransport {
    fn send(&self, frame: Bytes) -> Result<(), EntangleError> {
        let mut state = self.net.state.lock();
        if state.fail_sends {
            return Err(EntangleError::Transport("scripted failure".into()));
        }
        state.sent.push(frame);
        Ok(())
    }

    fn close(&self) {
        self.net.state.lock().close_calls += 1;
    }
}
