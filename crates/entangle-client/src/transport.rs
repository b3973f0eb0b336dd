//! Transport boundary: any duplex byte-stream provider can carry a client.
//!
//! A [`TransportBuilder`] is handed a [`TransportEvents`] and returns a live
//! [`Transport`]. The transport reports its lifecycle through the events
//! handle: `opened` once it can carry frames, `message` for every inbound
//! frame, and `closed` exactly once when it stops, including after
//! [`Transport::close`].
//!
//! Every built transport gets a fresh generation. Events carry it, so a
//! discarded transport that keeps talking is ignored.

use std::sync::Arc;

use bytes::Bytes;
use entangle_core::EntangleError;
use tokio::sync::mpsc;

/// One live connection.
pub trait Transport: Send + Sync {
    /// Send one frame. Only called after the transport reported `opened`.
    fn send(&self, frame: Bytes) -> Result<(), EntangleError>;

    /// Close the connection. The transport still reports `closed`.
    fn close(&self);
}

/// Builds a transport. Must not call back into the adaptor.
pub type TransportBuilder = Arc<dyn Fn(TransportEvents) -> Box<dyn Transport> + Send + Sync>;

/// Wrap a closure as a [`TransportBuilder`].
pub fn transport_builder<F, T>(build: F) -> TransportBuilder
where
    F: Fn(TransportEvents) -> T + Send + Sync + 'static,
    T: Transport + 'static,
{
    Arc::new(move |events| Box::new(build(events)) as Box<dyn Transport>)
}

#[derive(Debug)]
pub(crate) enum TransportEvent {
    Opened,
    Message(Bytes),
    Closed,
}

/// Raw input to the adaptor's event loop.
#[derive(Debug)]
pub(crate) enum Signal {
    Transport {
        generation: u64,
        event: TransportEvent,
    },
    /// The adaptor dropped its transport on request.
    Disconnected,
}

/// Callback handle given to a transport when it is built.
#[derive(Clone, Debug)]
pub struct TransportEvents {
    generation: u64,
    tx: mpsc::UnboundedSender<Signal>,
}

impl TransportEvents {
    pub(crate) fn new(generation: u64, tx: mpsc::UnboundedSender<Signal>) -> Self {
        Self { generation, tx }
    }

    /// Generation of the transport this handle belongs to.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// The connection is ready to carry frames.
    pub fn opened(&self) {
        self.emit(TransportEvent::Opened);
    }

    /// One inbound frame.
    pub fn message(&self, frame: Bytes) {
        self.emit(TransportEvent::Message(frame));
    }

    /// The connection is gone.
    pub fn closed(&self) {
        self.emit(TransportEvent::Closed);
    }

    fn emit(&self, event: TransportEvent) {
        // The receiver only goes away with the client.
        let _ = self.tx.send(Signal::Transport {
            generation: self.generation,
            event,
        });
    }
}
