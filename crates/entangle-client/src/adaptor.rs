//! Connection adaptor: owns the current transport and the reconnect policy.
//!
//! `active` ("entangled") means the adaptor wants a connection and rebuilds
//! the transport as soon as it closes. `cached` is read by the client to
//! decide whether mirrors survive a disconnect.
//!
//! Frames sent while a transport exists but has not opened yet are queued
//! and flushed, in order, once it opens. The queue lives in memory only and
//! belongs to that transport: if it closes without opening, the queued frames
//! are discarded along with it, since their callers have already been told
//! the connection was lost.

use std::collections::VecDeque;
use std::sync::Arc;

use bytes::Bytes;
use entangle_core::EntangleError;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::transport::{Signal, Transport, TransportBuilder, TransportEvent, TransportEvents};

/// What the client loop sees after the adaptor has filtered a signal.
#[derive(Debug, PartialEq)]
pub(crate) enum AdaptorEvent {
    Open,
    Message(Bytes),
    Closed,
}

struct AdaptorState {
    active: bool,
    open: bool,
    generation: u64,
    transport: Option<Box<dyn Transport>>,
    queue: VecDeque<Bytes>,
}

/// Wraps one physical connection at a time.
pub struct Adaptor {
    builder: TransportBuilder,
    cached: bool,
    state: Mutex<AdaptorState>,
    signal_tx: mpsc::UnboundedSender<Signal>,
    signal_rx: Mutex<Option<mpsc::UnboundedReceiver<Signal>>>,
}

impl Adaptor {
    /// Create an inactive adaptor. Nothing is built until [`connect`](Self::connect).
    pub fn new(builder: TransportBuilder, cached: bool) -> Arc<Self> {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        Arc::new(Self {
            builder,
            cached,
            state: Mutex::new(AdaptorState {
                active: false,
                open: false,
                generation: 0,
                transport: None,
                queue: VecDeque::new(),
            }),
            signal_tx,
            signal_rx: Mutex::new(Some(signal_rx)),
        })
    }

    /// Start connecting and keep reconnecting. No-op if already active.
    pub fn connect(&self) {
        let mut state = self.state.lock();
        if state.active {
            return;
        }
        state.active = true;
        if state.transport.is_none() {
            self.build(&mut state);
        }
    }

    /// Stop reconnecting and close the current transport.
    pub fn disconnect(&self) {
        let mut state = self.state.lock();
        state.active = false;
        state.queue.clear();
        if let Some(transport) = state.transport.take() {
            state.open = false;
            // Anything the old transport still reports is stale now.
            state.generation += 1;
            transport.close();
            let _ = self.signal_tx.send(Signal::Disconnected);
            info!("adaptor disconnected");
        }
    }

    /// Send one frame, queueing it until the transport opens.
    pub fn send(&self, frame: Bytes) -> Result<(), EntangleError> {
        let mut state = self.state.lock();
        let Some(transport) = state.transport.as_ref() else {
            return Err(EntangleError::NotConnected);
        };
        if state.open {
            transport.send(frame)
        } else {
            state.queue.push_back(frame);
            Ok(())
        }
    }

    /// Whether the adaptor reconnects on close.
    pub fn is_active(&self) -> bool {
        self.state.lock().active
    }

    /// Whether the current transport has opened.
    pub fn is_open(&self) -> bool {
        self.state.lock().open
    }

    /// Whether mirrors keep their values while disconnected.
    pub fn is_cached(&self) -> bool {
        self.cached
    }

    /// Frames waiting for the transport to open.
    pub fn queued_frames(&self) -> usize {
        self.state.lock().queue.len()
    }

    pub(crate) fn take_signals(&self) -> Option<mpsc::UnboundedReceiver<Signal>> {
        self.signal_rx.lock().take()
    }

    /// Apply one raw signal.
    ///
    /// On open, frames from `greeting` are sent before the queued ones so
    /// subscriptions reach the server ahead of any request that relies on
    /// them.
    pub(crate) fn on_signal<F>(&self, signal: Signal, greeting: F) -> Option<AdaptorEvent>
    where
        F: FnOnce() -> Vec<Bytes>,
    {
        let (generation, event) = match signal {
            Signal::Disconnected => return Some(AdaptorEvent::Closed),
            Signal::Transport { generation, event } => (generation, event),
        };

        let mut state = self.state.lock();
        if generation != state.generation {
            debug!(generation, current = state.generation, "stale transport event ignored");
            return None;
        }

        match event {
            TransportEvent::Opened => {
                state.open = true;
                info!(generation, "transport open");
                let AdaptorState {
                    transport, queue, ..
                } = &mut *state;
                if let Some(transport) = transport.as_ref() {
                    let pending: Vec<Bytes> =
                        greeting().into_iter().chain(queue.drain(..)).collect();
                    for frame in pending {
                        if let Err(err) = transport.send(frame) {
                            warn!(error = %err, "failed to flush frame");
                        }
                    }
                }
                Some(AdaptorEvent::Open)
            }
            TransportEvent::Message(frame) => Some(AdaptorEvent::Message(frame)),
            TransportEvent::Closed => {
                state.open = false;
                state.generation += 1;
                let dropped = state.queue.len();
                state.queue.clear();
                if let Some(transport) = state.transport.take() {
                    transport.close();
                }
                info!(generation, reconnect = state.active, dropped, "transport closed");
                if state.active {
                    self.build(&mut state);
                }
                Some(AdaptorEvent::Closed)
            }
        }
    }

    fn build(&self, state: &mut AdaptorState) {
        state.generation += 1;
        state.open = false;
        let events = TransportEvents::new(state.generation, self.signal_tx.clone());
        state.transport = Some((self.builder)(events));
        debug!(generation = state.generation, "transport built");
    }
}

impl std::fmt::Debug for Adaptor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock();
        f.debug_struct("Adaptor")
            .field("active", &state.active)
            .field("open", &state.open)
            .field("cached", &self.cached)
            .field("generation", &state.generation)
            .finish_non_exhaustive()
    }
}
