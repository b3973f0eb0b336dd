//! WebSocket transport built on `tokio-tungstenite`.

use std::time::Duration;

use bytes::Bytes;
use entangle_core::EntangleError;
use futures::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, warn};

use crate::transport::{Transport, TransportBuilder, TransportEvents, transport_builder};

/// Pause before reporting a failed connection attempt, so an active adaptor
/// does not spin against an unreachable server.
const RETRY_DELAY: Duration = Duration::from_secs(1);

enum Command {
    Frame(Bytes),
    Close,
}

struct WsTransport {
    tx: mpsc::UnboundedSender<Command>,
}

impl Transport for WsTransport {
    fn send(&self, frame: Bytes) -> Result<(), EntangleError> {
        self.tx
            .send(Command::Frame(frame))
            .map_err(|_| EntangleError::NotConnected)
    }

    fn close(&self) {
        let _ = self.tx.send(Command::Close);
    }
}

/// Transport builder connecting to `url` (`ws://host:port/ws`).
///
/// Each build spawns one task that owns the socket, so it must be invoked
/// inside a Tokio runtime.
pub fn connector(url: impl Into<String>) -> TransportBuilder {
    let url = url.into();
    transport_builder(move |events: TransportEvents| {
        let (tx, rx) = mpsc::unbounded_channel();
        drop(tokio::spawn(drive(url.clone(), events, rx)));
        WsTransport { tx }
    })
}

async fn drive(
    url: String,
    events: TransportEvents,
    mut commands: mpsc::UnboundedReceiver<Command>,
) {
    let generation = events.generation();
    let stream = tokio::select! {
        result = connect_async(url.as_str()) => match result {
            Ok((stream, _)) => stream,
            Err(err) => {
                warn!(%url, generation, error = %err, "connect failed");
                tokio::time::sleep(RETRY_DELAY).await;
                events.closed();
                return;
            }
        },
        // Closed before the handshake finished.
        _ = wait_for_close(&mut commands) => {
            events.closed();
            return;
        }
    };

    debug!(%url, generation, "websocket connected");
    events.opened();
    let (mut sink, mut source) = stream.split();

    loop {
        tokio::select! {
            command = commands.recv() => match command {
                Some(Command::Frame(frame)) => {
                    if let Err(err) = sink.send(Message::Binary(frame)).await {
                        warn!(generation, error = %err, "websocket send failed");
                        break;
                    }
                }
                Some(Command::Close) | None => {
                    let _ = sink.send(Message::Close(None)).await;
                    break;
                }
            },
            message = source.next() => match message {
                Some(Ok(Message::Binary(frame))) => events.message(frame),
                Some(Ok(Message::Text(text))) => {
                    events.message(Bytes::copy_from_slice(text.as_str().as_bytes()));
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(_)) => {}
                Some(Err(err)) => {
                    debug!(generation, error = %err, "websocket read failed");
                    break;
                }
            },
        }
    }

    debug!(%url, generation, "websocket closed");
    events.closed();
}

/// Resolve once a close is requested; frames sent before the handshake are
/// dropped because the adaptor only sends after `opened`.
async fn wait_for_close(commands: &mut mpsc::UnboundedReceiver<Command>) {
    while let Some(command) = commands.recv().await {
        if matches!(command, Command::Close) {
            return;
        }
    }
}
