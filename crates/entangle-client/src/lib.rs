//! # entangle-client
//!
//! Local mirrors of services registered on an entangle server.
//!
//! - [`Adaptor`]: owns the current transport, queues frames until it opens,
//!   rebuilds it on close while active
//! - [`Client`]: single dispatcher task per connection; resubscribes every
//!   mirror after a reconnect
//! - [`Service`]: the mirror itself, with call correlation and events
//! - [`websocket::connector`]: WebSocket transport builder

#![deny(unsafe_code)]

pub mod adaptor;
pub mod client;
pub mod config;
pub mod service;
pub mod transport;
pub mod websocket;

#[cfg(test)]
mod testing;

pub use adaptor::Adaptor;
pub use client::Client;
pub use config::ClientConfig;
pub use service::{ListenerHandle, Member, MethodStub, Service, ServiceEvent};
pub use transport::{Transport, TransportBuilder, TransportEvents, transport_builder};
