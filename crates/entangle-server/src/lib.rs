//! # entangle-server
//!
//! Owns registered objects and keeps every subscribed connection in sync
//! with them.
//!
//! - [`Registry`]: registration, permission enforcement, per-session
//!   subscription bookkeeping, request dispatch
//! - [`Store`]: the accessor layer every mutation goes through; writes and
//!   deletes are broadcast to subscribers before returning
//! - [`Object`], [`Member`], [`Method`]: the registered object model
//! - [`EntangleServer`]: Axum `/ws`, `/health` and `/metrics` endpoints with
//!   graceful shutdown

#![deny(unsafe_code)]

pub mod config;
mod handler;
pub mod health;
pub mod metrics;
pub mod object;
pub mod registry;
pub mod server;
pub mod session;
pub mod shutdown;
pub mod store;
pub mod websocket;

pub use config::ServerConfig;
pub use object::{Member, Method, MethodError, Object, async_method, sync_method};
pub use registry::Registry;
pub use server::{EntangleServer, ServerHandle};
pub use session::Session;
pub use store::Store;
