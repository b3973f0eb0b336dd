//! # entangle-core
//!
//! Shared building blocks for mirroring a server object onto remote clients:
//!
//! - [`ids`]: service, session and call correlation identifiers
//! - [`protocol`]: request/response messages exchanged over a connection
//! - [`codec`]: frame encoding with optional salting and digests
//! - [`selection`] and [`permissions`]: which keys are exposed and writable
//! - [`errors`]: the error taxonomy seen by callers
//! - [`logging`] and [`settings`]: tracing setup and layered config loading

#![deny(unsafe_code)]

pub mod codec;
pub mod errors;
pub mod ids;
pub mod logging;
pub mod permissions;
pub mod protocol;
pub mod selection;
pub mod settings;

pub use codec::{Codec, CodecError, CodecOptions};
pub use errors::{EntangleError, Result};
pub use ids::{CallId, CallIdGenerator, ServiceId, SessionId};
pub use permissions::{ExposeOptions, KeyPermission, Permission, PermissionTable};
pub use protocol::{Request, Response};
pub use selection::KeySelection;
