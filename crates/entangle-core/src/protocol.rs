//! Wire protocol: the closed set of request and response messages.
//!
//! Every message carries the id of the service it concerns so several
//! registered objects can share one connection. Field names are shortened on
//! the wire (`o` operation, `s` service, `k` key, `v` value, `a` args,
//! `i` call id, `m` message).
//!
//! Functions are never serialized. A key that is a method on the server is
//! announced with [`Response::AssignFunction`] and only ever invoked by name.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::ids::{CallId, ServiceId};

/// Client → server operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "o")]
pub enum Request {
    /// Start mirroring a service.
    #[serde(rename = "S")]
    Subscribe {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
    },
    /// Stop mirroring a service.
    #[serde(rename = "U")]
    Unsubscribe {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
    },
    /// Ask for the current state of one key.
    #[serde(rename = "R")]
    Read {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Key to read.
        #[serde(rename = "k")]
        key: String,
        /// Echoed back on the answering response when present.
        #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// Write a value through to the server object.
    #[serde(rename = "W")]
    Write {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Key to write.
        #[serde(rename = "k")]
        key: String,
        /// New value.
        #[serde(rename = "v", default)]
        value: Value,
    },
    /// Remove a key from the server object.
    #[serde(rename = "D")]
    Delete {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Key to delete.
        #[serde(rename = "k")]
        key: String,
    },
    /// Invoke a server method.
    #[serde(rename = "C")]
    Call {
        /// Target service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Correlation id for the result.
        #[serde(rename = "i")]
        call_id: CallId,
        /// Method name.
        #[serde(rename = "k")]
        method: String,
        /// Positional arguments.
        #[serde(rename = "a", default)]
        args: Vec<Value>,
    },
}

impl Request {
    /// Service this request addresses.
    pub fn service_id(&self) -> &ServiceId {
        match self {
            Self::Subscribe { service_id }
            | Self::Unsubscribe { service_id }
            | Self::Read { service_id, .. }
            | Self::Write { service_id, .. }
            | Self::Delete { service_id, .. }
            | Self::Call { service_id, .. } => service_id,
        }
    }

    /// Short operation name for logs and metrics labels.
    pub fn op_name(&self) -> &'static str {
        match self {
            Self::Subscribe { .. } => "subscribe",
            Self::Unsubscribe { .. } => "unsubscribe",
            Self::Read { .. } => "read",
            Self::Write { .. } => "write",
            Self::Delete { .. } => "delete",
            Self::Call { .. } => "call",
        }
    }
}

/// Server → client operations.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(tag = "o")]
pub enum Response {
    /// A data key has this value.
    #[serde(rename = "W")]
    Write {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Key.
        #[serde(rename = "k")]
        key: String,
        /// Current value.
        #[serde(rename = "v", default)]
        value: Value,
        /// Present when answering a `Read`.
        #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// The key is a remote method.
    #[serde(rename = "F")]
    AssignFunction {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Method name.
        #[serde(rename = "k")]
        key: String,
        /// Present when answering a `Read`.
        #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// The key no longer exists.
    #[serde(rename = "D")]
    Delete {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Removed key.
        #[serde(rename = "k")]
        key: String,
        /// Present when answering a `Read`.
        #[serde(rename = "i", default, skip_serializing_if = "Option::is_none")]
        call_id: Option<CallId>,
    },
    /// Initial synchronization finished.
    #[serde(rename = "Y")]
    Ready {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
    },
    /// A call completed.
    #[serde(rename = "C")]
    CallResult {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Correlation id of the originating call.
        #[serde(rename = "i")]
        call_id: CallId,
        /// Return value.
        #[serde(rename = "v", default)]
        value: Value,
    },
    /// A call failed.
    #[serde(rename = "X")]
    CallError {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Correlation id of the originating call.
        #[serde(rename = "i")]
        call_id: CallId,
        /// Error message reported by the server.
        #[serde(rename = "m")]
        message: String,
    },
    /// Out-of-band failure concerning the service or the connection.
    #[serde(rename = "E")]
    ServiceError {
        /// Source service.
        #[serde(rename = "s")]
        service_id: ServiceId,
        /// Error message.
        #[serde(rename = "m")]
        message: String,
    },
}

impl Response {
    /// Service this response concerns.
    pub fn service_id(&self) -> &ServiceId {
        match self {
            Self::Write { service_id, .. }
            | Self::AssignFunction { service_id, .. }
            | Self::Delete { service_id, .. }
            | Self::Ready { service_id }
            | Self::CallResult { service_id, .. }
            | Self::CallError { service_id, .. }
            | Self::ServiceError { service_id, .. } => service_id,
        }
    }

    /// Correlation id, if this response answers a call or a read.
    pub fn call_id(&self) -> Option<&CallId> {
        match self {
            Self::Write { call_id, .. }
            | Self::AssignFunction { call_id, .. }
            | Self::Delete { call_id, .. } => call_id.as_ref(),
            Self::CallResult { call_id, .. } | Self::CallError { call_id, .. } => Some(call_id),
            Self::Ready { .. } | Self::ServiceError { .. } => None,
        }
    }

    /// Key touched by a state-carrying response.
    pub fn key(&self) -> Option<&str> {
        match self {
            Self::Write { key, .. }
            | Self::AssignFunction { key, .. }
            | Self::Delete { key, .. } => {
                Some(key)
            }
            _ => None,
        }
    }
}
