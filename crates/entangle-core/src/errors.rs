//! Error taxonomy shared by the client and server crates.

use thiserror::Error;

use crate::codec::CodecError;
use crate::ids::ServiceId;

/// Errors surfaced to callers of the mirror and store APIs.
#[derive(Debug, Error)]
pub enum EntangleError {
    /// A call was not answered before its deadline.
    #[error("call timed out")]
    Timeout,
    /// A send was attempted with no live transport.
    #[error("no connection available")]
    NotConnected,
    /// A method was assigned to a data key, or data to a method key.
    #[error("invalid assignment to \"{key}\"")]
    InvalidAssignment {
        /// Offending key.
        key: String,
    },
    /// The server reported a failure while executing a method.
    #[error("{message}")]
    RemoteCall {
        /// Message reported by the server.
        message: String,
    },
    /// The named member is not callable.
    #[error("\"{key}\" is not a function")]
    NotAFunction {
        /// Member name.
        key: String,
    },
    /// The member is not exposed to clients.
    #[error("member is not exposed")]
    NotReadable,
    /// The client already mirrors this service.
    #[error("already subscribed to {service_id}")]
    AlreadySubscribed {
        /// Service id.
        service_id: ServiceId,
    },
    /// The client does not mirror this service.
    #[error("not subscribed to {service_id}")]
    NotSubscribed {
        /// Service id.
        service_id: ServiceId,
    },
    /// The owning mirror was dropped while the call was pending.
    #[error("call cancelled")]
    Cancelled,
    /// The transport closed while the call was pending.
    #[error("connection lost")]
    ConnectionLost,
    /// Frame could not be encoded or decoded.
    #[error(transparent)]
    Codec(#[from] CodecError),
    /// Transport-level failure.
    #[error("transport error: {0}")]
    Transport(String),
}

impl EntangleError {
    /// Machine-readable error code.
    pub fn code(&self) -> &'static str {
        match self {
            Self::Timeout => "TIMEOUT",
            Self::NotConnected => "NOT_CONNECTED",
            Self::InvalidAssignment { .. } => "INVALID_ASSIGNMENT",
            Self::RemoteCall { .. } => "REMOTE_CALL_ERROR",
            Self::NotAFunction { .. } => "NOT_A_FUNCTION",
            Self::NotReadable => "NOT_READABLE",
            Self::AlreadySubscribed { .. } => "ALREADY_SUBSCRIBED",
            Self::NotSubscribed { .. } => "NOT_SUBSCRIBED",
            Self::Cancelled => "CANCELLED",
            Self::ConnectionLost => "CONNECTION_LOST",
            Self::Codec(_) => "CODEC_ERROR",
            Self::Transport(_) => "TRANSPORT_ERROR",
        }
    }

    /// Whether retrying the same operation may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Timeout | Self::NotConnected | Self::ConnectionLost | Self::Transport(_)
        )
    }
}

/// Result alias used across the workspace.
pub type Result<T> = std::result::Result<T, EntangleError>;

// ─────────────────────────────────────────────────────────────────────────────
// Tests
// ─────────────────────────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn remote_call_displays_message_only() {
        let err = EntangleError::RemoteCall {
            message: "boom".into(),
        };
        assert_eq!(err.to_string(), "boom");
        assert_eq!(err.code(), "REMOTE_CALL_ERROR");
    }

    #[test]
    fn not_a_function_names_key() {
        let err = EntangleError::NotAFunction { key: "count".into() };
        assert_eq!(err.to_string(), "\"count\" is not a function");
    }

    #[test]
    fn codec_error_converts() {
        let err: EntangleError = crate::codec::CodecError::Checksum.into();
        assert_eq!(err.code(), "CODEC_ERROR");
        assert_eq!(err.to_string(), "frame checksum mismatch");
    }

    #[test]
    fn already_subscribed_names_service() {
        let err = EntangleError::AlreadySubscribed {
            service_id: "data1".into(),
        };
        assert_eq!(err.to_string(), "already subscribed to data1");
    }

    #[test]
    fn retryable_classification() {
        assert!(EntangleError::Timeout.is_retryable());
        assert!(EntangleError::ConnectionLost.is_retryable());
        assert!(!EntangleError::Cancelled.is_retryable());
        assert!(!EntangleError::NotReadable.is_retryable());
    }

    #[test]
    fn codes_are_distinct() {
        let errs = [
            EntangleError::Timeout,
            EntangleError::NotConnected,
            EntangleError::InvalidAssignment { key: "k".into() },
            EntangleError::RemoteCall { message: "m".into() },
            EntangleError::NotAFunction { key: "k".into() },
            EntangleError::NotReadable,
            EntangleError::AlreadySubscribed {
                service_id: "s".into(),
            },
            EntangleError::NotSubscribed {
                service_id: "s".into(),
            },
            EntangleError::Cancelled,
            EntangleError::ConnectionLost,
            EntangleError::Transport("t".into()),
        ];
        let codes: std::collections::HashSet<_> = errs.iter().map(EntangleError::code).collect();
        assert_eq!(codes.len(), errs.len());
    }
}
