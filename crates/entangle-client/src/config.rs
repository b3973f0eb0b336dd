//! Client configuration.

use std::time::Duration;

use entangle_core::CodecOptions;
use serde::{Deserialize, Serialize};

/// Options for one [`Client`](crate::Client).
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    /// Default deadline for calls and fetches, in milliseconds.
    pub timeout_ms: u64,
    /// Connect immediately and reconnect whenever the transport closes.
    pub active: bool,
    /// Keep mirrored values visible while disconnected.
    pub cached: bool,
    /// Must match the server's codec options.
    pub codec: CodecOptions,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 10_000,
            active: true,
            cached: true,
            codec: CodecOptions::default(),
        }
    }
}

impl ClientConfig {
    /// Call deadline as a `Duration`.
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.timeout(), Duration::from_secs(10));
        assert!(config.active);
        assert!(config.cached);
        assert!(config.codec.salts.is_empty());
    }

    #[test]
    fn partial_json_keeps_defaults() {
        let config: ClientConfig = serde_json::from_str(r#"{"cached": false}"#).unwrap();
        assert!(!config.cached);
        assert!(config.active);
        assert_eq!(config.timeout_ms, 10_000);
    }
}
