//! Layered settings for the `entangle` binary.
//!
//! Compiled defaults, deep-merged with an optional JSON file, then
//! environment overrides:
//!
//! | Variable | Field |
//! |---|---|
//! | `ENTANGLE_HOST` | `server.host` |
//! | `ENTANGLE_PORT` | `server.port` |
//! | `ENTANGLE_CALL_TIMEOUT_MS` | `client.timeout_ms` |
//! | `ENTANGLE_CACHED` | `client.cached` |
//! | `ENTANGLE_LOG` | `log_level` |

use std::path::Path;

use entangle_client::ClientConfig;
use entangle_core::settings::{
    SettingsError, load_layered, read_env_bool, read_env_string, read_env_u16, read_env_u64,
};
use entangle_server::ServerConfig;
use serde::{Deserialize, Serialize};

/// Default settings file name, looked up in the working directory.
pub const DEFAULT_SETTINGS_FILE: &str = "entangle.json";

/// Everything the binary can be configured with.
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default, rename_all = "camelCase")]
pub struct EntangleSettings {
    /// `tracing` filter directive, e.g. `info` or `entangle_server=debug`.
    pub log_level: String,
    /// Server options for `serve`.
    pub server: ServerConfig,
    /// Client options for `watch`.
    pub client: ClientConfig,
}

impl Default for EntangleSettings {
    fn default() -> Self {
        Self {
            log_level: "info".into(),
            server: ServerConfig::default(),
            client: ClientConfig::default(),
        }
    }
}

/// Load settings from `path` (missing file means defaults) and apply
/// environment overrides.
pub fn load_settings_from_path(path: &Path) -> Result<EntangleSettings, SettingsError> {
    let mut settings: EntangleSettings = load_layered(path)?;
    apply_env_overrides(&mut settings);
    Ok(settings)
}

/// Apply `ENTANGLE_*` environment variables over `settings`.
pub fn apply_env_overrides(settings: &mut EntangleSettings) {
    if let Some(v) = read_env_string("ENTANGLE_HOST") {
        settings.server.host = v;
    }
    if let Some(v) = read_env_u16("ENTANGLE_PORT", 0, 65535) {
        settings.server.port = v;
    }
    if let Some(v) = read_env_u64("ENTANGLE_CALL_TIMEOUT_MS", 1, 3_600_000) {
        settings.client.timeout_ms = v;
    }
    if let Some(v) = read_env_bool("ENTANGLE_CACHED") {
        settings.client.cached = v;
    }
    if let Some(v) = read_env_string("ENTANGLE_LOG") {
        settings.log_level = v;
    }
}
