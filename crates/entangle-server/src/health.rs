//! `/health` endpoint body.

use serde::Serialize;
use std::time::Instant;

/// Health check response body.
#[derive(Debug, Clone, Serialize)]
pub struct HealthResponse {
    /// Always `"ok"` when the server is running.
    pub status: String,
    /// Seconds since the server started.
    pub uptime_secs: u64,
    /// Live sessions.
    pub sessions: usize,
    /// Registered services.
    pub services: usize,
}

/// Build a health response from live counters.
pub fn health_check(start_time: Instant, sessions: usize, services: usize) -> HealthResponse {
    HealthResponse {
        status: "ok".into(),
        uptime_secs: start_time.elapsed().as_secs(),
        sessions,
        services,
    }
}
