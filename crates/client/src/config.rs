//! Sync client configuration

use std::time::Duration;

pub const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(10);
pub const DEFAULT_JOIN_DELAY: Duration = Duration::from_millis(100);
pub const DEFAULT_RECONNECT_INTERVAL: Duration = Duration::from_secs(3);
pub const DEFAULT_MAX_RECONNECT_ATTEMPTS: u32 = 5;

/// Configuration for one sync client instance.
///
/// Resolved once at the composition root (CLI flags > `GTMINTEL_*` env >
/// defaults) and passed down by value.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// Base URL of the REST backend, e.g. `http://localhost:3000`.
    pub rest_base_url: String,
    /// WebSocket URL of the workflow server, e.g. `ws://localhost:3001/ws`.
    pub ws_url: String,
    /// Acting user id, sent as `x-user-id` and used as the join identity hint.
    pub user_id: String,
    /// Per-request REST timeout (abort on expiry).
    pub request_timeout: Duration,
    /// Settle delay between handshake completion and the automatic join.
    pub join_delay: Duration,
    /// Fixed delay between reconnect attempts. Not exponential.
    pub reconnect_interval: Duration,
    /// Reconnect attempts before giving up for good.
    pub max_reconnect_attempts: u32,
}

impl SyncConfig {
    pub fn new(
        rest_base_url: impl Into<String>,
        ws_url: impl Into<String>,
        user_id: impl Into<String>,
    ) -> Self {
        Self {
            rest_base_url: rest_base_url.into(),
            ws_url: ws_url.into(),
            user_id: user_id.into(),
            request_timeout: DEFAULT_REQUEST_TIMEOUT,
            join_delay: DEFAULT_JOIN_DELAY,
            reconnect_interval: DEFAULT_RECONNECT_INTERVAL,
            max_reconnect_attempts: DEFAULT_MAX_RECONNECT_ATTEMPTS,
        }
    }
}
