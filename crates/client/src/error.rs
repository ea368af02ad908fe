//! Error types for the sync client

use thiserror::Error;

/// Transport-level failures. Abnormal closures are not errors — they feed
/// the reconnect loop; these are the cases a `connect()` caller can see.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("websocket error: {0}")]
    WebSocket(#[from] tokio_tungstenite::tungstenite::Error),

    /// A concurrent connection attempt we were waiting on failed.
    #[error("connection attempt failed")]
    ConnectFailed,
}

/// REST backend failures. Store mutation methods catch these internally
/// and fall back to local state; they only surface in direct REST calls.
#[derive(Debug, Error)]
pub enum RestError {
    #[error("request failed: {0}")]
    Http(#[from] reqwest::Error),

    #[error("backend returned {status}")]
    Status { status: reqwest::StatusCode },
}

/// User-input validation failures. The only errors store mutations are
/// allowed to return; surfaced to the user, never logged-and-swallowed.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("session name must not be empty")]
    EmptySessionName,

    #[error("search query must not be empty")]
    EmptyQuery,

    #[error("model name must not be empty")]
    EmptyModelName,

    #[error("unknown session: {0}")]
    UnknownSession(String),
}

/// Offline cache failures
#[derive(Debug, Error)]
pub enum CacheError {
    #[error("sqlite error: {0}")]
    Sqlite(#[from] rusqlite::Error),

    #[error("corrupt cache payload: {0}")]
    Decode(#[from] serde_json::Error),
}
