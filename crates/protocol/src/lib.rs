//! GTM Intelligence Protocol
//!
//! Shared types for communication between the workflow server and its
//! sync clients. These types are serialized as JSON over WebSocket and
//! over the REST surface.

use uuid::Uuid;

// Re-exports
pub mod client;
pub mod server;
pub mod types;

pub use client::ClientMessage;
pub use server::{EventKind, ServerMessage};
pub use types::*;

/// Identity hint used before a real user id is known. The transport never
/// auto-joins a channel for this placeholder.
pub const ANONYMOUS_USER: &str = "anonymous";

/// Generate a new unique ID
pub fn new_id() -> String {
    Uuid::new_v4().to_string()
}
