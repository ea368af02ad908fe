//! GTM Intelligence sync client
//!
//! Client-side real-time session synchronization: a WebSocket transport
//! with bounded reconnection, a session store with REST-first/local-
//! fallback mutations, a pure workflow-status reducer, and a lifecycle
//! controller that keeps the joined channel in step with the active
//! session.

pub mod cache;
pub mod config;
pub mod error;
pub mod lifecycle;
pub mod paths;
pub mod reducer;
pub mod rest;
pub mod store;
pub mod transport;

pub use config::SyncConfig;
pub use error::{CacheError, RestError, TransportError, ValidationError};
pub use lifecycle::LifecycleController;
pub use store::{
    IcpModelDraft, Notice, QueryUpdate, SessionStore, StartSearchOptions, StoreSnapshot,
};
pub use transport::{Phase, Transport};
