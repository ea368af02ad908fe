//! Client → Server messages

use serde::{Deserialize, Serialize};

/// Messages sent from client to server over the WebSocket channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ClientMessage {
    #[serde(rename_all = "camelCase")]
    JoinSession {
        session_id: String,
        #[serde(skip_serializing_if = "Option::is_none")]
        token: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    LeaveSession { session_id: String },
}

impl ClientMessage {
    pub fn join(session_id: impl Into<String>) -> Self {
        ClientMessage::JoinSession {
            session_id: session_id.into(),
            token: None,
        }
    }

    pub fn leave(session_id: impl Into<String>) -> Self {
        ClientMessage::LeaveSession {
            session_id: session_id.into(),
        }
    }
}
