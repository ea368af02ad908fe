//! Server → Client messages

use serde::{Deserialize, Serialize};

use crate::types::{Company, StatusChanges, Substep, SubstepPatch};

/// Messages pushed from the workflow server to clients
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ServerMessage {
    /// Handshake acknowledgement
    Connected,

    #[serde(rename_all = "camelCase")]
    SessionJoined { session_id: String },

    /// Incremental workflow progress (shallow-merge delta)
    #[serde(rename_all = "camelCase")]
    WorkflowStatus {
        session_id: String,
        data: StatusChanges,
    },

    /// Wholesale replacement of a session's substep list
    #[serde(rename_all = "camelCase")]
    WorkflowSubsteps {
        session_id: String,
        data: Vec<Substep>,
    },

    /// Patch of a single substep, matched by id
    #[serde(rename_all = "camelCase")]
    WorkflowSubstep {
        session_id: String,
        data: SubstepPatch,
    },

    #[serde(rename_all = "camelCase")]
    SearchComplete {
        session_id: String,
        #[serde(default)]
        companies: Vec<Company>,
        #[serde(default)]
        results_count: u64,
        #[serde(skip_serializing_if = "Option::is_none")]
        summary: Option<String>,
    },

    Error {
        #[serde(alias = "error")]
        message: String,
    },
}

/// Closed set of inbound event kinds, used as the key of the transport's
/// handler registry. Adding a `ServerMessage` variant forces a match arm
/// here, so dispatch coverage is checked at compile time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    Connected,
    SessionJoined,
    WorkflowStatus,
    WorkflowSubsteps,
    WorkflowSubstep,
    SearchComplete,
    Error,
}

impl ServerMessage {
    pub fn kind(&self) -> EventKind {
        match self {
            ServerMessage::Connected => EventKind::Connected,
            ServerMessage::SessionJoined { .. } => EventKind::SessionJoined,
            ServerMessage::WorkflowStatus { .. } => EventKind::WorkflowStatus,
            ServerMessage::WorkflowSubsteps { .. } => EventKind::WorkflowSubsteps,
            ServerMessage::WorkflowSubstep { .. } => EventKind::WorkflowSubstep,
            ServerMessage::SearchComplete { .. } => EventKind::SearchComplete,
            ServerMessage::Error { .. } => EventKind::Error,
        }
    }

    /// Session id the event addresses, if it addresses one.
    pub fn session_id(&self) -> Option<&str> {
        match self {
            ServerMessage::SessionJoined { session_id }
            | ServerMessage::WorkflowStatus { session_id, .. }
            | ServerMessage::WorkflowSubsteps { session_id, .. }
            | ServerMessage::WorkflowSubstep { session_id, .. }
            | ServerMessage::SearchComplete { session_id, .. } => Some(session_id),
            ServerMessage::Connected | ServerMessage::Error { .. } => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::{SubstepStatus, WorkflowStage};

    #[test]
    fn parses_workflow_status_event() {
        let json = r#"{
            "type": "workflow-status",
            "sessionId": "sess-1",
            "data": {
                "stage": "enriching",
                "message": "Enriching 42 companies",
                "progress": 60,
                "currentStep": 2,
                "totalSteps": 4
            }
        }"#;

        let parsed: ServerMessage = serde_json::from_str(json).expect("parse workflow-status");
        match &parsed {
            ServerMessage::WorkflowStatus { session_id, data } => {
                assert_eq!(session_id, "sess-1");
                assert_eq!(data.stage, Some(WorkflowStage::Enriching));
                assert_eq!(data.progress, Some(60));
                assert!(data.substeps.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
        assert_eq!(parsed.kind(), EventKind::WorkflowStatus);
        assert_eq!(parsed.session_id(), Some("sess-1"));
    }

    #[test]
    fn parses_workflow_substep_patch() {
        let json = r#"{
            "type": "workflow-substep",
            "sessionId": "sess-1",
            "data": {"id": "sub1", "status": "completed"}
        }"#;

        let parsed: ServerMessage = serde_json::from_str(json).expect("parse workflow-substep");
        match parsed {
            ServerMessage::WorkflowSubstep { data, .. } => {
                assert_eq!(data.id, "sub1");
                assert_eq!(data.status, Some(SubstepStatus::Completed));
                assert!(data.name.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn parses_search_complete_with_defaults() {
        let json = r#"{"type": "search-complete", "sessionId": "sess-1"}"#;
        let parsed: ServerMessage = serde_json::from_str(json).expect("parse search-complete");
        match parsed {
            ServerMessage::SearchComplete {
                session_id,
                companies,
                results_count,
                summary,
            } => {
                assert_eq!(session_id, "sess-1");
                assert!(companies.is_empty());
                assert_eq!(results_count, 0);
                assert!(summary.is_none());
            }
            other => panic!("unexpected variant: {:?}", other),
        }
    }

    #[test]
    fn error_accepts_both_field_spellings() {
        let from_message: ServerMessage =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).expect("parse");
        let from_error: ServerMessage =
            serde_json::from_str(r#"{"type":"error","error":"boom"}"#).expect("parse");
        assert_eq!(from_message, from_error);
    }

    #[test]
    fn connected_has_no_session_id() {
        let parsed: ServerMessage = serde_json::from_str(r#"{"type":"connected"}"#).expect("parse");
        assert_eq!(parsed.kind(), EventKind::Connected);
        assert!(parsed.session_id().is_none());
    }
}
