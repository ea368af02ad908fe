//! Pure workflow-status reducer
//!
//! All merge logic for server-pushed progress events lives here as a
//! pure, synchronous function: `reduce(status, input) -> (status, effects)`.
//! No IO, no async, no locking — fully unit-testable. The store owns the
//! active-session guard and executes the returned effects.

use tracing::debug;

use gtmintel_protocol::{
    StatusChanges, Substep, SubstepPatch, WorkflowStage, WorkflowStatus,
};

/// One inbound progress event, already matched to the active session.
#[derive(Debug, Clone)]
pub enum Input {
    /// Shallow-merge delta from a `workflow-status` event.
    Status(StatusChanges),
    /// Wholesale substep-list replacement from `workflow-substeps`.
    SubstepsReplaced(Vec<Substep>),
    /// Single-substep patch from `workflow-substep`.
    SubstepPatched(SubstepPatch),
    /// Terminal `search-complete` notification.
    SearchComplete {
        results_count: u64,
        summary: Option<String>,
    },
}

/// IO the caller must perform after folding the event in.
#[derive(Debug, Clone, PartialEq)]
pub enum Effect {
    /// Re-fetch the full session list — final result consistency comes
    /// from the backend, not from the event payload.
    RefreshSessions,
    /// Tell the user something they asked for finished (or failed).
    Notify(String),
}

/// Fold one event into a session's status.
///
/// Stage transitions are not validated: any stage value overwrites the
/// previous one, and nothing is structurally prevented after `complete`
/// or `error`.
pub fn reduce(
    status: Option<WorkflowStatus>,
    input: Input,
) -> (Option<WorkflowStatus>, Vec<Effect>) {
    match input {
        Input::Status(changes) => {
            let mut status = status.unwrap_or_default();
            status.apply(changes);
            (Some(status), Vec::new())
        }

        Input::SubstepsReplaced(substeps) => {
            let mut status = status.unwrap_or_default();
            status.substeps = Some(substeps);
            (Some(status), Vec::new())
        }

        Input::SubstepPatched(patch) => {
            let mut status = status.unwrap_or_default();
            let substeps = status.substeps.get_or_insert_with(Vec::new);
            match substeps.iter_mut().find(|s| s.id == patch.id) {
                Some(substep) => patch.apply_to(substep),
                None => {
                    // Unknown id: drop the patch; the next wholesale
                    // replace or refresh restores consistency.
                    debug!(
                        component = "reducer",
                        event = "reducer.substep.unknown_id",
                        substep_id = %patch.id,
                        "Dropping patch for unknown substep"
                    );
                }
            }
            (Some(status), Vec::new())
        }

        Input::SearchComplete {
            results_count,
            summary,
        } => {
            let mut status = status.unwrap_or_default();
            status.stage = WorkflowStage::Complete;
            status.progress = 100;
            status.message = summary
                .clone()
                .unwrap_or_else(|| format!("Search complete: {} companies", results_count));

            let notice = summary
                .unwrap_or_else(|| format!("Search complete — {} companies found", results_count));

            (
                Some(status),
                vec![Effect::RefreshSessions, Effect::Notify(notice)],
            )
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gtmintel_protocol::SubstepStatus;

    fn substep(id: &str, status: SubstepStatus) -> Substep {
        Substep {
            id: id.to_string(),
            name: format!("step {}", id),
            description: String::new(),
            status,
            category: None,
            priority: None,
            tools: Vec::new(),
            metadata: None,
            started_at: None,
            completed_at: None,
            error: None,
        }
    }

    #[test]
    fn status_event_merges_over_previous() {
        let previous = WorkflowStatus {
            stage: WorkflowStage::Searching,
            message: "Finding companies".to_string(),
            progress: 40,
            current_step: 1,
            total_steps: 3,
            substeps: Some(vec![substep("sub1", SubstepStatus::InProgress)]),
            details: None,
        };

        let (next, effects) = reduce(
            Some(previous),
            Input::Status(StatusChanges {
                stage: Some(WorkflowStage::Enriching),
                progress: Some(70),
                current_step: Some(2),
                ..Default::default()
            }),
        );

        let next = next.expect("status present");
        assert_eq!(next.stage, WorkflowStage::Enriching);
        assert_eq!(next.progress, 70);
        assert_eq!(next.current_step, 2);
        // Absent fields retained, including the substep list
        assert_eq!(next.message, "Finding companies");
        assert_eq!(next.total_steps, 3);
        assert_eq!(next.substeps.as_ref().unwrap().len(), 1);
        assert!(effects.is_empty());
    }

    #[test]
    fn first_status_event_creates_status_from_defaults() {
        let (next, _) = reduce(
            None,
            Input::Status(StatusChanges {
                stage: Some(WorkflowStage::Searching),
                message: Some("Starting".to_string()),
                ..Default::default()
            }),
        );

        let next = next.expect("status created");
        assert_eq!(next.stage, WorkflowStage::Searching);
        assert_eq!(next.message, "Starting");
        assert_eq!(next.progress, 0);
    }

    #[test]
    fn stage_overwrites_without_validation() {
        // complete -> searching is accepted; the reducer does not police
        // transition legality.
        let done = WorkflowStatus {
            stage: WorkflowStage::Complete,
            ..Default::default()
        };
        let (next, _) = reduce(
            Some(done),
            Input::Status(StatusChanges {
                stage: Some(WorkflowStage::Searching),
                ..Default::default()
            }),
        );
        assert_eq!(next.unwrap().stage, WorkflowStage::Searching);
    }

    #[test]
    fn substeps_replaced_swaps_entire_list() {
        let previous = WorkflowStatus {
            substeps: Some(vec![
                substep("old1", SubstepStatus::Completed),
                substep("old2", SubstepStatus::Completed),
            ]),
            ..Default::default()
        };

        let (next, _) = reduce(
            Some(previous),
            Input::SubstepsReplaced(vec![substep("new1", SubstepStatus::Pending)]),
        );

        let substeps = next.unwrap().substeps.unwrap();
        assert_eq!(substeps.len(), 1);
        assert_eq!(substeps[0].id, "new1");
    }

    #[test]
    fn substep_patch_changes_only_target_and_preserves_order() {
        let previous = WorkflowStatus {
            substeps: Some(vec![
                substep("sub0", SubstepStatus::Completed),
                substep("sub1", SubstepStatus::InProgress),
                substep("sub2", SubstepStatus::Pending),
            ]),
            ..Default::default()
        };

        let (next, _) = reduce(
            Some(previous),
            Input::SubstepPatched(SubstepPatch {
                id: "sub1".to_string(),
                status: Some(SubstepStatus::Completed),
                ..Default::default()
            }),
        );

        let substeps = next.unwrap().substeps.unwrap();
        assert_eq!(substeps.len(), 3);
        assert_eq!(substeps[0].id, "sub0");
        assert_eq!(substeps[0].status, SubstepStatus::Completed);
        assert_eq!(substeps[1].id, "sub1");
        assert_eq!(substeps[1].status, SubstepStatus::Completed);
        assert_eq!(substeps[2].id, "sub2");
        assert_eq!(substeps[2].status, SubstepStatus::Pending);
    }

    #[test]
    fn substep_patch_for_unknown_id_is_dropped() {
        let previous = WorkflowStatus {
            substeps: Some(vec![substep("sub1", SubstepStatus::InProgress)]),
            ..Default::default()
        };

        let (next, _) = reduce(
            Some(previous.clone()),
            Input::SubstepPatched(SubstepPatch {
                id: "ghost".to_string(),
                status: Some(SubstepStatus::Failed),
                ..Default::default()
            }),
        );

        assert_eq!(next.unwrap().substeps, previous.substeps);
    }

    #[test]
    fn search_complete_emits_refresh_and_notice() {
        let (next, effects) = reduce(
            Some(WorkflowStatus {
                stage: WorkflowStage::Scoring,
                progress: 90,
                ..Default::default()
            }),
            Input::SearchComplete {
                results_count: 17,
                summary: None,
            },
        );

        let next = next.unwrap();
        assert_eq!(next.stage, WorkflowStage::Complete);
        assert_eq!(next.progress, 100);
        assert_eq!(effects.len(), 2);
        assert_eq!(effects[0], Effect::RefreshSessions);
        assert!(matches!(
            &effects[1],
            Effect::Notify(msg) if msg.contains("17")
        ));
    }

    #[test]
    fn search_complete_prefers_server_summary() {
        let (_, effects) = reduce(
            None,
            Input::SearchComplete {
                results_count: 5,
                summary: Some("Found 5 fintech prospects".to_string()),
            },
        );

        assert!(matches!(
            &effects[1],
            Effect::Notify(msg) if msg == "Found 5 fintech prospects"
        ));
    }
}
