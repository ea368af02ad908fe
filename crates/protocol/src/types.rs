//! Core types shared across the protocol

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::Value;

/// Stage of a session's active search workflow.
///
/// The server may introduce stages this client does not know about yet;
/// those round-trip through `Other` without data loss.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "String", into = "String")]
pub enum WorkflowStage {
    Initial,
    Searching,
    Enriching,
    Scoring,
    Complete,
    Error,
    Other(String),
}

impl WorkflowStage {
    /// Terminal stages: no further events are expected after these.
    pub fn is_terminal(&self) -> bool {
        matches!(self, WorkflowStage::Complete | WorkflowStage::Error)
    }

    pub fn as_str(&self) -> &str {
        match self {
            WorkflowStage::Initial => "initial",
            WorkflowStage::Searching => "searching",
            WorkflowStage::Enriching => "enriching",
            WorkflowStage::Scoring => "scoring",
            WorkflowStage::Complete => "complete",
            WorkflowStage::Error => "error",
            WorkflowStage::Other(s) => s,
        }
    }
}

impl From<String> for WorkflowStage {
    fn from(value: String) -> Self {
        match value.as_str() {
            "initial" => WorkflowStage::Initial,
            "searching" => WorkflowStage::Searching,
            "enriching" => WorkflowStage::Enriching,
            "scoring" => WorkflowStage::Scoring,
            "complete" => WorkflowStage::Complete,
            "error" => WorkflowStage::Error,
            _ => WorkflowStage::Other(value),
        }
    }
}

impl From<WorkflowStage> for String {
    fn from(stage: WorkflowStage) -> Self {
        stage.as_str().to_string()
    }
}

/// Status of a single substep within a workflow stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum SubstepStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

/// A named unit of work within a workflow stage
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Substep {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub description: String,
    pub status: SubstepStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tools: Vec<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Partial update for a single substep, applied by id.
///
/// Fields left as `None` keep the current value on the matching substep.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubstepPatch {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<SubstepStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub category: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub priority: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<String>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub completed_at: Option<DateTime<Utc>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl SubstepPatch {
    /// Apply this patch to a substep. The patch's id must already have
    /// been matched against the target by the caller.
    pub fn apply_to(&self, substep: &mut Substep) {
        if let Some(name) = &self.name {
            substep.name = name.clone();
        }
        if let Some(description) = &self.description {
            substep.description = description.clone();
        }
        if let Some(status) = self.status {
            substep.status = status;
        }
        if let Some(category) = &self.category {
            substep.category = Some(category.clone());
        }
        if let Some(priority) = self.priority {
            substep.priority = Some(priority);
        }
        if let Some(tools) = &self.tools {
            substep.tools = tools.clone();
        }
        if let Some(metadata) = &self.metadata {
            substep.metadata = Some(metadata.clone());
        }
        if let Some(started_at) = self.started_at {
            substep.started_at = Some(started_at);
        }
        if let Some(completed_at) = self.completed_at {
            substep.completed_at = Some(completed_at);
        }
        if let Some(error) = &self.error {
            substep.error = Some(error.clone());
        }
    }
}

/// Live progress of a session's active search
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowStatus {
    pub stage: WorkflowStage,
    #[serde(default)]
    pub message: String,
    /// 0–100. Not enforced monotonic; each update replaces the value.
    #[serde(default)]
    pub progress: u8,
    #[serde(default)]
    pub current_step: u32,
    #[serde(default)]
    pub total_steps: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substeps: Option<Vec<Substep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

impl Default for WorkflowStatus {
    fn default() -> Self {
        Self {
            stage: WorkflowStage::Initial,
            message: String::new(),
            progress: 0,
            current_step: 0,
            total_steps: 0,
            substeps: None,
            details: None,
        }
    }
}

impl WorkflowStatus {
    /// Initial snapshot installed when a new search starts.
    pub fn searching(message: impl Into<String>, total_steps: u32) -> Self {
        Self {
            stage: WorkflowStage::Searching,
            message: message.into(),
            progress: 0,
            current_step: 0,
            total_steps,
            substeps: None,
            details: None,
        }
    }

    /// Shallow-merge an incoming delta over this status. Absent fields
    /// retain their previous values; an omitted substep list preserves
    /// the existing one.
    pub fn apply(&mut self, changes: StatusChanges) {
        if let Some(stage) = changes.stage {
            self.stage = stage;
        }
        if let Some(message) = changes.message {
            self.message = message;
        }
        if let Some(progress) = changes.progress {
            self.progress = progress.min(100);
        }
        if let Some(current_step) = changes.current_step {
            self.current_step = current_step;
        }
        if let Some(total_steps) = changes.total_steps {
            self.total_steps = total_steps;
        }
        if let Some(substeps) = changes.substeps {
            self.substeps = Some(substeps);
        }
        if let Some(details) = changes.details {
            self.details = Some(details);
        }
    }
}

/// Delta carried by a `workflow-status` event (shallow-merge semantics)
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusChanges {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stage: Option<WorkflowStage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub progress: Option<u8>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_step: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub total_steps: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub substeps: Option<Vec<Substep>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<String>,
}

/// A company entity in a session's result set
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Company {
    pub id: String,
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub domain: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub industry: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub employee_count: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub score: Option<f32>,
}

/// One user search thread: query history, results, live workflow status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Session {
    pub id: String,
    pub name: String,
    pub created_at: DateTime<Utc>,
    /// Ordered refinement history. Always a sequence; a legacy
    /// single-string form normalizes to a one-element vector on load.
    #[serde(default, deserialize_with = "string_or_seq")]
    pub query: Vec<String>,
    #[serde(default)]
    pub results_count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub companies: Option<Vec<Company>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<WorkflowStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub icp_model_id: Option<String>,
}

impl Session {
    /// Fresh session with no history. Used both for server-created
    /// sessions and for the offline synthetic fallback.
    pub fn new(id: String, name: String, created_at: DateTime<Utc>) -> Self {
        Self {
            id,
            name,
            created_at,
            query: Vec::new(),
            results_count: 0,
            companies: None,
            status: None,
            icp_model_id: None,
        }
    }
}

fn string_or_seq<'de, D>(deserializer: D) -> Result<Vec<String>, D::Error>
where
    D: Deserializer<'de>,
{
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum QueryRepr {
        One(String),
        Many(Vec<String>),
    }

    Ok(match QueryRepr::deserialize(deserializer)? {
        QueryRepr::One(q) => vec![q],
        QueryRepr::Many(qs) => qs,
    })
}

/// Inclusive numeric range with open ends
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NumericRange {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<u64>,
}

/// Scoring weight distribution, expressed as two complementary pairs.
///
/// `firmographic + technographic` and `intent + behavioral` each sum to
/// 100 when balanced. Editors derive one side of a pair from the other;
/// the type itself does not reject unbalanced values.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ScoringWeights {
    pub firmographic: u8,
    pub technographic: u8,
    pub intent: u8,
    pub behavioral: u8,
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            firmographic: 50,
            technographic: 50,
            intent: 50,
            behavioral: 50,
        }
    }
}

impl ScoringWeights {
    pub fn is_balanced(&self) -> bool {
        self.firmographic as u16 + self.technographic as u16 == 100
            && self.intent as u16 + self.behavioral as u16 == 100
    }
}

/// Target-company criteria for an ICP model
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpConfig {
    #[serde(default)]
    pub industries: Vec<String>,
    #[serde(default)]
    pub geographies: Vec<String>,
    #[serde(default)]
    pub employee_range: NumericRange,
    #[serde(default)]
    pub revenue_range: NumericRange,
    #[serde(default)]
    pub required_technologies: Vec<String>,
    #[serde(default)]
    pub excluded_technologies: Vec<String>,
    #[serde(default)]
    pub compliance_tags: Vec<String>,
    #[serde(default)]
    pub buying_triggers: Vec<String>,
    #[serde(default)]
    pub target_personas: Vec<String>,
    #[serde(default)]
    pub scoring_weights: ScoringWeights,
}

/// A saved ideal-customer-profile configuration
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct IcpModel {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub is_primary: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default)]
    pub config: IcpConfig,
}
