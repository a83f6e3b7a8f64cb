//! Beads: atomic units of work and their orchestration context.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Recognized keys of the bead context namespace.
///
/// The context is an open string map; only these keys carry meaning for the
/// orchestrator. Unknown keys are preserved on write.
pub mod ctx {
    pub const WORKFLOW_ID: &str = "workflow_id";
    pub const WORKFLOW_EXEC_ID: &str = "workflow_exec_id";
    pub const WORKFLOW_NODE: &str = "workflow_node";
    pub const WORKFLOW_STATUS: &str = "workflow_status";
    pub const CYCLE_COUNT: &str = "cycle_count";
    pub const REQUIRED_ROLE: &str = "required_role";
    pub const REDISPATCH_REQUESTED: &str = "redispatch_requested";
    pub const DISPATCH_COUNT: &str = "dispatch_count";
    pub const LOOP_DETECTED: &str = "loop_detected";
    pub const LOOP_DETECTED_REASON: &str = "loop_detected_reason";
    pub const RALPH_BLOCKED_AT: &str = "ralph_blocked_at";
    pub const RALPH_BLOCKED_REASON: &str = "ralph_blocked_reason";
    pub const ESCALATED_TO_CEO_DECISION_ID: &str = "escalated_to_ceo_decision_id";
    pub const ESCALATION_REASON: &str = "escalation_reason";
    pub const ESCALATED_AT: &str = "escalated_at";
    pub const NEEDS_CEO_REVIEW: &str = "needs_ceo_review";
    pub const ERROR_HISTORY: &str = "error_history";
    pub const CI_RUN_ID: &str = "ci_run_id";
    pub const DECISION_FOR_BEAD: &str = "decision_for_bead";
    pub const DECISION_RESOLUTION: &str = "decision_resolution";
}

/// Bead priority. `P0` is the most urgent; the derived ordering sorts it first.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum Priority {
    P0,
    P1,
    P2,
    P3,
}

impl Priority {
    pub fn as_str(&self) -> &'static str {
        match self {
            Priority::P0 => "P0",
            Priority::P1 => "P1",
            Priority::P2 => "P2",
            Priority::P3 => "P3",
        }
    }
}

impl std::str::FromStr for Priority {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "P0" => Ok(Priority::P0),
            "P1" => Ok(Priority::P1),
            "P2" => Ok(Priority::P2),
            "P3" => Ok(Priority::P3),
            other => Err(format!("unknown priority '{}'", other)),
        }
    }
}

impl std::fmt::Display for Priority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Lifecycle status of a bead.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BeadStatus {
    Open,
    InProgress,
    Blocked,
    Closed,
}

impl BeadStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            BeadStatus::Open => "open",
            BeadStatus::InProgress => "in_progress",
            BeadStatus::Blocked => "blocked",
            BeadStatus::Closed => "closed",
        }
    }

    /// Open and in-progress beads are candidates for dispatch.
    pub fn is_active(&self) -> bool {
        matches!(self, BeadStatus::Open | BeadStatus::InProgress)
    }
}

impl std::str::FromStr for BeadStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(BeadStatus::Open),
            "in_progress" => Ok(BeadStatus::InProgress),
            "blocked" => Ok(BeadStatus::Blocked),
            "closed" => Ok(BeadStatus::Closed),
            other => Err(format!("unknown bead status '{}'", other)),
        }
    }
}

impl std::fmt::Display for BeadStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An atomic unit of work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Bead {
    pub id: String,
    pub project_id: String,
    pub title: String,
    pub description: String,
    pub priority: Priority,
    /// Free-form tag such as `bug`, `feature`, or `decision`.
    #[serde(rename = "type")]
    pub bead_type: String,
    pub status: BeadStatus,
    /// Agent id, or empty when unassigned.
    pub assigned_to: String,
    /// Orchestration state; see [`ctx`] for recognized keys.
    pub context: BTreeMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bead {
    /// Create a new open bead (not persisted yet).
    pub fn new(
        project_id: impl Into<String>,
        title: impl Into<String>,
        priority: Priority,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: new_bead_id(),
            project_id: project_id.into(),
            title: title.into(),
            description: String::new(),
            priority,
            bead_type: "task".to_string(),
            status: BeadStatus::Open,
            assigned_to: String::new(),
            context: BTreeMap::new(),
            created_at: now,
            updated_at: now,
        }
    }

    pub fn with_type(mut self, bead_type: impl Into<String>) -> Self {
        self.bead_type = bead_type.into();
        self
    }

    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = description.into();
        self
    }

    /// Read a context value, empty when unset.
    pub fn ctx(&self, key: &str) -> &str {
        self.context.get(key).map(String::as_str).unwrap_or("")
    }

    pub fn set_ctx(&mut self, key: &str, value: impl Into<String>) {
        self.context.insert(key.to_string(), value.into());
    }

    /// True when the context value is the literal `"true"`.
    pub fn ctx_flag(&self, key: &str) -> bool {
        self.ctx(key) == "true"
    }

    pub fn dispatch_count(&self) -> u32 {
        self.ctx(ctx::DISPATCH_COUNT).parse().unwrap_or(0)
    }

    pub fn is_ralph_blocked(&self) -> bool {
        !self.ctx(ctx::RALPH_BLOCKED_AT).is_empty()
    }

    pub fn is_assigned(&self) -> bool {
        !self.assigned_to.is_empty()
    }

    /// Parse `ralph_blocked_at` as an RFC 3339 timestamp.
    pub fn ralph_blocked_at(&self) -> Option<DateTime<Utc>> {
        DateTime::parse_from_rfc3339(self.ctx(ctx::RALPH_BLOCKED_AT))
            .ok()
            .map(|t| t.with_timezone(&Utc))
    }
}

/// Generate a short, human-friendly bead id (`bd-` plus 8 hex chars).
pub fn new_bead_id() -> String {
    let id = uuid::Uuid::new_v4().simple().to_string();
    format!("bd-{}", &id[..8])
}
