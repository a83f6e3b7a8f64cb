//! Workflow graph and execution types.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Kind of work a node represents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum NodeType {
    Task,
    /// Waits for an approval; never auto-redispatched.
    Approval,
    Verify,
    Commit,
    Terminal,
}

impl NodeType {
    pub fn as_str(&self) -> &'static str {
        match self {
            NodeType::Task => "task",
            NodeType::Approval => "approval",
            NodeType::Verify => "verify",
            NodeType::Commit => "commit",
            NodeType::Terminal => "terminal",
        }
    }
}

impl std::str::FromStr for NodeType {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "task" => Ok(NodeType::Task),
            "approval" => Ok(NodeType::Approval),
            "verify" => Ok(NodeType::Verify),
            "commit" => Ok(NodeType::Commit),
            "terminal" => Ok(NodeType::Terminal),
            other => Err(format!("unknown node type '{}'", other)),
        }
    }
}

/// Outcome that selects an outgoing edge.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EdgeCondition {
    Success,
    Failure,
    Timeout,
    Approved,
    Rejected,
    Escalate,
}

impl EdgeCondition {
    pub fn as_str(&self) -> &'static str {
        match self {
            EdgeCondition::Success => "success",
            EdgeCondition::Failure => "failure",
            EdgeCondition::Timeout => "timeout",
            EdgeCondition::Approved => "approved",
            EdgeCondition::Rejected => "rejected",
            EdgeCondition::Escalate => "escalate",
        }
    }
}

impl std::str::FromStr for EdgeCondition {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "success" => Ok(EdgeCondition::Success),
            "failure" => Ok(EdgeCondition::Failure),
            "timeout" => Ok(EdgeCondition::Timeout),
            "approved" => Ok(EdgeCondition::Approved),
            "rejected" => Ok(EdgeCondition::Rejected),
            "escalate" => Ok(EdgeCondition::Escalate),
            other => Err(format!("unknown edge condition '{}'", other)),
        }
    }
}

impl std::fmt::Display for EdgeCondition {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowNode {
    pub id: String,
    pub workflow_id: String,
    /// Unique within the workflow.
    pub node_key: String,
    pub node_type: NodeType,
    pub role_required: String,
    pub persona_hint: String,
    /// Zero means unlimited.
    pub max_attempts: u32,
    /// Zero means no timeout.
    pub timeout_minutes: u32,
    pub instructions: String,
    pub metadata: BTreeMap<String, String>,
}

impl WorkflowNode {
    pub fn new(workflow_id: &str, node_key: &str, node_type: NodeType, role: &str) -> Self {
        Self {
            id: format!("{}:{}", workflow_id, node_key),
            workflow_id: workflow_id.to_string(),
            node_key: node_key.to_string(),
            node_type,
            role_required: role.to_string(),
            persona_hint: String::new(),
            max_attempts: 0,
            timeout_minutes: 0,
            instructions: String::new(),
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    pub fn with_timeout_minutes(mut self, minutes: u32) -> Self {
        self.timeout_minutes = minutes;
        self
    }

    pub fn with_instructions(mut self, instructions: impl Into<String>) -> Self {
        self.instructions = instructions.into();
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowEdge {
    pub id: String,
    pub workflow_id: String,
    /// Empty means the workflow start.
    pub from_node_key: String,
    /// Empty means workflow completion.
    pub to_node_key: String,
    pub condition: EdgeCondition,
    /// Higher wins when several edges match.
    pub priority: i32,
}

impl WorkflowEdge {
    pub fn new(workflow_id: &str, from: &str, to: &str, condition: EdgeCondition) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.to_string(),
            from_node_key: from.to_string(),
            to_node_key: to.to_string(),
            condition,
            priority: 0,
        }
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

/// A workflow graph template.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Workflow {
    pub id: String,
    pub name: String,
    pub description: String,
    /// e.g. `bug`, `feature`, `ui`.
    pub workflow_type: String,
    pub is_default: bool,
    /// Empty for global workflows.
    pub project_id: String,
    pub nodes: Vec<WorkflowNode>,
    /// Insertion order is significant for tie-breaking.
    pub edges: Vec<WorkflowEdge>,
}

impl Workflow {
    pub fn new(id: impl Into<String>, name: impl Into<String>, workflow_type: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            name: name.into(),
            description: String::new(),
            workflow_type: workflow_type.into(),
            is_default: false,
            project_id: String::new(),
            nodes: Vec::new(),
            edges: Vec::new(),
        }
    }

    pub fn node(&self, node_key: &str) -> Option<&WorkflowNode> {
        self.nodes.iter().find(|n| n.node_key == node_key)
    }

    /// Add a node, keyed inside this workflow.
    pub fn add_node(&mut self, node_key: &str, node_type: NodeType, role: &str) -> &mut WorkflowNode {
        let node = WorkflowNode::new(&self.id, node_key, node_type, role);
        self.nodes.push(node);
        let last = self.nodes.len() - 1;
        &mut self.nodes[last]
    }

    /// Add an edge with default priority.
    pub fn add_edge(&mut self, from: &str, to: &str, condition: EdgeCondition) -> &mut WorkflowEdge {
        let edge = WorkflowEdge::new(&self.id, from, to, condition);
        self.edges.push(edge);
        let last = self.edges.len() - 1;
        &mut self.edges[last]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutionStatus {
    Active,
    Completed,
    Escalated,
}

impl ExecutionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ExecutionStatus::Active => "active",
            ExecutionStatus::Completed => "completed",
            ExecutionStatus::Escalated => "escalated",
        }
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, ExecutionStatus::Completed | ExecutionStatus::Escalated)
    }
}

impl std::str::FromStr for ExecutionStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "active" => Ok(ExecutionStatus::Active),
            "completed" => Ok(ExecutionStatus::Completed),
            "escalated" => Ok(ExecutionStatus::Escalated),
            other => Err(format!("unknown execution status '{}'", other)),
        }
    }
}

impl std::fmt::Display for ExecutionStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Live state of a workflow applied to one bead.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowExecution {
    pub id: String,
    pub workflow_id: String,
    /// Unique: at most one execution per bead.
    pub bead_id: String,
    pub project_id: String,
    /// Empty while at the start.
    pub current_node_key: String,
    pub status: ExecutionStatus,
    pub cycle_count: u32,
    pub node_attempt_count: u32,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
    pub escalated_at: Option<DateTime<Utc>>,
    pub last_node_at: DateTime<Utc>,
}

/// Append-only record of a node transition.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowHistoryEntry {
    pub id: String,
    pub execution_id: String,
    /// The node being left.
    pub node_key: String,
    pub agent_id: String,
    pub condition: EdgeCondition,
    pub result_data: serde_json::Value,
    pub attempt_number: u32,
    pub created_at: DateTime<Utc>,
}
