//! Workflow graphs and the engine that walks beads through them.

pub mod defaults;
pub mod engine;
pub mod model;

pub use defaults::{builtin_workflows, ensure_default_workflows, workflow_for_bead, workflow_type_for_bead};
pub use engine::{AdvanceOutcome, EscalationInfo, MAX_CYCLES, WorkflowEngine, next_node};
pub use model::{
    EdgeCondition, ExecutionStatus, NodeType, Workflow, WorkflowEdge, WorkflowExecution,
    WorkflowHistoryEntry, WorkflowNode,
};
