//! Built-in workflows and the per-bead workflow heuristic.

use crate::db::Database;
use crate::error::{DatabaseError, WorkflowError};
use crate::model::Bead;
use crate::workflow::model::{EdgeCondition, NodeType, Workflow, WorkflowNode};

pub const BUG: &str = "bug";
pub const FEATURE: &str = "feature";
pub const UI: &str = "ui";

const BUG_WORDS: &[&str] = &["bug", "fix", "error", "crash"];
const UI_WORDS: &[&str] = &["ui", "css", "frontend", "design"];

fn word_matches(word: &str, keyword: &str) -> bool {
    word == keyword
        || word.strip_suffix('s') == Some(keyword)
        || word.strip_suffix("es") == Some(keyword)
}

fn title_mentions(title: &str, keywords: &[&str]) -> bool {
    title
        .to_lowercase()
        .split(|c: char| !c.is_alphanumeric())
        .any(|word| keywords.iter().any(|k| word_matches(word, k)))
}

/// Workflow type for a bead: `bug` for bug beads or bug-sounding titles,
/// `ui` for interface work, `feature` otherwise.
pub fn workflow_type_for_bead(bead: &Bead) -> &'static str {
    if bead.bead_type.eq_ignore_ascii_case(BUG) || title_mentions(&bead.title, BUG_WORDS) {
        BUG
    } else if title_mentions(&bead.title, UI_WORDS) {
        UI
    } else {
        FEATURE
    }
}

fn bug_workflow() -> Workflow {
    let mut wf = Workflow::new("wf-bug", "Bug fix", BUG);
    wf.description = "Investigate, fix, and verify a defect".to_string();
    wf.is_default = true;
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "investigate", NodeType::Task, "developer")
            .with_instructions("Reproduce the problem and find its root cause."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "fix", NodeType::Task, "developer")
            .with_max_attempts(3)
            .with_timeout_minutes(60)
            .with_instructions("Implement the fix with a regression test."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "verify", NodeType::Verify, "qa-engineer")
            .with_instructions("Confirm the fix and run the test suite."),
    );

    wf.add_edge("", "investigate", EdgeCondition::Success);
    wf.add_edge("investigate", "fix", EdgeCondition::Success);
    wf.add_edge("fix", "verify", EdgeCondition::Success);
    wf.add_edge("fix", "investigate", EdgeCondition::Failure);
    wf.add_edge("fix", "investigate", EdgeCondition::Timeout);
    wf.add_edge("verify", "", EdgeCondition::Success);
    wf.add_edge("verify", "fix", EdgeCondition::Failure);
    wf
}

fn feature_workflow() -> Workflow {
    let mut wf = Workflow::new("wf-feature", "Feature delivery", FEATURE);
    wf.description = "Design, approve, implement, review, and commit a feature".to_string();
    wf.is_default = true;
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "design", NodeType::Task, "engineering-manager")
            .with_instructions("Write a short design covering scope and risks."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "approve", NodeType::Approval, "cto")
            .with_instructions("Approve or reject the design."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "implement", NodeType::Task, "developer")
            .with_max_attempts(3)
            .with_instructions("Implement the approved design with tests."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "review", NodeType::Verify, "engineering-manager")
            .with_instructions("Review the change for correctness and style."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "commit", NodeType::Commit, "developer")
            .with_instructions("Commit and push the reviewed change."),
    );

    wf.add_edge("", "design", EdgeCondition::Success);
    wf.add_edge("design", "approve", EdgeCondition::Success);
    wf.add_edge("approve", "implement", EdgeCondition::Approved);
    wf.add_edge("approve", "implement", EdgeCondition::Success);
    wf.add_edge("approve", "design", EdgeCondition::Rejected);
    wf.add_edge("implement", "review", EdgeCondition::Success);
    wf.add_edge("review", "commit", EdgeCondition::Success);
    wf.add_edge("review", "implement", EdgeCondition::Failure);
    wf.add_edge("commit", "", EdgeCondition::Success);
    wf
}

fn ui_workflow() -> Workflow {
    let mut wf = Workflow::new("wf-ui", "UI change", UI);
    wf.description = "Design, implement, and review an interface change".to_string();
    wf.is_default = true;
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "design", NodeType::Task, "designer")
            .with_instructions("Sketch the interface change."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "implement", NodeType::Task, "developer")
            .with_max_attempts(3)
            .with_instructions("Build the interface change."),
    );
    wf.nodes.push(
        WorkflowNode::new(&wf.id, "review", NodeType::Verify, "designer")
            .with_instructions("Check the result against the design."),
    );

    wf.add_edge("", "design", EdgeCondition::Success);
    wf.add_edge("design", "implement", EdgeCondition::Success);
    wf.add_edge("implement", "review", EdgeCondition::Success);
    wf.add_edge("review", "", EdgeCondition::Success);
    wf.add_edge("review", "implement", EdgeCondition::Failure);
    wf
}

/// The built-in workflows.
pub fn builtin_workflows() -> Vec<Workflow> {
    vec![bug_workflow(), feature_workflow(), ui_workflow()]
}

/// Store any built-in workflow that is missing. Returns the ones written.
pub async fn ensure_default_workflows(db: &dyn Database) -> Result<Vec<String>, DatabaseError> {
    let mut written = Vec::new();
    for workflow in builtin_workflows() {
        match db.get_workflow(&workflow.id).await {
            Ok(_) => {}
            Err(e) if e.is_not_found() => {
                db.upsert_workflow(&workflow).await?;
                tracing::info!(workflow_id = %workflow.id, "Seeded default workflow");
                written.push(workflow.id);
            }
            Err(e) => return Err(e),
        }
    }
    Ok(written)
}

/// The workflow a bead should run: a project default of the bead's type,
/// then a global default, then the built-in one (seeded on demand).
pub async fn workflow_for_bead(db: &dyn Database, bead: &Bead) -> Result<Workflow, WorkflowError> {
    let wanted = workflow_type_for_bead(bead);
    let workflows = db.list_workflows().await?;
    let pick = |project: &str| {
        workflows
            .iter()
            .find(|w| w.workflow_type == wanted && w.is_default && w.project_id == project)
            .cloned()
    };
    if let Some(wf) = pick(&bead.project_id).or_else(|| pick("")) {
        return Ok(wf);
    }
    ensure_default_workflows(db).await?;
    builtin_workflows()
        .into_iter()
        .find(|w| w.workflow_type == wanted)
        .ok_or_else(|| WorkflowError::WorkflowNotFound(wanted.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;
    use crate::model::Priority;

    #[test]
    fn test_heuristic() {
        let bead = Bead::new("p", "Crash when saving", Priority::P1);
        assert_eq!(workflow_type_for_bead(&bead), BUG);
        let bead = Bead::new("p", "Anything", Priority::P1).with_type("bug");
        assert_eq!(workflow_type_for_bead(&bead), BUG);
        let bead = Bead::new("p", "Tweak CSS for header", Priority::P1);
        assert_eq!(workflow_type_for_bead(&bead), UI);
        let bead = Bead::new("p", "Add export to CSV", Priority::P1);
        assert_eq!(workflow_type_for_bead(&bead), FEATURE);
        let bead = Bead::new("p", "Handle prefix matching", Priority::P1);
        assert_eq!(workflow_type_for_bead(&bead), FEATURE);
    }

    #[test]
    fn test_builtins_are_well_formed() {
        for wf in builtin_workflows() {
            assert!(wf.edges.iter().any(|e| e.from_node_key.is_empty()), "{}", wf.id);
            assert!(wf.edges.iter().any(|e| e.to_node_key.is_empty()), "{}", wf.id);
            for edge in &wf.edges {
                for key in [&edge.from_node_key, &edge.to_node_key] {
                    assert!(key.is_empty() || wf.node(key).is_some(), "{} -> {}", wf.id, key);
                }
            }
        }
    }

    #[tokio::test]
    async fn test_seeding_is_idempotent() {
        let db = MemoryStore::new();
        assert_eq!(ensure_default_workflows(&db).await.unwrap().len(), 3);
        assert!(ensure_default_workflows(&db).await.unwrap().is_empty());

        let bead = Bead::new("p", "Fix login error", Priority::P0);
        assert_eq!(workflow_for_bead(&db, &bead).await.unwrap().id, "wf-bug");
    }
}
