//! Structured per-project memory.

use std::sync::Arc;

use chrono::Utc;

use crate::db::Database;
use crate::error::KnowledgeError;
use crate::model::MemoryEntry;

/// Categories rendered first, in this order, by [`ProjectMemory::build_context_summary`].
pub const SUMMARY_CATEGORY_ORDER: &[&str] = &["build_system", "github", "convention", "failure", "lesson"];

/// Key-value facts about a project, grouped by category.
pub struct ProjectMemory {
    db: Arc<dyn Database>,
}

impl ProjectMemory {
    pub fn new(db: Arc<dyn Database>) -> Self {
        Self { db }
    }

    /// Store a fact, replacing any previous value for the same key.
    pub async fn set(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
        value: &str,
        confidence: f64,
        source_bead: &str,
    ) -> Result<MemoryEntry, KnowledgeError> {
        if project_id.is_empty() || category.is_empty() || key.is_empty() {
            return Err(KnowledgeError::InvalidArgument(
                "project_id, category, and key are required".to_string(),
            ));
        }
        let entry = MemoryEntry {
            project_id: project_id.to_string(),
            category: category.to_string(),
            key: key.to_string(),
            value: value.to_string(),
            confidence: confidence.clamp(0.0, 1.0),
            updated_at: Utc::now(),
            source_bead: source_bead.to_string(),
        };
        self.db.upsert_memory(&entry).await?;
        tracing::debug!(project_id, category, key, "Project memory updated");
        Ok(entry)
    }

    pub async fn get(
        &self,
        project_id: &str,
        category: &str,
        key: &str,
    ) -> Result<Option<MemoryEntry>, KnowledgeError> {
        Ok(self.db.get_memory(project_id, category, key).await?)
    }

    pub async fn get_by_category(
        &self,
        project_id: &str,
        category: &str,
    ) -> Result<Vec<MemoryEntry>, KnowledgeError> {
        Ok(self.db.list_memory(project_id, Some(category)).await?)
    }

    pub async fn all(&self, project_id: &str) -> Result<Vec<MemoryEntry>, KnowledgeError> {
        Ok(self.db.list_memory(project_id, None).await?)
    }

    pub async fn delete(&self, project_id: &str, category: &str, key: &str) -> Result<(), KnowledgeError> {
        Ok(self.db.delete_memory(project_id, category, key).await?)
    }

    /// Render the project's memory as markdown, one section per category.
    ///
    /// Known categories come first in [`SUMMARY_CATEGORY_ORDER`]; any others
    /// follow alphabetically. Empty when the project has no memory.
    pub async fn build_context_summary(&self, project_id: &str) -> Result<String, KnowledgeError> {
        let entries = self.all(project_id).await?;
        Ok(render_summary(&entries))
    }
}

fn render_summary(entries: &[MemoryEntry]) -> String {
    let mut categories: Vec<&str> = SUMMARY_CATEGORY_ORDER
        .iter()
        .copied()
        .filter(|c| entries.iter().any(|e| e.category == *c))
        .collect();
    let mut extra: Vec<&str> = entries
        .iter()
        .map(|e| e.category.as_str())
        .filter(|c| !SUMMARY_CATEGORY_ORDER.contains(c))
        .collect();
    extra.sort_unstable();
    extra.dedup();
    categories.extend(extra);

    let mut out = String::new();
    for category in categories {
        if !out.is_empty() {
            out.push('\n');
        }
        out.push_str(&format!("### {}\n", category));
        for entry in entries.iter().filter(|e| e.category == category) {
            out.push_str(&format!("- {}: {}\n", entry.key, entry.value));
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::MemoryStore;

    #[tokio::test]
    async fn test_set_get_delete() {
        let memory = ProjectMemory::new(Arc::new(MemoryStore::new()));
        memory
            .set("p1", "build_system", "tool", "cargo", 1.5, "bd-1")
            .await
            .unwrap();
        let entry = memory.get("p1", "build_system", "tool").await.unwrap().unwrap();
        assert_eq!(entry.value, "cargo");
        assert_eq!(entry.confidence, 1.0);

        memory.set("p1", "build_system", "tool", "make", 0.5, "").await.unwrap();
        assert_eq!(memory.get_by_category("p1", "build_system").await.unwrap().len(), 1);

        memory.delete("p1", "build_system", "tool").await.unwrap();
        assert!(memory.get("p1", "build_system", "tool").await.unwrap().is_none());
        assert!(memory.set("", "x", "y", "z", 1.0, "").await.is_err());
    }

    #[tokio::test]
    async fn test_summary_orders_categories() {
        let memory = ProjectMemory::new(Arc::new(MemoryStore::new()));
        memory.set("p1", "zeta", "k", "v", 1.0, "").await.unwrap();
        memory.set("p1", "failure", "flaky", "integration tests time out", 0.8, "").await.unwrap();
        memory.set("p1", "build_system", "tool", "cargo", 1.0, "").await.unwrap();

        let summary = memory.build_context_summary("p1").await.unwrap();
        let build = summary.find("### build_system").unwrap();
        let failure = summary.find("### failure").unwrap();
        let zeta = summary.find("### zeta").unwrap();
        assert!(build < failure && failure < zeta);
        assert!(summary.contains("- tool: cargo"));
        assert!(memory.build_context_summary("empty").await.unwrap().is_empty());
    }
}
