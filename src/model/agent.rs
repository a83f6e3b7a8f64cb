//! Agents: AI worker instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Agent status. `current_bead` is non-empty iff the agent is `Working`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Idle,
    Working,
    Error,
}

impl AgentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            AgentStatus::Idle => "idle",
            AgentStatus::Working => "working",
            AgentStatus::Error => "error",
        }
    }
}

impl std::str::FromStr for AgentStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "idle" => Ok(AgentStatus::Idle),
            "working" => Ok(AgentStatus::Working),
            "error" => Ok(AgentStatus::Error),
            other => Err(format!("unknown agent status '{}'", other)),
        }
    }
}

impl std::fmt::Display for AgentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// An AI worker instance bound to a role and a provider.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Agent {
    pub id: String,
    pub name: String,
    /// Role identifier such as `cto`, `engineering-manager`, `developer`.
    pub role: String,
    pub persona_name: String,
    pub provider_id: String,
    pub status: AgentStatus,
    pub current_bead: String,
    /// Owning project, empty for global agents.
    pub project_id: String,
    pub position_id: String,
    pub started_at: DateTime<Utc>,
    pub last_active: DateTime<Utc>,
}

impl Agent {
    /// Create a new idle agent (not persisted yet).
    pub fn new(name: impl Into<String>, role: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            name: name.into(),
            role: role.into(),
            persona_name: String::new(),
            provider_id: String::new(),
            status: AgentStatus::Idle,
            current_bead: String::new(),
            project_id: String::new(),
            position_id: String::new(),
            started_at: now,
            last_active: now,
        }
    }

    pub fn with_project(mut self, project_id: impl Into<String>) -> Self {
        self.project_id = project_id.into();
        self
    }

    pub fn with_provider(mut self, provider_id: impl Into<String>) -> Self {
        self.provider_id = provider_id.into();
        self
    }

    /// Move to `Working` on the given bead.
    pub fn assign(&mut self, bead_id: &str, now: DateTime<Utc>) {
        self.status = AgentStatus::Working;
        self.current_bead = bead_id.to_string();
        self.last_active = now;
    }

    /// Return to `Idle` with no bead.
    pub fn release(&mut self, now: DateTime<Utc>) {
        self.status = AgentStatus::Idle;
        self.current_bead.clear();
        self.last_active = now;
    }

    pub fn is_idle(&self) -> bool {
        self.status == AgentStatus::Idle
    }

    /// True when the agent's role matches `role` after normalization.
    pub fn has_role(&self, role: &str) -> bool {
        normalize_role(&self.role) == normalize_role(role)
    }
}

/// Normalize a role name: lower-case, `_` and ` ` become `-`.
pub fn normalize_role(role: &str) -> String {
    role.trim()
        .to_lowercase()
        .chars()
        .map(|c| if c == '_' || c == ' ' { '-' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_normalize_role() {
        assert_eq!(normalize_role("Engineering Manager"), "engineering-manager");
        assert_eq!(normalize_role("engineering_manager"), "engineering-manager");
        assert_eq!(normalize_role(" QA "), "qa");
    }

    #[test]
    fn test_assign_and_release_keep_invariant() {
        let mut agent = Agent::new("dev-1", "developer");
        let now = Utc::now();
        agent.assign("bd-1", now);
        assert_eq!(agent.status, AgentStatus::Working);
        assert_eq!(agent.current_bead, "bd-1");

        agent.release(now);
        assert!(agent.is_idle());
        assert!(agent.current_bead.is_empty());
    }

    #[test]
    fn test_has_role_is_case_insensitive() {
        let agent = Agent::new("boss", "Engineering_Manager");
        assert!(agent.has_role("engineering manager"));
        assert!(!agent.has_role("cto"));
    }
}
