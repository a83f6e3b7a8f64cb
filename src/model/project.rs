//! Projects and users.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    Open,
    Closed,
    Reopened,
}

impl ProjectStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProjectStatus::Open => "open",
            ProjectStatus::Closed => "closed",
            ProjectStatus::Reopened => "reopened",
        }
    }
}

impl std::str::FromStr for ProjectStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "open" => Ok(ProjectStatus::Open),
            "closed" => Ok(ProjectStatus::Closed),
            "reopened" => Ok(ProjectStatus::Reopened),
            other => Err(format!("unknown project status '{}'", other)),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GitStrategy {
    Direct,
    Branch,
}

impl GitStrategy {
    pub fn as_str(&self) -> &'static str {
        match self {
            GitStrategy::Direct => "direct",
            GitStrategy::Branch => "branch",
        }
    }
}

impl std::str::FromStr for GitStrategy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "direct" => Ok(GitStrategy::Direct),
            "branch" => Ok(GitStrategy::Branch),
            other => Err(format!("unknown git strategy '{}'", other)),
        }
    }
}

/// Logical container for beads, agents, and knowledge.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    pub id: String,
    pub name: String,
    pub git_repo: String,
    pub branch: String,
    pub beads_path: String,
    /// Parent project. May not form a cycle.
    pub parent_id: Option<String>,
    pub is_perpetual: bool,
    pub is_sticky: bool,
    pub status: ProjectStatus,
    pub git_strategy: GitStrategy,
    pub context: BTreeMap<String, String>,
    pub schema_version: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub closed_at: Option<DateTime<Utc>>,
}

impl Project {
    pub fn new(id: impl Into<String>, name: impl Into<String>) -> Self {
        let now = Utc::now();
        Self {
            id: id.into(),
            name: name.into(),
            git_repo: String::new(),
            branch: "main".to_string(),
            beads_path: ".beads".to_string(),
            parent_id: None,
            is_perpetual: false,
            is_sticky: false,
            status: ProjectStatus::Open,
            git_strategy: GitStrategy::Direct,
            context: BTreeMap::new(),
            schema_version: "1".to_string(),
            created_at: now,
            updated_at: now,
            closed_at: None,
        }
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>) -> Self {
        self.parent_id = Some(parent_id.into());
        self
    }
}

/// A human user that can be mentioned and notified.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    pub id: String,
    pub username: String,
    pub display_name: String,
    pub email: String,
    pub created_at: DateTime<Utc>,
}

impl User {
    pub fn new(id: impl Into<String>, username: impl Into<String>) -> Self {
        let username = username.into();
        Self {
            id: id.into(),
            display_name: username.clone(),
            username,
            email: String::new(),
            created_at: Utc::now(),
        }
    }
}
