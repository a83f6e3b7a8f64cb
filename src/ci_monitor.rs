//! CI monitoring against a code-hosting platform.
//!
//! [`CiMonitor`] polls failed workflow runs and files one P0 bug bead per
//! run. A run already filed (matched by the bead's `ci_run_id`) is never
//! filed again.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tokio_util::sync::CancellationToken;

use crate::config::CiMonitorConfig;
use crate::db::{BeadFilter, Database};
use crate::error::PlatformError;
use crate::events::{Event, EventBus, types};
use crate::model::{Bead, Priority, ctx};

/// Failed runs fetched per sweep.
pub const FAILED_RUN_LIMIT: usize = 20;

const EVENT_SOURCE: &str = "ci-monitor";

// ==================== Platform types ====================

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct WorkflowRun {
    pub database_id: u64,
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub workflow_name: String,
    #[serde(default)]
    pub display_title: String,
    #[serde(default)]
    pub head_branch: String,
    #[serde(default)]
    pub head_sha: String,
    #[serde(default)]
    pub status: String,
    #[serde(default)]
    pub conclusion: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub created_at: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Label {
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Issue {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub body: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub labels: Vec<Label>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullRequest {
    pub number: u64,
    pub title: String,
    #[serde(default)]
    pub state: String,
    #[serde(default)]
    pub head_ref_name: String,
    #[serde(default)]
    pub base_ref_name: String,
    #[serde(default)]
    pub url: String,
    #[serde(default)]
    pub is_draft: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct RepoInfo {
    pub name_with_owner: String,
    pub default_branch: String,
    pub url: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct RawRepoInfo {
    name_with_owner: String,
    #[serde(default)]
    default_branch_ref: Option<BranchRef>,
    #[serde(default)]
    url: String,
}

#[derive(Deserialize)]
struct BranchRef {
    name: String,
}

/// Access to a repository's issues, pull requests, and CI runs.
#[async_trait]
pub trait RepoPlatform: Send + Sync {
    async fn list_failed_runs(&self, repo: &str, limit: usize) -> Result<Vec<WorkflowRun>, PlatformError>;
    async fn list_issues(&self, repo: &str, limit: usize) -> Result<Vec<Issue>, PlatformError>;
    async fn list_pull_requests(&self, repo: &str, limit: usize) -> Result<Vec<PullRequest>, PlatformError>;
    async fn repo_info(&self, repo: &str) -> Result<RepoInfo, PlatformError>;
}

// ==================== gh CLI ====================

/// [`RepoPlatform`] backed by the GitHub `gh` command-line tool.
pub struct GhCli {
    binary: String,
}

impl GhCli {
    pub fn new() -> Self {
        Self::with_binary("gh")
    }

    pub fn with_binary(binary: impl Into<String>) -> Self {
        Self { binary: binary.into() }
    }

    async fn json<T: serde::de::DeserializeOwned>(&self, args: &[&str]) -> Result<T, PlatformError> {
        let command = format!("{} {}", self.binary, args.first().copied().unwrap_or_default());
        let output = Command::new(&self.binary)
            .args(args)
            .kill_on_drop(true)
            .output()
            .await
            .map_err(|e| PlatformError::Command {
                command: command.clone(),
                reason: e.to_string(),
            })?;

        if !output.status.success() {
            return Err(PlatformError::Exit {
                command,
                code: output.status.code().unwrap_or(-1),
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            });
        }
        serde_json::from_slice(&output.stdout).map_err(|e| PlatformError::Parse {
            command,
            reason: e.to_string(),
        })
    }
}

impl Default for GhCli {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl RepoPlatform for GhCli {
    async fn list_failed_runs(&self, repo: &str, limit: usize) -> Result<Vec<WorkflowRun>, PlatformError> {
        let limit = limit.to_string();
        self.json(&[
            "run",
            "list",
            "--repo",
            repo,
            "--status",
            "failure",
            "--limit",
            &limit,
            "--json",
            "databaseId,name,workflowName,displayTitle,headBranch,headSha,status,conclusion,url,createdAt",
        ])
        .await
    }

    async fn list_issues(&self, repo: &str, limit: usize) -> Result<Vec<Issue>, PlatformError> {
        let limit = limit.to_string();
        self.json(&[
            "issue",
            "list",
            "--repo",
            repo,
            "--limit",
            &limit,
            "--json",
            "number,title,body,state,url,labels",
        ])
        .await
    }

    async fn list_pull_requests(&self, repo: &str, limit: usize) -> Result<Vec<PullRequest>, PlatformError> {
        let limit = limit.to_string();
        self.json(&[
            "pr",
            "list",
            "--repo",
            repo,
            "--limit",
            &limit,
            "--json",
            "number,title,state,headRefName,baseRefName,url,isDraft",
        ])
        .await
    }

    async fn repo_info(&self, repo: &str) -> Result<RepoInfo, PlatformError> {
        let raw: RawRepoInfo = self
            .json(&["repo", "view", repo, "--json", "nameWithOwner,defaultBranchRef,url"])
            .await?;
        Ok(RepoInfo {
            name_with_owner: raw.name_with_owner,
            default_branch: raw.default_branch_ref.map(|b| b.name).unwrap_or_default(),
            url: raw.url,
        })
    }
}

// ==================== Monitor ====================

fn bead_for_run(project_id: &str, repo: &str, run: &WorkflowRun) -> Bead {
    let workflow = if run.workflow_name.is_empty() { &run.name } else { &run.workflow_name };
    let mut bead = Bead::new(
        project_id,
        format!("CI failure: {} on {}", workflow, run.head_branch),
        Priority::P0,
    )
    .with_type("bug")
    .with_description(format!(
        "Workflow run {} in {} failed.\n\nTitle: {}\nBranch: {}\nCommit: {}\nConclusion: {}\n{}",
        run.database_id,
        repo,
        run.display_title,
        run.head_branch,
        run.head_sha,
        run.conclusion,
        run.url
    ));
    bead.set_ctx(ctx::CI_RUN_ID, run.database_id.to_string());
    bead
}

pub struct CiMonitor {
    db: Arc<dyn Database>,
    events: Arc<EventBus>,
    platform: Arc<dyn RepoPlatform>,
    config: CiMonitorConfig,
}

impl CiMonitor {
    pub fn new(
        db: Arc<dyn Database>,
        events: Arc<EventBus>,
        platform: Arc<dyn RepoPlatform>,
        config: CiMonitorConfig,
    ) -> Self {
        Self {
            db,
            events,
            platform,
            config,
        }
    }

    /// File beads for new failed runs. Returns how many were filed.
    pub async fn sweep(&self) -> Result<usize, PlatformError> {
        let Some(repo) = self.config.repo.as_deref() else {
            return Ok(0);
        };
        let runs = self.platform.list_failed_runs(repo, FAILED_RUN_LIMIT).await?;
        if runs.is_empty() {
            return Ok(0);
        }

        let existing = self
            .db
            .list_beads(&BeadFilter {
                project_id: Some(self.config.project_id.clone()),
                ..Default::default()
            })
            .await?;
        let mut filed: HashSet<String> = existing
            .iter()
            .map(|b| b.ctx(ctx::CI_RUN_ID).to_string())
            .filter(|id| !id.is_empty())
            .collect();

        let mut created = 0;
        for run in &runs {
            if !filed.insert(run.database_id.to_string()) {
                continue;
            }
            let bead = bead_for_run(&self.config.project_id, repo, run);
            self.db.upsert_bead(&bead).await?;
            tracing::warn!(
                repo,
                run_id = run.database_id,
                bead_id = %bead.id,
                branch = %run.head_branch,
                "CI run failed, filed bead"
            );
            self.events.publish(
                Event::new(types::BEAD_CREATED, EVENT_SOURCE)
                    .with_project(bead.project_id.clone())
                    .with_data(serde_json::json!({
                        "bead_id": bead.id,
                        "title": bead.title,
                        "ci_run_id": run.database_id,
                    })),
            );
            created += 1;
        }
        Ok(created)
    }

    /// Sweep at the configured interval until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let Some(repo) = self.config.repo.clone() else {
            tracing::info!("No CI repository configured, CI monitor disabled");
            return;
        };
        let mut interval = tokio::time::interval(self.config.interval);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        tracing::info!(repo = %repo, interval_secs = self.config.interval.as_secs(), "CI monitor started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval.tick() => {
                    match self.sweep().await {
                        Ok(0) => {}
                        Ok(created) => tracing::info!(repo = %repo, created, "CI sweep filed beads"),
                        Err(e) => tracing::warn!(repo = %repo, error = %e, kind = %e.kind(), "CI sweep failed"),
                    }
                }
            }
        }
        tracing::info!("CI monitor stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use super::*;
    use crate::db::MemoryStore;
    use crate::model::BeadStatus;

    struct FakePlatform {
        runs: Mutex<Vec<WorkflowRun>>,
    }

    fn run(id: u64) -> WorkflowRun {
        serde_json::from_value(serde_json::json!({
            "databaseId": id,
            "workflowName": "ci",
            "headBranch": "main",
            "headSha": "abc123",
            "conclusion": "failure",
            "url": format!("https://example.test/runs/{}", id),
        }))
        .unwrap()
    }

    #[async_trait]
    impl RepoPlatform for FakePlatform {
        async fn list_failed_runs(&self, _repo: &str, _limit: usize) -> Result<Vec<WorkflowRun>, PlatformError> {
            Ok(self.runs.lock().unwrap().clone())
        }
        async fn list_issues(&self, _repo: &str, _limit: usize) -> Result<Vec<Issue>, PlatformError> {
            Ok(Vec::new())
        }
        async fn list_pull_requests(&self, _repo: &str, _limit: usize) -> Result<Vec<PullRequest>, PlatformError> {
            Ok(Vec::new())
        }
        async fn repo_info(&self, repo: &str) -> Result<RepoInfo, PlatformError> {
            Ok(RepoInfo {
                name_with_owner: repo.to_string(),
                default_branch: "main".to_string(),
                url: String::new(),
            })
        }
    }

    fn monitor(db: Arc<dyn Database>, platform: Arc<FakePlatform>, repo: Option<&str>) -> CiMonitor {
        let config = CiMonitorConfig {
            repo: repo.map(str::to_string),
            project_id: "p1".to_string(),
            ..Default::default()
        };
        CiMonitor::new(db, Arc::new(EventBus::new(16)), platform, config)
    }

    #[tokio::test]
    async fn test_failed_run_filed_once() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let platform = Arc::new(FakePlatform {
            runs: Mutex::new(vec![run(42)]),
        });
        let monitor = monitor(db.clone(), platform.clone(), Some("acme/app"));

        assert_eq!(monitor.sweep().await.unwrap(), 1);
        assert_eq!(monitor.sweep().await.unwrap(), 0);

        platform.runs.lock().unwrap().push(run(43));
        assert_eq!(monitor.sweep().await.unwrap(), 1);

        let beads = db.list_beads(&BeadFilter::default()).await.unwrap();
        assert_eq!(beads.len(), 2);
        let bead = beads.iter().find(|b| b.ctx(ctx::CI_RUN_ID) == "42").unwrap();
        assert_eq!(bead.priority, Priority::P0);
        assert_eq!(bead.status, BeadStatus::Open);
        assert_eq!(bead.title, "CI failure: ci on main");
    }

    #[tokio::test]
    async fn test_no_repo_is_a_no_op() {
        let db: Arc<dyn Database> = Arc::new(MemoryStore::new());
        let platform = Arc::new(FakePlatform {
            runs: Mutex::new(vec![run(1)]),
        });
        assert_eq!(monitor(db, platform, None).sweep().await.unwrap(), 0);
    }

    #[test]
    fn test_repo_info_parse() {
        let raw: RawRepoInfo = serde_json::from_str(
            r#"{"nameWithOwner":"acme/app","defaultBranchRef":{"name":"trunk"},"url":"u"}"#,
        )
        .unwrap();
        assert_eq!(raw.default_branch_ref.unwrap().name, "trunk");
    }
}
