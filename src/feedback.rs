//! Build, lint, and test feedback for agent changes.
//!
//! Stages run in order in one working directory. Once a stage fails, the
//! remaining stages are reported as skipped.

use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::time::{Duration, Instant};

use serde::Serialize;
use tokio::process::Command;

use crate::error::FeedbackError;

/// Bytes of combined output kept per stage.
pub const OUTPUT_TAIL_BYTES: usize = 4096;
pub const DEFAULT_STAGE_TIMEOUT: Duration = Duration::from_secs(600);

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StageStatus {
    Passed,
    Failed,
    TimedOut,
    Skipped,
}

/// One command in the pipeline.
#[derive(Debug, Clone)]
pub struct FeedbackStage {
    pub name: String,
    pub program: String,
    pub args: Vec<String>,
    pub timeout: Duration,
}

impl FeedbackStage {
    pub fn new(name: impl Into<String>, program: impl Into<String>, args: &[&str]) -> Self {
        Self {
            name: name.into(),
            program: program.into(),
            args: args.iter().map(|a| a.to_string()).collect(),
            timeout: DEFAULT_STAGE_TIMEOUT,
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    fn command_line(&self) -> String {
        std::iter::once(self.program.as_str())
            .chain(self.args.iter().map(String::as_str))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StageResult {
    pub stage: String,
    pub status: StageStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
    pub output_tail: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct FeedbackReport {
    pub passed: bool,
    pub stages: Vec<StageResult>,
}

impl FeedbackReport {
    /// First stage that did not pass or get skipped.
    pub fn first_failure(&self) -> Option<&StageResult> {
        self.stages
            .iter()
            .find(|s| matches!(s.status, StageStatus::Failed | StageStatus::TimedOut))
    }
}

/// Last `max` bytes of `text`, cut on a char boundary.
fn tail(text: &str, max: usize) -> String {
    if text.len() <= max {
        return text.to_string();
    }
    let mut start = text.len() - max;
    while !text.is_char_boundary(start) {
        start += 1;
    }
    text[start..].to_string()
}

/// Run one stage to completion or timeout.
pub async fn run_stage(stage: &FeedbackStage, workdir: &Path) -> Result<StageResult, FeedbackError> {
    let started = Instant::now();
    let child = Command::new(&stage.program)
        .args(&stage.args)
        .current_dir(workdir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true)
        .spawn()
        .map_err(|e| FeedbackError::Spawn {
            stage: stage.name.clone(),
            command: stage.command_line(),
            reason: e.to_string(),
        })?;

    let output = tokio::time::timeout(stage.timeout, child.wait_with_output())
        .await
        .map_err(|_| FeedbackError::Timeout {
            stage: stage.name.clone(),
            timeout: stage.timeout,
        })?
        .map_err(|e| FeedbackError::Spawn {
            stage: stage.name.clone(),
            command: stage.command_line(),
            reason: e.to_string(),
        })?;

    let mut combined = String::from_utf8_lossy(&output.stdout).into_owned();
    combined.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(StageResult {
        stage: stage.name.clone(),
        status: if output.status.success() {
            StageStatus::Passed
        } else {
            StageStatus::Failed
        },
        exit_code: output.status.code(),
        duration_ms: started.elapsed().as_millis() as u64,
        output_tail: tail(&combined, OUTPUT_TAIL_BYTES),
    })
}

pub struct FeedbackOrchestrator {
    workdir: PathBuf,
    stages: Vec<FeedbackStage>,
}

impl FeedbackOrchestrator {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            stages: Vec::new(),
        }
    }

    /// The usual build, lint, and test pipeline for a cargo project.
    pub fn cargo(workdir: impl Into<PathBuf>) -> Self {
        Self::new(workdir)
            .with_stage(FeedbackStage::new("build", "cargo", &["build", "--all-targets"]))
            .with_stage(FeedbackStage::new("lint", "cargo", &["clippy", "--all-targets", "--", "-D", "warnings"]))
            .with_stage(FeedbackStage::new("test", "cargo", &["test"]))
    }

    pub fn with_stage(mut self, stage: FeedbackStage) -> Self {
        self.stages.push(stage);
        self
    }

    pub async fn run(&self) -> FeedbackReport {
        let mut stages = Vec::with_capacity(self.stages.len());
        let mut failed = false;

        for stage in &self.stages {
            if failed {
                stages.push(StageResult {
                    stage: stage.name.clone(),
                    status: StageStatus::Skipped,
                    exit_code: None,
                    duration_ms: 0,
                    output_tail: String::new(),
                });
                continue;
            }

            let result = match run_stage(stage, &self.workdir).await {
                Ok(result) => result,
                Err(e) => StageResult {
                    stage: stage.name.clone(),
                    status: match e {
                        FeedbackError::Timeout { .. } => StageStatus::TimedOut,
                        FeedbackError::Spawn { .. } => StageStatus::Failed,
                    },
                    exit_code: None,
                    duration_ms: 0,
                    output_tail: e.to_string(),
                },
            };
            tracing::info!(
                stage = %result.stage,
                status = ?result.status,
                exit_code = ?result.exit_code,
                duration_ms = result.duration_ms,
                "Feedback stage finished"
            );
            failed = result.status != StageStatus::Passed;
            stages.push(result);
        }

        FeedbackReport {
            passed: !failed,
            stages,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sh(name: &str, script: &str) -> FeedbackStage {
        FeedbackStage::new(name, "sh", &["-c", script])
    }

    #[tokio::test]
    async fn test_failure_skips_later_stages() {
        let dir = tempfile::tempdir().unwrap();
        let report = FeedbackOrchestrator::new(dir.path())
            .with_stage(sh("build", "echo built"))
            .with_stage(sh("lint", "echo 'warning: unused' >&2; exit 3"))
            .with_stage(sh("test", "echo never"))
            .run()
            .await;

        assert!(!report.passed);
        let statuses: Vec<StageStatus> = report.stages.iter().map(|s| s.status).collect();
        assert_eq!(statuses, vec![StageStatus::Passed, StageStatus::Failed, StageStatus::Skipped]);
        let lint = report.first_failure().unwrap();
        assert_eq!(lint.exit_code, Some(3));
        assert!(lint.output_tail.contains("warning: unused"));
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let dir = tempfile::tempdir().unwrap();
        let report = FeedbackOrchestrator::new(dir.path())
            .with_stage(sh("build", "sleep 5").with_timeout(Duration::from_millis(100)))
            .with_stage(sh("test", "true"))
            .run()
            .await;
        assert_eq!(report.stages[0].status, StageStatus::TimedOut);
        assert_eq!(report.stages[1].status, StageStatus::Skipped);
    }

    #[tokio::test]
    async fn test_missing_program_fails_stage() {
        let dir = tempfile::tempdir().unwrap();
        let report = FeedbackOrchestrator::new(dir.path())
            .with_stage(FeedbackStage::new("build", "beadwork-no-such-binary", &[]))
            .run()
            .await;
        assert_eq!(report.stages[0].status, StageStatus::Failed);
        assert!(report.stages[0].output_tail.contains("Failed to spawn build"));
    }

    #[test]
    fn test_tail_on_char_boundary() {
        assert_eq!(tail("abcdef", 3), "def");
        assert_eq!(tail("aé", 1), "");
        assert_eq!(tail("ab", 5), "ab");
    }
}
