//! Run and execution types.

use crate::error::ErrorKind;
use crate::ids::{JobId, RunId};
use crate::{Error, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;

/// The event that caused a pipeline run, as seen by checkout and
/// interpolation.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TriggerContext {
    pub kind: TriggerKind,
    /// Ref to check out (`refs/heads/main`, `refs/pull/7/head`).
    pub git_ref: Option<String>,
    pub sha: Option<String>,
}

impl TriggerContext {
    /// Fields exposed to `${{ event.* }}` expressions.
    pub fn fields(&self) -> BTreeMap<String, String> {
        let mut fields = BTreeMap::new();
        fields.insert("kind".to_string(), self.kind.to_string());
        if let Some(git_ref) = &self.git_ref {
            fields.insert("ref".to_string(), git_ref.clone());
        }
        if let Some(sha) = &self.sha {
            fields.insert("sha".to_string(), sha.clone());
        }
        fields
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerKind {
    Push,
    PullRequest,
    Schedule,
}

impl fmt::Display for TriggerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            TriggerKind::Push => "push",
            TriggerKind::PullRequest => "pull_request",
            TriggerKind::Schedule => "schedule",
        };
        f.write_str(s)
    }
}

/// One execution of a pipeline definition for a single event.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PipelineRun {
    pub id: RunId,
    pub pipeline_name: String,
    pub trigger: TriggerContext,
    pub jobs: Vec<JobRun>,
    pub started_at: DateTime<Utc>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl PipelineRun {
    /// Succeeded iff every job run succeeded; a cancelled job run fails
    /// the run like any other non-success.
    pub fn status(&self) -> RunStatus {
        if self.jobs.iter().any(|job| !job.status.is_terminal()) {
            RunStatus::Running
        } else if self.jobs.iter().all(|job| job.status == JobStatus::Succeeded) {
            RunStatus::Succeeded
        } else {
            RunStatus::Failed
        }
    }

    pub fn is_success(&self) -> bool {
        self.status() == RunStatus::Succeeded
    }

    /// Whether any job run was stopped by cancellation.
    pub fn was_cancelled(&self) -> bool {
        self.jobs.iter().any(|job| job.status == JobStatus::Cancelled)
    }
}

/// Outcome of a whole pipeline run. `Running` only while job runs are
/// still in flight.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Running,
    Succeeded,
    Failed,
}

/// One instantiation of a job for a concrete matrix combination.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobRun {
    pub id: JobId,
    pub job_name: String,
    pub display_name: String,
    /// Axis assignment in declaration order.
    pub matrix: Vec<(String, String)>,
    pub runner: String,
    pub status: JobStatus,
    pub steps: Vec<StepOutcome>,
    pub failure: Option<FailurePoint>,
    pub caches: Vec<CacheReport>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
}

impl JobRun {
    pub fn new(
        job_name: impl Into<String>,
        display_name: impl Into<String>,
        matrix: Vec<(String, String)>,
        runner: impl Into<String>,
    ) -> Self {
        Self {
            id: JobId::new(),
            job_name: job_name.into(),
            display_name: display_name.into(),
            matrix,
            runner: runner.into(),
            status: JobStatus::Pending,
            steps: Vec::new(),
            failure: None,
            caches: Vec::new(),
            started_at: None,
            completed_at: None,
        }
    }

    /// Move to a new status, rejecting transitions the lifecycle forbids.
    pub fn transition(&mut self, to: JobStatus) -> Result<()> {
        if !self.status.can_transition_to(to) {
            return Err(Error::InvalidTransition {
                from: self.status.to_string(),
                to: to.to_string(),
            });
        }
        match to {
            JobStatus::Running => self.started_at = Some(Utc::now()),
            s if s.is_terminal() => self.completed_at = Some(Utc::now()),
            _ => {}
        }
        self.status = to;
        Ok(())
    }

    pub fn matrix_value(&self, axis: &str) -> Option<&str> {
        self.matrix
            .iter()
            .find(|(name, _)| name == axis)
            .map(|(_, value)| value.as_str())
    }

    /// Names of the steps that actually ran, in order.
    pub fn executed_steps(&self) -> Vec<&str> {
        self.steps
            .iter()
            .filter(|s| matches!(s.status, StepStatus::Succeeded | StepStatus::Failed))
            .map(|s| s.name.as_str())
            .collect()
    }

    pub fn duration_ms(&self) -> Option<u64> {
        match (self.started_at, self.completed_at) {
            (Some(start), Some(end)) => Some((end - start).num_milliseconds().max(0) as u64),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Running,
    Succeeded,
    Failed,
    Cancelled,
}

impl JobStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Succeeded | JobStatus::Failed | JobStatus::Cancelled
        )
    }

    pub fn can_transition_to(&self, to: JobStatus) -> bool {
        matches!(
            (self, to),
            (JobStatus::Pending, JobStatus::Running)
                | (JobStatus::Pending, JobStatus::Cancelled)
                | (JobStatus::Running, JobStatus::Succeeded)
                | (JobStatus::Running, JobStatus::Failed)
                | (JobStatus::Running, JobStatus::Cancelled)
        )
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            JobStatus::Pending => "pending",
            JobStatus::Running => "running",
            JobStatus::Succeeded => "succeeded",
            JobStatus::Failed => "failed",
            JobStatus::Cancelled => "cancelled",
        };
        f.write_str(s)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepOutcome {
    /// 1-based position in the job's step list.
    pub position: usize,
    pub name: String,
    pub status: StepStatus,
    pub exit_code: Option<i32>,
    pub duration_ms: u64,
}

impl StepOutcome {
    pub fn not_run(position: usize, name: impl Into<String>, status: StepStatus) -> Self {
        Self {
            position,
            name: name.into(),
            status,
            exit_code: None,
            duration_ms: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
    Cancelled,
}

/// Where and why a job stopped.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FailurePoint {
    pub position: usize,
    pub step_name: String,
    pub kind: ErrorKind,
    pub message: String,
}

/// What the cache manager did for one cache step.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheReport {
    pub step_name: String,
    /// Resolved primary key; `None` when key resolution failed.
    pub key: Option<String>,
    pub lookup: CacheLookup,
    pub save: CacheSaveStatus,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "result", content = "key", rename_all = "snake_case")]
pub enum CacheLookup {
    /// Exact primary key match.
    Hit(String),
    /// Restored from a restore-key prefix match.
    PartialHit(String),
    Miss,
    /// The key could not be computed; treated as a miss.
    Unresolved,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CacheSaveStatus {
    /// Not decided yet (job still running).
    Pending,
    Saved,
    /// Skipped by policy; the reason is a short label.
    Skipped(String),
    /// Save attempted and failed; the job status is unaffected.
    Failed(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn job() -> JobRun {
        JobRun::new(
            "test",
            "test (os=ubuntu-latest)",
            vec![("os".into(), "ubuntu-latest".into())],
            "ubuntu-latest",
        )
    }

    #[test]
    fn test_job_lifecycle() {
        let mut run = job();
        assert_eq!(run.status, JobStatus::Pending);
        run.transition(JobStatus::Running).unwrap();
        assert!(run.started_at.is_some());
        run.transition(JobStatus::Succeeded).unwrap();
        assert!(run.completed_at.is_some());
        assert!(run.duration_ms().is_some());
    }

    #[test]
    fn test_terminal_status_is_final() {
        let mut run = job();
        run.transition(JobStatus::Running).unwrap();
        run.transition(JobStatus::Failed).unwrap();
        let err = run.transition(JobStatus::Running).unwrap_err();
        assert!(matches!(err, Error::InvalidTransition { .. }));
        assert!(run.transition(JobStatus::Cancelled).is_err());
    }

    #[test]
    fn test_pending_can_be_cancelled_but_not_finished() {
        assert!(JobStatus::Pending.can_transition_to(JobStatus::Cancelled));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Succeeded));
        assert!(!JobStatus::Pending.can_transition_to(JobStatus::Failed));
    }

    #[test]
    fn test_pipeline_status_requires_every_job() {
        let mut ok = job();
        ok.transition(JobStatus::Running).unwrap();
        ok.transition(JobStatus::Succeeded).unwrap();
        let mut bad = job();
        bad.transition(JobStatus::Running).unwrap();
        bad.transition(JobStatus::Failed).unwrap();

        let mut run = PipelineRun {
            id: RunId::new(),
            pipeline_name: "CI".into(),
            trigger: TriggerContext {
                kind: TriggerKind::Push,
                git_ref: Some("refs/heads/main".into()),
                sha: None,
            },
            jobs: vec![ok.clone()],
            started_at: Utc::now(),
            completed_at: None,
        };
        assert_eq!(run.status(), RunStatus::Succeeded);

        run.jobs.push(bad);
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(!run.is_success());
    }

    #[test]
    fn test_cancelled_job_fails_the_run() {
        let mut ok = job();
        ok.transition(JobStatus::Running).unwrap();
        ok.transition(JobStatus::Succeeded).unwrap();
        let mut stopped = job();
        stopped.transition(JobStatus::Cancelled).unwrap();

        let run = PipelineRun {
            id: RunId::new(),
            pipeline_name: "CI".into(),
            trigger: TriggerContext {
                kind: TriggerKind::Schedule,
                git_ref: None,
                sha: None,
            },
            jobs: vec![ok, stopped],
            started_at: Utc::now(),
            completed_at: None,
        };
        assert_eq!(run.status(), RunStatus::Failed);
        assert!(run.was_cancelled());
    }

    #[test]
    fn test_matrix_value_lookup() {
        let run = job();
        assert_eq!(run.matrix_value("os"), Some("ubuntu-latest"));
        assert_eq!(run.matrix_value("toolchain"), None);
    }

    #[test]
    fn test_cache_lookup_serialization() {
        let json = serde_json::to_string(&CacheLookup::PartialHit("linux-cargo-1".into())).unwrap();
        assert_eq!(json, r#"{"result":"partial_hit","key":"linux-cargo-1"}"#);
    }
}
