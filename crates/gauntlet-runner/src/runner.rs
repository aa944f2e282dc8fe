//! Core runner trait and types.

use async_trait::async_trait;
use gauntlet_core::Result;
use gauntlet_core::pipeline::StepSpec;
use std::collections::{BTreeMap, HashMap};
use std::path::PathBuf;
use std::time::Duration;
use tokio::sync::mpsc;

/// Output line from step execution.
#[derive(Debug, Clone)]
pub struct OutputLine {
    pub stream: OutputStream,
    pub content: String,
    pub line_number: u32,
    pub timestamp: chrono::DateTime<chrono::Utc>,
}

impl OutputLine {
    pub fn new(stream: OutputStream, content: impl Into<String>, line_number: u32) -> Self {
        Self {
            stream,
            content: content.into(),
            line_number,
            timestamp: chrono::Utc::now(),
        }
    }
}

/// Output stream type.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutputStream {
    Stdout,
    Stderr,
}

/// Result of a step that ran to completion. A nonzero exit code is a
/// result, not an error.
#[derive(Debug, Clone)]
pub struct StepResult {
    pub exit_code: i32,
    pub success: bool,
    pub duration_ms: u64,
    pub outputs: BTreeMap<String, String>,
}

impl StepResult {
    pub fn from_exit_code(exit_code: i32, duration_ms: u64) -> Self {
        Self {
            exit_code,
            success: exit_code == 0,
            duration_ms,
            outputs: BTreeMap::new(),
        }
    }
}

/// Context for step execution.
#[derive(Debug, Clone)]
pub struct StepContext {
    pub workspace: PathBuf,
    /// Environment variables for the step process.
    pub variables: HashMap<String, String>,
    /// The step with its expressions already interpolated.
    pub step: StepSpec,
    /// 1-based position in the job.
    pub position: usize,
    /// Triggering event fields.
    pub event: BTreeMap<String, String>,
    /// Repository to check out.
    pub repository: Option<String>,
}

/// Trait for step execution.
///
/// Runners must stop their work when the returned future is dropped; the
/// job executor drops it on timeout and on cancellation.
#[async_trait]
pub trait StepRunner: Send + Sync {
    /// Execute a step, streaming output to the provided channel.
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult>;

    /// Check if this runner can handle the given step.
    fn can_handle(&self, step: &StepSpec) -> bool;
}

/// Configuration for step execution.
#[derive(Debug, Clone, Default)]
pub struct RunnerConfig {
    /// Timeout for steps without `timeout-minutes`. `None` waits forever.
    pub default_timeout: Option<Duration>,
    /// Toolchain store shared by every job run, exported as `RUSTUP_HOME`.
    /// Unset leaves rustup looking under the job's private home.
    pub rustup_home: Option<PathBuf>,
    /// Repository checked out by checkout actions.
    pub repository: Option<String>,
}

impl RunnerConfig {
    /// Effective timeout for a step.
    pub fn timeout_for(&self, step: &StepSpec) -> Option<Duration> {
        step.timeout_minutes
            .map(|minutes| Duration::from_secs(u64::from(minutes) * 60))
            .or(self.default_timeout)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_step_timeout_overrides_default() {
        let config = RunnerConfig {
            default_timeout: Some(Duration::from_secs(3600)),
            ..Default::default()
        };
        let mut step = StepSpec::command("Build", "cargo build");
        assert_eq!(config.timeout_for(&step), Some(Duration::from_secs(3600)));

        step.timeout_minutes = Some(5);
        assert_eq!(config.timeout_for(&step), Some(Duration::from_secs(300)));

        assert_eq!(RunnerConfig::default().timeout_for(&StepSpec::command("x", "y")), None);
    }
}
