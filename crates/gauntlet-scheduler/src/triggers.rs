//! Trigger matching and evaluation.

use chrono::{DateTime, Timelike, Utc};
use gauntlet_core::pipeline::PipelineDefinition;
use gauntlet_core::run::{TriggerContext, TriggerKind};
use tracing::{debug, warn};

/// Event that can trigger a pipeline.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TriggerEvent {
    Push {
        /// Branch name, with or without the `refs/heads/` prefix.
        branch: String,
        sha: Option<String>,
    },
    PullRequest {
        number: u64,
        base_branch: String,
        head_sha: Option<String>,
    },
    Schedule {
        at: DateTime<Utc>,
    },
}

impl TriggerEvent {
    pub fn kind(&self) -> TriggerKind {
        match self {
            TriggerEvent::Push { .. } => TriggerKind::Push,
            TriggerEvent::PullRequest { .. } => TriggerKind::PullRequest,
            TriggerEvent::Schedule { .. } => TriggerKind::Schedule,
        }
    }
}

fn branch_name(branch: &str) -> &str {
    branch.strip_prefix("refs/heads/").unwrap_or(branch)
}

/// Matcher for determining if a pipeline should be triggered.
pub struct TriggerMatcher;

impl TriggerMatcher {
    pub fn new() -> Self {
        Self
    }

    /// Decide whether `event` starts a run of `pipeline`, and with which
    /// checkout context.
    pub fn evaluate(
        &self,
        pipeline: &PipelineDefinition,
        event: &TriggerEvent,
    ) -> Option<TriggerContext> {
        let triggers = &pipeline.on;
        let context = match event {
            TriggerEvent::Push { branch, sha } => {
                let push = triggers.push.as_ref()?;
                let branch = branch_name(branch);
                if !self.branch_matches(&push.branches, branch) {
                    debug!(branch, "Push does not match branch filter");
                    return None;
                }
                TriggerContext {
                    kind: TriggerKind::Push,
                    git_ref: Some(format!("refs/heads/{}", branch)),
                    sha: sha.clone(),
                }
            }
            TriggerEvent::PullRequest {
                number,
                base_branch,
                head_sha,
            } => {
                let pr = triggers.pull_request.as_ref()?;
                if !self.branch_matches(&pr.branches, branch_name(base_branch)) {
                    debug!(base_branch, "Pull request does not match branch filter");
                    return None;
                }
                TriggerContext {
                    kind: TriggerKind::PullRequest,
                    git_ref: Some(format!("refs/pull/{}/head", number)),
                    sha: head_sha.clone(),
                }
            }
            TriggerEvent::Schedule { at } => {
                if !self.schedule_matches(pipeline, *at) {
                    return None;
                }
                TriggerContext {
                    kind: TriggerKind::Schedule,
                    git_ref: None,
                    sha: None,
                }
            }
        };
        Some(context)
    }

    /// Whether `pipeline` should run for `event`.
    pub fn matches(&self, pipeline: &PipelineDefinition, event: &TriggerEvent) -> bool {
        self.evaluate(pipeline, event).is_some()
    }

    fn schedule_matches(&self, pipeline: &PipelineDefinition, at: DateTime<Utc>) -> bool {
        let Some(minute) = at.with_second(0).and_then(|t| t.with_nanosecond(0)) else {
            return false;
        };
        pipeline.on.schedule.iter().any(|trigger| match trigger.schedule() {
            Ok(schedule) => schedule.includes(minute),
            Err(e) => {
                warn!(cron = %trigger.cron, error = %e, "Ignoring unparsable schedule");
                false
            }
        })
    }

    fn branch_matches(&self, patterns: &[String], branch: &str) -> bool {
        if patterns.is_empty() {
            return true;
        }
        patterns.iter().any(|p| self.glob_match(p, branch))
    }

    fn glob_match(&self, pattern: &str, text: &str) -> bool {
        if pattern == "*" || pattern == "**" {
            return !text.contains('/') || pattern == "**";
        }
        if let Some(prefix) = pattern.strip_suffix("/**") {
            return text
                .strip_prefix(prefix)
                .is_some_and(|rest| rest.starts_with('/'));
        }
        if let Some(prefix) = pattern.strip_suffix("/*") {
            return text
                .strip_prefix(prefix)
                .and_then(|rest| rest.strip_prefix('/'))
                .is_some_and(|rest| !rest.is_empty() && !rest.contains('/'));
        }
        if let Some((head, tail)) = pattern.split_once('*') {
            return !tail.contains('*')
                && text.len() >= head.len() + tail.len()
                && text.starts_with(head)
                && text.ends_with(tail);
        }
        pattern == text
    }
}

impl Default for TriggerMatcher {
    fn default() -> Self {
        Self::new()
    }
}
