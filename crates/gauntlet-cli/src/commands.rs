//! CLI command definitions.

use chrono::{DateTime, Utc};
use clap::{Args, Subcommand, ValueEnum};
use gauntlet_scheduler::TriggerEvent;
use std::path::PathBuf;

#[derive(Subcommand)]
pub enum Commands {
    /// Validate a pipeline definition
    Validate {
        /// Path to the workflow file
        #[arg(default_value = "gauntlet.yml")]
        path: PathBuf,
    },

    /// Check whether an event would start a run, without running anything
    Trigger {
        /// Path to the workflow file
        #[arg(short, long, default_value = "gauntlet.yml")]
        file: PathBuf,

        #[command(flatten)]
        event: EventArgs,
    },

    /// Print the job runs each matrix expands to
    Matrix {
        /// Path to the workflow file
        #[arg(short, long, default_value = "gauntlet.yml")]
        file: PathBuf,
    },

    /// Run a pipeline locally for an event
    Run {
        /// Path to the workflow file
        #[arg(short, long, default_value = "gauntlet.yml")]
        file: PathBuf,

        #[command(flatten)]
        event: EventArgs,

        /// Repository checked out by checkout steps
        #[arg(long, default_value = ".")]
        repo: String,

        /// Maximum number of jobs running at once
        #[arg(long)]
        max_parallel: Option<usize>,

        /// Timeout for steps without `timeout-minutes`
        #[arg(long)]
        timeout_minutes: Option<u32>,

        /// Run without restoring or saving caches
        #[arg(long)]
        no_cache: bool,

        /// Keep job workspaces after the run
        #[arg(long)]
        keep_workspaces: bool,

        /// Print the run report as JSON
        #[arg(long)]
        json: bool,
    },

    /// Manage cache
    Cache {
        #[command(subcommand)]
        command: CacheCommands,
    },

    /// Manage configuration
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum EventKind {
    Push,
    PullRequest,
    Schedule,
}

/// Description of the triggering event.
#[derive(Debug, Clone, Args)]
pub struct EventArgs {
    /// Kind of event
    #[arg(long, value_enum, default_value = "push")]
    pub event: EventKind,

    /// Pushed branch
    #[arg(long, default_value = "main")]
    pub branch: String,

    /// Commit to check out
    #[arg(long)]
    pub sha: Option<String>,

    /// Pull request number
    #[arg(long, default_value_t = 1)]
    pub pr: u64,

    /// Pull request base branch
    #[arg(long, default_value = "main")]
    pub base: String,

    /// Schedule tick (RFC 3339); defaults to now
    #[arg(long)]
    pub at: Option<DateTime<Utc>>,
}

impl EventArgs {
    pub fn to_event(&self) -> TriggerEvent {
        match self.event {
            EventKind::Push => TriggerEvent::Push {
                branch: self.branch.clone(),
                sha: self.sha.clone(),
            },
            EventKind::PullRequest => TriggerEvent::PullRequest {
                number: self.pr,
                base_branch: self.base.clone(),
                head_sha: self.sha.clone(),
            },
            EventKind::Schedule => TriggerEvent::Schedule {
                at: self.at.unwrap_or_else(Utc::now),
            },
        }
    }
}

#[derive(Subcommand)]
pub enum CacheCommands {
    /// List cache entries
    List {
        /// Cache key prefix
        #[arg(short, long, default_value = "")]
        prefix: String,
    },

    /// Clear cache
    Clear {
        /// Cache key prefix
        #[arg(short, long)]
        prefix: Option<String>,
    },
}

#[derive(Subcommand)]
pub enum ConfigCommands {
    /// Show current configuration
    Show,

    /// Set configuration value
    Set {
        /// Key
        key: String,

        /// Value
        value: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;
    use clap::Parser;

    #[derive(Parser)]
    struct Probe {
        #[command(flatten)]
        event: EventArgs,
    }

    fn parse(args: &[&str]) -> TriggerEvent {
        let mut argv = vec!["probe"];
        argv.extend_from_slice(args);
        Probe::parse_from(argv).event.to_event()
    }

    #[test]
    fn test_default_is_push_to_main() {
        assert_eq!(
            parse(&[]),
            TriggerEvent::Push {
                branch: "main".into(),
                sha: None
            }
        );
    }

    #[test]
    fn test_pull_request_event() {
        assert_eq!(
            parse(&["--event", "pull-request", "--pr", "9", "--sha", "abc"]),
            TriggerEvent::PullRequest {
                number: 9,
                base_branch: "main".into(),
                head_sha: Some("abc".into()),
            }
        );
    }

    #[test]
    fn test_schedule_event() {
        assert_eq!(
            parse(&["--event", "schedule", "--at", "2024-03-15T00:00:00Z"]),
            TriggerEvent::Schedule {
                at: Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap(),
            }
        );
    }
}
