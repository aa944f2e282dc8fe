//! Sequential execution of one job run.

use crate::environments::Environment;
use crate::runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
use gauntlet_cache::{CacheManager, CacheRestoreRequest, CacheSaveRequest, CompressionType, resolve_key};
use gauntlet_core::interpolation::InterpolationContext;
use gauntlet_core::pipeline::{StepKind, StepSpec};
use gauntlet_core::run::{
    CacheLookup, CacheReport, CacheSaveStatus, FailurePoint, JobRun, JobStatus, StepOutcome,
    StepStatus,
};
use gauntlet_core::{Error, ErrorKind, Result};
use gauntlet_plugins::is_cache_action;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Position reported when the environment itself cannot be prepared.
const ENVIRONMENT_POSITION: usize = 0;

/// Runs the steps of a job strictly in order, stopping at the first
/// failure.
#[derive(Clone)]
pub struct JobExecutor {
    runners: Vec<Arc<dyn StepRunner>>,
    cache: Option<CacheManager>,
    config: RunnerConfig,
}

/// Save half of a cache step, run once the job has a final status.
struct PendingSave {
    report_index: usize,
    request: Option<CacheSaveRequest>,
}

enum StepEnd {
    Succeeded(StepResult),
    Failed { exit_code: Option<i32>, error: Error },
    Cancelled,
}

impl JobExecutor {
    pub fn new(runners: Vec<Arc<dyn StepRunner>>, config: RunnerConfig) -> Self {
        Self {
            runners,
            cache: None,
            config,
        }
    }

    pub fn with_cache(mut self, cache: CacheManager) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn config(&self) -> &RunnerConfig {
        &self.config
    }

    /// Execute `steps` for `job`, recording outcomes on it.
    ///
    /// Only lifecycle violations are returned as errors; step, provisioning
    /// and cache failures end up in the returned job run.
    pub async fn execute(
        &self,
        mut job: JobRun,
        steps: &[StepSpec],
        ctx: &InterpolationContext,
        env: &dyn Environment,
        cancel: CancellationToken,
    ) -> Result<JobRun> {
        if cancel.is_cancelled() {
            info!(job = %job.display_name, "Job cancelled before start");
            mark_remaining(&mut job, steps, 0, StepStatus::Cancelled);
            job.transition(JobStatus::Cancelled)?;
            return Ok(job);
        }

        job.transition(JobStatus::Running)?;
        info!(job = %job.display_name, runner = %job.runner, "Job started");

        if let Err(e) = env.prepare().await {
            error!(job = %job.display_name, error = %e, "Environment provisioning failed");
            job.failure = Some(FailurePoint {
                position: ENVIRONMENT_POSITION,
                step_name: "Set up environment".to_string(),
                kind: ErrorKind::Provisioning,
                message: e.to_string(),
            });
            mark_remaining(&mut job, steps, 0, StepStatus::Skipped);
            job.transition(JobStatus::Failed)?;
            return Ok(job);
        }

        let mut pending_saves = Vec::new();
        let mut final_status = JobStatus::Succeeded;

        for (index, step) in steps.iter().enumerate() {
            let position = index + 1;
            let name = step.display_name();

            if cancel.is_cancelled() {
                final_status = JobStatus::Cancelled;
                mark_remaining(&mut job, steps, index, StepStatus::Cancelled);
                break;
            }

            if let StepKind::Action { uses, with } = &step.kind
                && is_cache_action(uses)
            {
                let start = Instant::now();
                let pending = self.restore_cache(&mut job, &name, with, ctx, env).await;
                pending_saves.push(pending);
                job.steps.push(StepOutcome {
                    position,
                    name,
                    status: StepStatus::Succeeded,
                    exit_code: None,
                    duration_ms: start.elapsed().as_millis() as u64,
                });
                continue;
            }

            info!(job = %job.display_name, step = %name, position, "Running step");
            let start = Instant::now();
            let end = self.run_step(step, position, ctx, env, &job, &cancel).await;
            let duration_ms = start.elapsed().as_millis() as u64;

            match end {
                StepEnd::Succeeded(result) => {
                    debug!(step = %name, duration_ms, "Step succeeded");
                    job.steps.push(StepOutcome {
                        position,
                        name,
                        status: StepStatus::Succeeded,
                        exit_code: Some(result.exit_code),
                        duration_ms,
                    });
                }
                StepEnd::Failed { exit_code, error } => {
                    warn!(job = %job.display_name, step = %name, position, error = %error, "Step failed");
                    job.steps.push(StepOutcome {
                        position,
                        name: name.clone(),
                        status: StepStatus::Failed,
                        exit_code,
                        duration_ms,
                    });
                    job.failure = Some(FailurePoint {
                        position,
                        step_name: name,
                        kind: error.kind(),
                        message: error.to_string(),
                    });
                    mark_remaining(&mut job, steps, position, StepStatus::Skipped);
                    final_status = JobStatus::Failed;
                    break;
                }
                StepEnd::Cancelled => {
                    info!(job = %job.display_name, step = %name, "Step interrupted by cancellation");
                    job.steps.push(StepOutcome {
                        position,
                        name,
                        status: StepStatus::Cancelled,
                        exit_code: None,
                        duration_ms,
                    });
                    mark_remaining(&mut job, steps, position, StepStatus::Cancelled);
                    final_status = JobStatus::Cancelled;
                    break;
                }
            }
        }

        self.finish_caches(&mut job, pending_saves, final_status).await;

        if let Err(e) = env.cleanup().await {
            warn!(job = %job.display_name, error = %e, "Environment cleanup failed");
        }

        job.transition(final_status)?;
        info!(
            job = %job.display_name,
            status = %job.status,
            duration_ms = job.duration_ms().unwrap_or_default(),
            "Job finished"
        );
        Ok(job)
    }

    async fn run_step(
        &self,
        step: &StepSpec,
        position: usize,
        ctx: &InterpolationContext,
        env: &dyn Environment,
        job: &JobRun,
        cancel: &CancellationToken,
    ) -> StepEnd {
        let step = interpolate_step(step, ctx);
        let Some(runner) = self.runners.iter().find(|r| r.can_handle(&step)) else {
            let what = step.uses().unwrap_or("command").to_string();
            return StepEnd::Failed {
                exit_code: None,
                error: Error::Internal(format!("No runner can execute '{}'", what)),
            };
        };

        let step_ctx = StepContext {
            workspace: env.working_dir().to_path_buf(),
            variables: step_environment(ctx, job, env, self.config.rustup_home.as_deref()),
            position,
            event: ctx
                .event
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            repository: self.config.repository.clone(),
            step,
        };
        let timeout = self.config.timeout_for(&step_ctx.step);

        let (tx, rx) = mpsc::channel::<OutputLine>(256);
        tokio::spawn(log_output(rx, job.display_name.clone(), position));

        let execution = async {
            let run = runner.execute(&step_ctx, tx);
            match timeout {
                Some(limit) => match tokio::time::timeout(limit, run).await {
                    Ok(result) => result,
                    Err(_) => Err(Error::StepTimeout {
                        timeout_secs: limit.as_secs(),
                    }),
                },
                None => run.await,
            }
        };

        tokio::select! {
            biased;
            _ = cancel.cancelled() => StepEnd::Cancelled,
            outcome = execution => match outcome {
                Ok(result) if result.success => StepEnd::Succeeded(result),
                Ok(result) => StepEnd::Failed {
                    exit_code: Some(result.exit_code),
                    error: Error::StepFailed {
                        exit_code: result.exit_code,
                        message: format!("process exited with code {}", result.exit_code),
                    },
                },
                Err(error) => StepEnd::Failed { exit_code: None, error },
            },
        }
    }

    /// Restore half of a cache step. Never fails the job: resolution and
    /// storage problems degrade to a miss.
    async fn restore_cache(
        &self,
        job: &mut JobRun,
        step_name: &str,
        with: &BTreeMap<String, String>,
        ctx: &InterpolationContext,
        env: &dyn Environment,
    ) -> PendingSave {
        let workspace = env.working_dir();
        let paths = split_lines(with.get("path"), ctx);
        let restore_keys = split_lines(with.get("restore-keys"), ctx);
        let template = with.get("key").map(String::as_str).unwrap_or_default();

        let key = match resolve_key(template, ctx, workspace) {
            Ok(key) => Some(key),
            Err(e) => {
                warn!(job = %job.display_name, step = %step_name, error = %e, "Cache key unresolved, continuing without cache");
                None
            }
        };

        let lookup = match (&key, &self.cache) {
            (None, _) => CacheLookup::Unresolved,
            (Some(_), None) => CacheLookup::Miss,
            (Some(key), Some(cache)) => {
                cache
                    .restore(CacheRestoreRequest {
                        key: key.clone(),
                        restore_keys,
                        paths: paths.clone(),
                        scope: None,
                        base_dir: workspace.to_path_buf(),
                        home_dir: Some(env.home_dir().to_path_buf()),
                    })
                    .await
                    .lookup
            }
        };
        info!(job = %job.display_name, key = key.as_deref().unwrap_or("-"), lookup = ?lookup, "Cache lookup");

        let request = key.as_ref().map(|key| CacheSaveRequest {
            key: key.clone(),
            paths,
            scope: None,
            base_dir: workspace.to_path_buf(),
            home_dir: Some(env.home_dir().to_path_buf()),
            compression: CompressionType::Zstd,
        });

        job.caches.push(CacheReport {
            step_name: step_name.to_string(),
            key,
            lookup,
            save: CacheSaveStatus::Pending,
        });
        PendingSave {
            report_index: job.caches.len() - 1,
            request,
        }
    }

    async fn finish_caches(&self, job: &mut JobRun, pending: Vec<PendingSave>, status: JobStatus) {
        for save in pending {
            let lookup = job.caches[save.report_index].lookup.clone();
            let outcome = match (save.request, &self.cache) {
                (Some(request), Some(cache)) => cache.save(&lookup, status, request).await,
                (None, _) => CacheSaveStatus::Skipped("key unresolved".to_string()),
                (Some(_), None) => CacheSaveStatus::Skipped("no cache configured".to_string()),
            };
            job.caches[save.report_index].save = outcome;
        }
    }
}

/// Record every step from `from` (0-based) onwards with `status`.
fn mark_remaining(job: &mut JobRun, steps: &[StepSpec], from: usize, status: StepStatus) {
    for (index, step) in steps.iter().enumerate().skip(from) {
        job.steps
            .push(StepOutcome::not_run(index + 1, step.display_name(), status));
    }
}

fn split_lines(value: Option<&String>, ctx: &InterpolationContext) -> Vec<String> {
    value
        .map(|v| {
            v.lines()
                .map(|line| ctx.interpolate(line.trim()))
                .filter(|line| !line.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

fn interpolate_step(step: &StepSpec, ctx: &InterpolationContext) -> StepSpec {
    let kind = match &step.kind {
        StepKind::Command { run } => StepKind::Command {
            run: ctx.interpolate(run),
        },
        StepKind::Action { uses, with } => StepKind::Action {
            uses: uses.clone(),
            with: with
                .iter()
                .map(|(k, v)| (k.clone(), ctx.interpolate(v)))
                .collect(),
        },
    };
    StepSpec {
        name: step.name.clone(),
        kind,
        timeout_minutes: step.timeout_minutes,
    }
}

fn step_environment(
    ctx: &InterpolationContext,
    job: &JobRun,
    env: &dyn Environment,
    rustup_home: Option<&Path>,
) -> HashMap<String, String> {
    let path = |p: &Path| p.to_string_lossy().into_owned();
    let mut vars = ctx.variables.clone();
    vars.insert("CI".to_string(), "true".to_string());
    vars.insert("GAUNTLET_JOB".to_string(), job.display_name.clone());
    vars.insert("GAUNTLET_WORKSPACE".to_string(), path(env.working_dir()));
    vars.insert("HOME".to_string(), path(env.home_dir()));
    vars.insert("CARGO_HOME".to_string(), path(&env.home_dir().join(".cargo")));
    if let Some(rustup_home) = rustup_home {
        vars.insert("RUSTUP_HOME".to_string(), path(rustup_home));
    }
    vars
}

async fn log_output(mut rx: mpsc::Receiver<OutputLine>, job: String, position: usize) {
    while let Some(line) = rx.recv().await {
        match line.stream {
            OutputStream::Stdout => debug!(job = %job, step = position, "{}", line.content),
            OutputStream::Stderr => debug!(job = %job, step = position, stream = "stderr", "{}", line.content),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::environments::HostEnvironment;
    use crate::shell::ShellRunner;
    use std::time::Duration;

    fn job() -> JobRun {
        JobRun::new("test", "test", vec![], "ubuntu-latest")
    }

    fn executor(config: RunnerConfig) -> JobExecutor {
        let shell: Arc<dyn StepRunner> = Arc::new(ShellRunner::new());
        JobExecutor::new(vec![shell], config)
    }

    #[tokio::test]
    async fn test_fail_fast() {
        let root = tempfile::tempdir().unwrap();
        let env = HostEnvironment::new(root.path().join("ws"));
        let steps = vec![
            StepSpec::command("one", "true"),
            StepSpec::command("two", "exit 4"),
            StepSpec::command("three", "touch should-not-exist"),
        ];

        let run = executor(RunnerConfig::default())
            .execute(job(), &steps, &InterpolationContext::new(), &env, CancellationToken::new())
            .await
            .unwrap();

        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.executed_steps(), vec!["one", "two"]);
        assert_eq!(run.steps[2].status, StepStatus::Skipped);
        let failure = run.failure.unwrap();
        assert_eq!(failure.position, 2);
        assert_eq!(failure.kind, ErrorKind::StepFailure);
        assert_eq!(run.steps[1].exit_code, Some(4));
    }

    #[tokio::test]
    async fn test_timeout_is_step_failure() {
        let root = tempfile::tempdir().unwrap();
        let env = HostEnvironment::new(root.path().join("ws"));
        let steps = vec![StepSpec::command("slow", "sleep 5")];
        let config = RunnerConfig {
            default_timeout: Some(Duration::from_millis(100)),
            ..Default::default()
        };

        let run = executor(config)
            .execute(job(), &steps, &InterpolationContext::new(), &env, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.failure.unwrap().kind, ErrorKind::StepFailure);
    }

    #[tokio::test]
    async fn test_cancelled_before_start() {
        let root = tempfile::tempdir().unwrap();
        let env = HostEnvironment::new(root.path().join("ws"));
        let cancel = CancellationToken::new();
        cancel.cancel();

        let steps = vec![StepSpec::command("one", "true")];
        let run = executor(RunnerConfig::default())
            .execute(job(), &steps, &InterpolationContext::new(), &env, cancel)
            .await
            .unwrap();
        assert_eq!(run.status, JobStatus::Cancelled);
        assert_eq!(run.steps[0].status, StepStatus::Cancelled);
        assert!(run.started_at.is_none());
    }

    #[tokio::test]
    async fn test_provisioning_failure_skips_steps() {
        let root = tempfile::tempdir().unwrap();
        std::fs::write(root.path().join("file"), "x").unwrap();
        let env = HostEnvironment::new(root.path().join("file/ws"));

        let steps = vec![StepSpec::command("one", "true")];
        let run = executor(RunnerConfig::default())
            .execute(job(), &steps, &InterpolationContext::new(), &env, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, JobStatus::Failed);
        assert_eq!(run.failure.as_ref().unwrap().kind, ErrorKind::Provisioning);
        assert!(run.executed_steps().is_empty());
    }

    #[tokio::test]
    async fn test_steps_get_private_home() {
        let root = tempfile::tempdir().unwrap();
        let env = HostEnvironment::new(root.path().join("job")).keep_workspace(true);
        let steps = vec![StepSpec::command(
            "env",
            "echo \"$HOME|$CARGO_HOME|$RUSTUP_HOME\" > seen",
        )];
        let config = RunnerConfig {
            rustup_home: Some(root.path().join("rustup")),
            ..Default::default()
        };

        let run = executor(config)
            .execute(job(), &steps, &InterpolationContext::new(), &env, CancellationToken::new())
            .await
            .unwrap();
        assert_eq!(run.status, JobStatus::Succeeded);

        let seen = std::fs::read_to_string(env.working_dir().join("seen")).unwrap();
        let home = env.home_dir();
        assert_eq!(
            seen.trim(),
            format!(
                "{}|{}|{}",
                home.display(),
                home.join(".cargo").display(),
                root.path().join("rustup").display()
            )
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_cancelling_action_step_stops_its_process() {
        use crate::plugin::PluginRunner;
        use std::os::unix::fs::PermissionsExt;

        let root = tempfile::tempdir().unwrap();
        let bin = root.path().join("bin");
        std::fs::create_dir_all(&bin).unwrap();
        let marker = root.path().join("written-after-cancel");
        let git = bin.join("git");
        std::fs::write(&git, "#!/bin/sh\nsleep 1\ntouch \"$LATE_MARKER\"\n").unwrap();
        std::fs::set_permissions(&git, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut ctx = InterpolationContext::new();
        let path = std::env::var("PATH").unwrap_or_default();
        ctx.variables.insert("PATH".into(), format!("{}:{}", bin.display(), path));
        ctx.variables.insert("LATE_MARKER".into(), marker.to_string_lossy().into_owned());

        let plugins: Arc<dyn StepRunner> = Arc::new(PluginRunner::new());
        let executor = JobExecutor::new(
            vec![plugins],
            RunnerConfig {
                repository: Some("https://example.invalid/repo.git".into()),
                ..Default::default()
            },
        );
        let env = HostEnvironment::new(root.path().join("job"));
        let steps = vec![StepSpec::action("Checkout", "actions/checkout@v2", BTreeMap::new())];

        let cancel = CancellationToken::new();
        let trigger = cancel.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            trigger.cancel();
        });

        let run = executor.execute(job(), &steps, &ctx, &env, cancel).await.unwrap();
        assert_eq!(run.status, JobStatus::Cancelled);
        assert_eq!(run.steps[0].status, StepStatus::Cancelled);

        tokio::time::sleep(Duration::from_millis(1500)).await;
        assert!(!marker.exists());
    }

    #[test]
    fn test_interpolate_step() {
        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("toolchain".into(), "stable".into());
        let step = StepSpec::action(
            "Install",
            "actions-rs/toolchain@v1",
            BTreeMap::from([("toolchain".to_string(), "${{ matrix.toolchain }}".to_string())]),
        );
        let StepKind::Action { with, .. } = interpolate_step(&step, &ctx).kind else {
            panic!("expected action");
        };
        assert_eq!(with["toolchain"], "stable");
    }

    #[test]
    fn test_split_lines() {
        let mut ctx = InterpolationContext::new();
        ctx.matrix.insert("os".into(), "ubuntu-latest".into());
        let value = "~/.cargo/registry\n  ${{ matrix.os }}-x\n\n".to_string();
        assert_eq!(
            split_lines(Some(&value), &ctx),
            vec!["~/.cargo/registry", "ubuntu-latest-x"]
        );
    }
}
