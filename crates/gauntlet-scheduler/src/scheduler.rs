//! Main scheduler orchestration.

use crate::matrix::{MatrixExpander, MatrixJob};
use crate::triggers::{TriggerEvent, TriggerMatcher};

use chrono::Utc;
use gauntlet_core::ids::RunId;
use gauntlet_core::interpolation::InterpolationContext;
use gauntlet_core::pipeline::{PipelineDefinition, StepSpec};
use gauntlet_core::run::{JobRun, PipelineRun, RunStatus, TriggerContext};
use gauntlet_core::{Error, Result};
use gauntlet_runner::{HostEnvironment, JobExecutor};
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

/// Scheduler settings.
#[derive(Debug, Clone)]
pub struct SchedulerConfig {
    /// Each job run gets `<workspace_root>/<run id>/<job id>`, holding its
    /// `workspace/` and a private `home/`.
    pub workspace_root: PathBuf,
    /// Upper bound on concurrently running jobs across the whole run.
    pub max_parallel: Option<usize>,
    /// Leave job workspaces on disk after the run.
    pub keep_workspaces: bool,
}

impl SchedulerConfig {
    pub fn new(workspace_root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: workspace_root.into(),
            max_parallel: None,
            keep_workspaces: false,
        }
    }
}

/// A job run ready to be scheduled.
struct PlannedJob {
    run: JobRun,
    steps: Arc<Vec<StepSpec>>,
    context: InterpolationContext,
    limit: Option<Arc<Semaphore>>,
}

/// Evaluates triggers, expands matrices and drives job runs to completion.
pub struct Scheduler {
    executor: JobExecutor,
    trigger_matcher: TriggerMatcher,
    matrix_expander: MatrixExpander,
    config: SchedulerConfig,
}

impl Scheduler {
    pub fn new(executor: JobExecutor, config: SchedulerConfig) -> Self {
        Self {
            executor,
            trigger_matcher: TriggerMatcher::new(),
            matrix_expander: MatrixExpander::new(),
            config,
        }
    }

    /// Handle a trigger event. Returns `None` when the pipeline does not
    /// run for this event.
    pub async fn handle_trigger(
        &self,
        definition: &PipelineDefinition,
        event: &TriggerEvent,
        cancel: CancellationToken,
    ) -> Result<Option<PipelineRun>> {
        let Some(trigger) = self.trigger_matcher.evaluate(definition, event) else {
            info!(pipeline = %definition.name, event = %event.kind(), "Event does not trigger pipeline");
            return Ok(None);
        };
        self.run(definition, trigger, cancel).await.map(Some)
    }

    /// Expand every job of `definition` into job runs, in declaration order.
    pub fn plan(&self, definition: &PipelineDefinition) -> Vec<(MatrixJob, String)> {
        definition
            .jobs
            .iter()
            .flat_map(|(name, spec)| {
                self.matrix_expander
                    .expand(name, spec)
                    .into_iter()
                    .map(move |matrix_job| {
                        let runner = matrix_job.context().interpolate(&spec.runs_on);
                        (matrix_job, runner)
                    })
            })
            .collect()
    }

    /// Execute a pipeline run for an already-evaluated trigger.
    pub async fn run(
        &self,
        definition: &PipelineDefinition,
        trigger: TriggerContext,
        cancel: CancellationToken,
    ) -> Result<PipelineRun> {
        let mut run = PipelineRun {
            id: RunId::new(),
            pipeline_name: definition.name.clone(),
            trigger,
            jobs: Vec::new(),
            started_at: Utc::now(),
            completed_at: None,
        };
        info!(run_id = %run.id, pipeline = %run.pipeline_name, trigger = %run.trigger.kind, "Pipeline run started");

        let planned = self.plan_jobs(definition, &run.trigger);
        let global_limit = self.config.max_parallel.map(|n| Arc::new(Semaphore::new(n.max(1))));
        let run_dir = self.config.workspace_root.join(run.id.to_string());

        let mut slots: Vec<Option<JobRun>> = vec![None; planned.len()];
        let mut set = JoinSet::new();

        for (index, job) in planned.into_iter().enumerate() {
            let executor = self.executor.clone();
            let global = global_limit.clone();
            let job_dir = run_dir.join(job.run.id.short());
            let keep = self.config.keep_workspaces;
            let job_cancel = cancel.child_token();

            set.spawn(async move {
                let mut permits = Vec::new();
                for limit in [job.limit, global].into_iter().flatten() {
                    tokio::select! {
                        _ = job_cancel.cancelled() => break,
                        permit = limit.acquire_owned() => match permit {
                            Ok(permit) => permits.push(permit),
                            Err(e) => return (index, Err(Error::Internal(e.to_string()))),
                        },
                    }
                }

                let env = HostEnvironment::new(job_dir).keep_workspace(keep);
                let result = executor
                    .execute(job.run, &job.steps, &job.context, &env, job_cancel)
                    .await;
                drop(permits);
                (index, result)
            });
        }

        while let Some(joined) = set.join_next().await {
            let (index, result) =
                joined.map_err(|e| Error::Internal(format!("Job task failed: {}", e)))?;
            slots[index] = Some(result?);
        }

        run.jobs = slots.into_iter().flatten().collect();
        run.completed_at = Some(Utc::now());

        let status = run.status();
        match status {
            RunStatus::Succeeded => info!(run_id = %run.id, jobs = run.jobs.len(), "Pipeline run succeeded"),
            _ => {
                for job in &run.jobs {
                    let Some(failure) = &job.failure else { continue };
                    warn!(
                        run_id = %run.id,
                        job = %job.display_name,
                        step = %failure.step_name,
                        position = failure.position,
                        "Job failed"
                    );
                }
                info!(run_id = %run.id, status = ?status, "Pipeline run finished");
            }
        }

        Ok(run)
    }

    fn plan_jobs(&self, definition: &PipelineDefinition, trigger: &TriggerContext) -> Vec<PlannedJob> {
        let event: HashMap<String, String> = trigger.fields().into_iter().collect();
        let mut planned = Vec::new();

        for (name, spec) in &definition.jobs {
            let steps = Arc::new(spec.steps.clone());
            let limit = spec
                .max_parallel()
                .map(|n| Arc::new(Semaphore::new(n.max(1) as usize)));

            for matrix_job in self.matrix_expander.expand(name, spec) {
                let mut context = matrix_job.context();
                context.event = event.clone();
                let runner = context.interpolate(&spec.runs_on);
                context.runner_os = Some(runner.clone());

                planned.push(PlannedJob {
                    run: JobRun::new(
                        name.clone(),
                        matrix_job.display_name,
                        matrix_job.values,
                        runner,
                    ),
                    steps: steps.clone(),
                    context,
                    limit: limit.clone(),
                });
            }
        }
        planned
    }
}
