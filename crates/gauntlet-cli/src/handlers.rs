//! Command handlers.

use crate::commands::EventArgs;
use crate::config::CliConfig;
use console::style;
use gauntlet_cache::{CacheManager, CacheProvider, FilesystemProvider};
use gauntlet_core::pipeline::PipelineDefinition;
use gauntlet_core::run::{
    CacheLookup, CacheSaveStatus, JobRun, JobStatus, PipelineRun, RunStatus, StepStatus,
};
use gauntlet_runner::{JobExecutor, RunnerConfig, default_runners};
use gauntlet_scheduler::{MatrixExpander, Scheduler, SchedulerConfig, TriggerMatcher};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

type HandlerResult = Result<(), Box<dyn std::error::Error>>;

/// Options for a local run.
pub struct RunOptions {
    pub file: PathBuf,
    pub event: EventArgs,
    pub repo: String,
    pub max_parallel: Option<usize>,
    pub timeout_minutes: Option<u32>,
    pub no_cache: bool,
    pub keep_workspaces: bool,
    pub json: bool,
}

/// Validate a pipeline definition.
pub fn validate(path: &Path) -> HandlerResult {
    let definition = PipelineDefinition::from_file(path)?;

    println!(
        "{} Pipeline \"{}\" is valid",
        style("✓").green(),
        definition.name
    );
    println!("  Jobs: {}", definition.jobs.len());
    for (name, job) in &definition.jobs {
        println!("    - {} ({} steps, runs-on {})", name, job.steps.len(), job.runs_on);
    }

    Ok(())
}

/// Report whether an event would start a run.
pub fn trigger(path: &Path, event: &EventArgs) -> HandlerResult {
    let definition = PipelineDefinition::from_file(path)?;
    let event = event.to_event();

    match TriggerMatcher::new().evaluate(&definition, &event) {
        Some(context) => {
            println!(
                "{} {} event triggers \"{}\"",
                style("✓").green(),
                context.kind,
                definition.name
            );
            for (field, value) in context.fields() {
                println!("  {}: {}", field, value);
            }
        }
        None => println!(
            "{} {} event does not trigger \"{}\"",
            style("i").blue(),
            event.kind(),
            definition.name
        ),
    }

    Ok(())
}

/// Print the job runs each job expands to.
pub fn matrix(path: &Path) -> HandlerResult {
    let definition = PipelineDefinition::from_file(path)?;
    let expander = MatrixExpander::new();

    for (name, job) in &definition.jobs {
        let runs = expander.expand(name, job);
        println!("{} {} ({} runs)", style("▶").cyan(), name, runs.len());
        for matrix_job in runs {
            let runner = matrix_job.context().interpolate(&job.runs_on);
            println!("    {} on {}", matrix_job.display_name, runner);
        }
    }

    Ok(())
}

/// Run a pipeline on this machine.
pub async fn run(config: &CliConfig, options: RunOptions) -> HandlerResult {
    let definition = PipelineDefinition::from_file(&options.file)?;
    let event = options.event.to_event();

    let runner_config = RunnerConfig {
        default_timeout: options
            .timeout_minutes
            .map(|m| Duration::from_secs(u64::from(m) * 60)),
        rustup_home: rustup_home(),
        repository: Some(resolve_repository(&options.repo)),
    };
    let mut executor = JobExecutor::new(default_runners(), runner_config);
    if !options.no_cache {
        let provider: Arc<dyn CacheProvider> = Arc::new(FilesystemProvider::new(config.cache_dir()?));
        executor = executor.with_cache(CacheManager::new(
            provider,
            Some(config.namespace().to_string()),
        ));
    }

    let scheduler_config = SchedulerConfig {
        workspace_root: config.workspace_root()?,
        max_parallel: options.max_parallel.or(config.max_parallel),
        keep_workspaces: options.keep_workspaces,
    };
    info!(
        pipeline = %definition.name,
        workspace_root = %scheduler_config.workspace_root.display(),
        cache = !options.no_cache,
        "Starting local run"
    );
    let scheduler = Scheduler::new(executor, scheduler_config);

    let cancel = CancellationToken::new();
    let on_interrupt = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{} Interrupted, cancelling run", style("!").yellow());
            on_interrupt.cancel();
        }
    });

    let Some(pipeline_run) = scheduler.handle_trigger(&definition, &event, cancel).await? else {
        println!(
            "{} {} event does not trigger \"{}\"",
            style("i").blue(),
            event.kind(),
            definition.name
        );
        return Ok(());
    };

    if options.json {
        println!("{}", serde_json::to_string_pretty(&pipeline_run)?);
    } else {
        print_run(&pipeline_run);
    }

    if !pipeline_run.is_success() {
        std::process::exit(1);
    }
    Ok(())
}

/// Jobs get private homes but share the installed toolchains.
fn rustup_home() -> Option<PathBuf> {
    std::env::var_os("RUSTUP_HOME")
        .map(PathBuf::from)
        .or_else(|| directories::BaseDirs::new().map(|dirs| dirs.home_dir().join(".rustup")))
}

/// Local paths are handed to git as absolute paths; URLs pass through.
fn resolve_repository(repo: &str) -> String {
    let path = Path::new(repo);
    if path.exists() {
        std::fs::canonicalize(path)
            .map(|p| p.display().to_string())
            .unwrap_or_else(|_| repo.to_string())
    } else {
        repo.to_string()
    }
}

fn print_run(run: &PipelineRun) {
    println!(
        "{} {} run {} ({})",
        style("▶").cyan(),
        run.pipeline_name,
        run.id,
        run.trigger.kind
    );

    for job in &run.jobs {
        print_job(job);
    }

    let summary = match run.status() {
        RunStatus::Succeeded => style("✓ Run succeeded").green(),
        RunStatus::Failed if run.was_cancelled() => style("✗ Run failed (cancelled)").red(),
        RunStatus::Failed => style("✗ Run failed").red(),
        RunStatus::Running => style("! Run incomplete").yellow(),
    };
    println!("{}", summary);
}

fn print_job(job: &JobRun) {
    let marker = match job.status {
        JobStatus::Succeeded => style("✓").green(),
        JobStatus::Failed => style("✗").red(),
        JobStatus::Cancelled => style("!").yellow(),
        JobStatus::Pending | JobStatus::Running => style("?").dim(),
    };
    let duration = job
        .duration_ms()
        .map(|ms| format!(" in {:.1}s", ms as f64 / 1000.0))
        .unwrap_or_default();
    println!(
        "  {} {} on {} [{}]{}",
        marker, job.display_name, job.runner, job.status, duration
    );

    for step in &job.steps {
        let label = match step.status {
            StepStatus::Succeeded => style("ok").green(),
            StepStatus::Failed => style("failed").red(),
            StepStatus::Skipped => style("skipped").dim(),
            StepStatus::Cancelled => style("cancelled").yellow(),
        };
        println!("      {:>2}. {} {}", step.position, step.name, label);
    }

    if let Some(failure) = &job.failure {
        println!(
            "    {} step {} \"{}\" ({:?}): {}",
            style("failed at").red(),
            failure.position,
            failure.step_name,
            failure.kind,
            failure.message
        );
    }

    for cache in &job.caches {
        let lookup = match &cache.lookup {
            CacheLookup::Hit(key) => format!("hit {}", key),
            CacheLookup::PartialHit(key) => format!("partial hit {}", key),
            CacheLookup::Miss => "miss".to_string(),
            CacheLookup::Unresolved => "key unresolved".to_string(),
        };
        let save = match &cache.save {
            CacheSaveStatus::Pending => "pending".to_string(),
            CacheSaveStatus::Saved => "saved".to_string(),
            CacheSaveStatus::Skipped(reason) => format!("save skipped: {}", reason),
            CacheSaveStatus::Failed(message) => format!("save failed: {}", message),
        };
        println!(
            "    {} {} key={} {}, {}",
            style("cache").blue(),
            cache.step_name,
            cache.key.as_deref().unwrap_or("-"),
            lookup,
            save
        );
    }
}

/// List cache entries.
pub async fn list_cache(config: &CliConfig, prefix: &str) -> HandlerResult {
    let provider = FilesystemProvider::new(config.cache_dir()?);
    let entries = provider.list(prefix, Some(config.namespace())).await?;

    if entries.is_empty() {
        println!("{} No cache entries", style("i").blue());
        return Ok(());
    }

    println!("{:<60} {:>12} {:<20}", "KEY", "SIZE", "CREATED");
    println!("{}", "-".repeat(94));
    for entry in entries {
        println!(
            "{:<60} {:>12} {:<20}",
            entry.key,
            format_size(entry.size_bytes),
            entry.created_at.format("%Y-%m-%d %H:%M:%S")
        );
    }

    Ok(())
}

/// Clear cache entries, optionally only those under a key prefix.
pub async fn clear_cache(config: &CliConfig, prefix: Option<String>) -> HandlerResult {
    let provider = FilesystemProvider::new(config.cache_dir()?);
    let scope = Some(config.namespace());
    let entries = provider.list(prefix.as_deref().unwrap_or(""), scope).await?;

    for entry in &entries {
        provider.delete(&entry.key, scope).await?;
    }

    match prefix {
        Some(p) => println!(
            "{} Cleared {} entries with prefix: {}",
            style("✓").green(),
            entries.len(),
            p
        ),
        None => println!("{} Cleared {} entries", style("✓").green(), entries.len()),
    }

    Ok(())
}

fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 4] = ["B", "KiB", "MiB", "GiB"];
    let mut size = bytes as f64;
    let mut unit = 0;
    while size >= 1024.0 && unit < UNITS.len() - 1 {
        size /= 1024.0;
        unit += 1;
    }
    if unit == 0 {
        format!("{} {}", bytes, UNITS[0])
    } else {
        format!("{:.1} {}", size, UNITS[unit])
    }
}

/// Show current configuration.
pub fn show_config(config: &CliConfig) -> HandlerResult {
    println!("{}", style("Current configuration:").bold());
    println!("  Config file:     {}", CliConfig::config_path()?.display());
    println!("  Cache dir:       {}", config.cache_dir()?.display());
    println!("  Workspace root:  {}", config.workspace_root()?.display());
    println!("  Cache namespace: {}", config.namespace());
    println!(
        "  Max parallel:    {}",
        config
            .max_parallel
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unbounded".to_string())
    );
    println!("  Log format:      {:?}", config.log_format);
    Ok(())
}

/// Set configuration value.
pub fn set_config(key: &str, value: &str) -> HandlerResult {
    let mut config = CliConfig::load()?;
    config.set(key, value)?;
    config.save()?;
    println!("{} Set {} = {}", style("✓").green(), key, value);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_size() {
        assert_eq!(format_size(512), "512 B");
        assert_eq!(format_size(2048), "2.0 KiB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.0 MiB");
    }

    #[test]
    fn test_resolve_repository_passes_urls_through() {
        let url = "https://github.com/tree-sitter/tree-sitter-graph";
        assert_eq!(resolve_repository(url), url);
    }

    #[test]
    fn test_resolve_repository_canonicalizes_local_paths() {
        let dir = tempfile::tempdir().unwrap();
        let resolved = resolve_repository(dir.path().to_str().unwrap());
        assert!(Path::new(&resolved).is_absolute());
    }
}
