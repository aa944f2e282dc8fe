//! Shell-based step execution on the host.

use crate::runner::{OutputLine, OutputStream, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gauntlet_core::pipeline::{StepKind, StepSpec};
use gauntlet_core::{Error, Result};
use std::process::Stdio;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tracing::{debug, info};

/// Runs `run:` steps with `sh -c` in the job workspace.
#[derive(Debug, Clone)]
pub struct ShellRunner {
    shell: String,
}

impl ShellRunner {
    pub fn new() -> Self {
        Self {
            shell: "sh".to_string(),
        }
    }

    pub fn with_shell(shell: impl Into<String>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for ShellRunner {
    fn default() -> Self {
        Self::new()
    }
}

fn stream_lines<R>(
    reader: R,
    stream: OutputStream,
    tx: mpsc::Sender<OutputLine>,
) -> tokio::task::JoinHandle<()>
where
    R: AsyncRead + Unpin + Send + 'static,
{
    tokio::spawn(async move {
        let mut lines = BufReader::new(reader).lines();
        let mut line_number = 0u32;
        while let Ok(Some(line)) = lines.next_line().await {
            line_number += 1;
            if tx.send(OutputLine::new(stream, line, line_number)).await.is_err() {
                break;
            }
        }
    })
}

#[async_trait]
impl StepRunner for ShellRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let StepKind::Command { run } = &ctx.step.kind else {
            return Err(Error::Internal("No command to run".to_string()));
        };
        let start = std::time::Instant::now();

        info!(command = %run, workspace = %ctx.workspace.display(), "Executing shell command");

        let mut child = Command::new(&self.shell)
            .arg("-c")
            .arg(run)
            .current_dir(&ctx.workspace)
            .envs(&ctx.variables)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| Error::Internal(format!("Failed to spawn process: {}", e)))?;

        let stdout = child
            .stdout
            .take()
            .map(|out| stream_lines(out, OutputStream::Stdout, output_tx.clone()));
        let stderr = child
            .stderr
            .take()
            .map(|err| stream_lines(err, OutputStream::Stderr, output_tx));

        let status = child
            .wait()
            .await
            .map_err(|e| Error::Internal(format!("Failed to wait for process: {}", e)))?;

        for handle in [stdout, stderr].into_iter().flatten() {
            let _ = handle.await;
        }

        // Killed by a signal: no exit code.
        let exit_code = status.code().unwrap_or(-1);
        let duration_ms = start.elapsed().as_millis() as u64;
        debug!(exit_code, duration_ms, "Command completed");

        Ok(StepResult::from_exit_code(exit_code, duration_ms))
    }

    fn can_handle(&self, step: &StepSpec) -> bool {
        matches!(step.kind, StepKind::Command { .. })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::{BTreeMap, HashMap};

    fn ctx(cmd: &str) -> StepContext {
        StepContext {
            workspace: std::env::temp_dir(),
            variables: HashMap::from([("GREETING".to_string(), "hello".to_string())]),
            step: StepSpec::command("test", cmd),
            position: 1,
            event: BTreeMap::new(),
            repository: None,
        }
    }

    #[tokio::test]
    async fn test_shell_runner_success() {
        let runner = ShellRunner::default();
        let (tx, mut rx) = mpsc::channel(100);

        let result = runner.execute(&ctx("echo $GREETING"), tx).await.unwrap();
        assert!(result.success);
        assert_eq!(result.exit_code, 0);

        let line = rx.recv().await.unwrap();
        assert_eq!(line.content, "hello");
        assert_eq!(line.stream, OutputStream::Stdout);
    }

    #[tokio::test]
    async fn test_shell_runner_failure() {
        let runner = ShellRunner::default();
        let (tx, _rx) = mpsc::channel(100);

        let result = runner.execute(&ctx("exit 3"), tx).await.unwrap();
        assert!(!result.success);
        assert_eq!(result.exit_code, 3);
    }

    #[test]
    fn test_only_handles_commands() {
        let runner = ShellRunner::default();
        assert!(runner.can_handle(&StepSpec::command("b", "cargo build")));
        assert!(!runner.can_handle(&StepSpec::action(
            "c",
            "actions/checkout@v2",
            BTreeMap::new()
        )));
    }
}
