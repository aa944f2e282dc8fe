//! Dispatch of `uses:` steps to built-in actions.

use crate::runner::{OutputLine, OutputStream, StepContext, StepResult, StepRunner};
use async_trait::async_trait;
use gauntlet_core::pipeline::{StepKind, StepSpec};
use gauntlet_core::{Error, Result};
use gauntlet_plugins::{PluginCallInput, get_builtin_plugin};
use tokio::sync::mpsc;
use tracing::info;

/// Runs action steps through the built-in plugin table.
#[derive(Debug, Clone, Default)]
pub struct PluginRunner;

impl PluginRunner {
    pub fn new() -> Self {
        Self
    }
}

#[async_trait]
impl StepRunner for PluginRunner {
    async fn execute(
        &self,
        ctx: &StepContext,
        output_tx: mpsc::Sender<OutputLine>,
    ) -> Result<StepResult> {
        let StepKind::Action { uses, with } = &ctx.step.kind else {
            return Err(Error::Internal("Step is not an action".to_string()));
        };
        let plugin = get_builtin_plugin(uses)
            .ok_or_else(|| Error::Internal(format!("Unknown action '{}'", uses)))?;

        info!(action = %uses, plugin = plugin.name(), "Running action");
        let start = std::time::Instant::now();
        let input = PluginCallInput {
            params: with.clone(),
            env: ctx
                .variables
                .iter()
                .map(|(k, v)| (k.clone(), v.clone()))
                .collect(),
            workspace: ctx.workspace.clone(),
            step_name: ctx.step.display_name(),
            event: ctx.event.clone(),
            repository: ctx.repository.clone(),
        };

        let output = plugin.execute(&input).await?;

        for (index, line) in output.logs.into_iter().enumerate() {
            let _ = output_tx
                .send(OutputLine::new(OutputStream::Stdout, line, index as u32 + 1))
                .await;
        }

        let mut result = StepResult::from_exit_code(0, start.elapsed().as_millis() as u64);
        result.outputs = output.outputs;
        Ok(result)
    }

    fn can_handle(&self, step: &StepSpec) -> bool {
        step.uses().is_some_and(|uses| get_builtin_plugin(uses).is_some())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_core::ErrorKind;
    use std::collections::{BTreeMap, HashMap};

    #[test]
    fn test_handles_builtin_actions_only() {
        let runner = PluginRunner::new();
        assert!(runner.can_handle(&StepSpec::action(
            "Checkout",
            "actions/checkout@v2",
            BTreeMap::new()
        )));
        assert!(!runner.can_handle(&StepSpec::action(
            "Cache",
            "actions/cache@v2",
            BTreeMap::new()
        )));
        assert!(!runner.can_handle(&StepSpec::command("Build", "cargo build")));
    }

    #[tokio::test]
    async fn test_action_failure_keeps_its_kind() {
        let dir = tempfile::tempdir().unwrap();
        let ctx = StepContext {
            workspace: dir.path().to_path_buf(),
            variables: HashMap::new(),
            step: StepSpec::action(
                "Install toolchain",
                "actions-rs/toolchain@v1",
                BTreeMap::from([("toolchain".to_string(), "bogus channel".to_string())]),
            ),
            position: 1,
            event: BTreeMap::new(),
            repository: None,
        };
        let (tx, _rx) = mpsc::channel(10);
        let err = PluginRunner::new().execute(&ctx, tx).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provisioning);
    }
}
