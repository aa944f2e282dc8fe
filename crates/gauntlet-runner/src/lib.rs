//! Step execution engine for Gauntlet CI.

pub mod environments;
pub mod job;
pub mod plugin;
pub mod runner;
pub mod shell;

pub use environments::{Environment, HostEnvironment};
pub use job::JobExecutor;
pub use plugin::PluginRunner;
pub use runner::{OutputLine, OutputStream, RunnerConfig, StepContext, StepResult, StepRunner};
pub use shell::ShellRunner;

use std::sync::Arc;

/// The runners a host job needs: shell commands and built-in actions.
pub fn default_runners() -> Vec<Arc<dyn StepRunner>> {
    let shell: Arc<dyn StepRunner> = Arc::new(ShellRunner::new());
    let plugins: Arc<dyn StepRunner> = Arc::new(PluginRunner::new());
    vec![shell, plugins]
}
