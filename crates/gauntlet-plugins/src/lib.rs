//! Built-in actions for Gauntlet CI.
//!
//! A step's `uses:` reference is resolved to a native [`Plugin`]. The cache
//! action is not a plugin; the job executor drives it through the cache
//! manager because it has a post-job half.

pub mod git;
pub mod manifest;
pub mod rust_toolchain;

pub use manifest::{PluginCallInput, PluginCallOutput, PluginRef};

use async_trait::async_trait;
use gauntlet_core::Result;
use std::path::Path;
use std::process::{Output, Stdio};
use tokio::process::Command;

/// Trait for native plugins.
///
/// Failures are returned as errors whose kind identifies the job phase
/// (`Provisioning` for toolchains, `Checkout` for sources). Dropping the
/// returned future kills any process the plugin started.
#[async_trait]
pub trait Plugin: Send + Sync {
    /// Get the plugin name.
    fn name(&self) -> &str;
    /// Execute the plugin.
    async fn execute(&self, input: &PluginCallInput) -> Result<PluginCallOutput>;
}

/// Run `program` in `dir` with the step's environment and capture its
/// output. The child is killed if the future is dropped.
pub(crate) async fn capture(
    program: &Path,
    args: &[&str],
    dir: &Path,
    input: &PluginCallInput,
) -> std::io::Result<Output> {
    Command::new(program)
        .args(args)
        .current_dir(dir)
        .envs(&input.env)
        .stdin(Stdio::null())
        .kill_on_drop(true)
        .output()
        .await
}

/// Get a built-in plugin for a `uses:` reference. The version is ignored.
pub fn get_builtin_plugin(uses: &str) -> Option<Box<dyn Plugin>> {
    match PluginRef::parse(uses).name.as_str() {
        "actions-rs/toolchain" | "dtolnay/rust-toolchain" | "gauntlet/toolchain" => {
            Some(Box::new(rust_toolchain::RustToolchainPlugin::new()))
        }
        "actions/checkout" | "gauntlet/checkout" => Some(Box::new(git::GitCheckoutPlugin::new())),
        _ => None,
    }
}

/// Whether a `uses:` reference names the dependency cache action.
pub fn is_cache_action(uses: &str) -> bool {
    matches!(
        PluginRef::parse(uses).name.as_str(),
        "actions/cache" | "gauntlet/cache"
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builtin_lookup() {
        assert_eq!(
            get_builtin_plugin("actions-rs/toolchain@v1").unwrap().name(),
            "rust-toolchain"
        );
        assert_eq!(
            get_builtin_plugin("actions/checkout@v2").unwrap().name(),
            "git-checkout"
        );
        assert!(get_builtin_plugin("actions/cache@v2").is_none());
        assert!(get_builtin_plugin("someone/unknown@v1").is_none());
    }

    #[test]
    fn test_cache_action() {
        assert!(is_cache_action("actions/cache@v2"));
        assert!(is_cache_action("gauntlet/cache"));
        assert!(!is_cache_action("actions/checkout@v2"));
    }
}
