use crate::{Plugin, PluginCallInput, PluginCallOutput, capture};
use async_trait::async_trait;
use gauntlet_core::{Error, Result};
use regex::Regex;
use std::path::PathBuf;
use std::sync::LazyLock;
use tracing::info;

static CHANNEL: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(
        r"^(stable|beta|nightly|\d+\.\d+(\.\d+)?)(-\d{4}-\d{2}-\d{2})?(-[A-Za-z0-9_]+(-[A-Za-z0-9_.]+)*)?$",
    )
    .expect("channel pattern is valid")
});

/// Check that `toolchain` names something rustup can install.
pub fn validate_toolchain(toolchain: &str) -> Result<()> {
    if CHANNEL.is_match(toolchain) {
        Ok(())
    } else {
        Err(Error::Provisioning(format!(
            "'{}' is not a valid toolchain",
            toolchain
        )))
    }
}

/// Split a component or target list written with commas or spaces.
fn split_list(value: Option<&str>) -> Vec<&str> {
    value
        .unwrap_or("")
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|item| !item.is_empty())
        .collect()
}

/// Installs a Rust toolchain with rustup and optionally pins it to the job
/// workspace.
pub struct RustToolchainPlugin {
    rustup: PathBuf,
}

impl Default for RustToolchainPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl RustToolchainPlugin {
    pub fn new() -> Self {
        Self {
            rustup: PathBuf::from("rustup"),
        }
    }

    /// Use a specific rustup binary.
    pub fn with_rustup(rustup: impl Into<PathBuf>) -> Self {
        Self {
            rustup: rustup.into(),
        }
    }

    async fn rustup(&self, input: &PluginCallInput, args: &[&str]) -> Result<String> {
        let output = capture(&self.rustup, args, &input.workspace, input)
            .await
            .map_err(|e| {
                Error::Provisioning(format!(
                    "failed to run {}: {}",
                    self.rustup.display(),
                    e
                ))
            })?;

        if !output.status.success() {
            return Err(Error::Provisioning(format!(
                "rustup {} failed: {}",
                args.join(" "),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Plugin for RustToolchainPlugin {
    fn name(&self) -> &str {
        "rust-toolchain"
    }

    async fn execute(&self, input: &PluginCallInput) -> Result<PluginCallOutput> {
        let toolchain = input.param("toolchain").unwrap_or("stable");
        validate_toolchain(toolchain)?;
        let profile = input.param("profile").unwrap_or("default");

        info!(toolchain, profile, "Installing Rust toolchain");

        let mut args = vec!["toolchain", "install", toolchain, "--profile", profile];
        for component in split_list(input.param("components")) {
            args.extend(["--component", component]);
        }
        for target in split_list(input.param("target").or(input.param("targets"))) {
            args.extend(["--target", target]);
        }

        let mut output = PluginCallOutput::success().with_output("toolchain", toolchain);
        let installed = self.rustup(input, &args).await?;
        if !installed.is_empty() {
            output.log(installed);
        }

        if input.flag("override") {
            self.rustup(input, &["override", "set", toolchain]).await?;
            output.log(format!("override set to {}", toolchain));
        }
        if input.flag("default") {
            self.rustup(input, &["default", toolchain]).await?;
            output.log(format!("default set to {}", toolchain));
        }

        let version = self
            .rustup(input, &["run", toolchain, "rustc", "--version"])
            .await?;
        info!(version = %version, "Toolchain ready");
        output.log(version.clone());
        Ok(output.with_output("rustc", version))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use gauntlet_core::ErrorKind;

    #[test]
    fn test_validate_toolchain() {
        for ok in [
            "stable",
            "beta",
            "nightly",
            "nightly-2024-03-01",
            "1.75",
            "1.75.0",
            "stable-x86_64-unknown-linux-gnu",
        ] {
            assert!(validate_toolchain(ok).is_ok(), "{ok} should be valid");
        }
        for bad in ["", "stabel; rm -rf /", "latest", "1"] {
            assert!(validate_toolchain(bad).is_err(), "{bad} should be invalid");
        }
    }

    #[test]
    fn test_split_list() {
        assert_eq!(split_list(Some("rustfmt, clippy")), vec!["rustfmt", "clippy"]);
        assert_eq!(split_list(Some("rustfmt clippy")), vec!["rustfmt", "clippy"]);
        assert!(split_list(None).is_empty());
    }

    #[tokio::test]
    async fn test_invalid_toolchain_is_provisioning_failure() {
        let mut input = PluginCallInput::default();
        input.params.insert("toolchain".into(), "not a toolchain".into());
        let err = RustToolchainPlugin::new().execute(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provisioning);
    }

    #[tokio::test]
    async fn test_missing_rustup_is_provisioning_failure() {
        let dir = tempfile::tempdir().unwrap();
        let mut input = PluginCallInput {
            workspace: dir.path().to_path_buf(),
            ..Default::default()
        };
        input.params.insert("toolchain".into(), "stable".into());
        let plugin = RustToolchainPlugin::with_rustup(dir.path().join("no-such-rustup"));
        let err = plugin.execute(&input).await.unwrap_err();
        assert_eq!(err.kind(), ErrorKind::Provisioning);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_rustup_gets_step_environment() {
        use std::os::unix::fs::PermissionsExt;
        let dir = tempfile::tempdir().unwrap();
        let rustup = dir.path().join("rustup");
        std::fs::write(&rustup, "#!/bin/sh\necho \"$CARGO_HOME $*\"\n").unwrap();
        std::fs::set_permissions(&rustup, std::fs::Permissions::from_mode(0o755)).unwrap();

        let mut input = PluginCallInput {
            workspace: dir.path().to_path_buf(),
            ..Default::default()
        };
        input.params.insert("toolchain".into(), "stable".into());
        input.env.insert("CARGO_HOME".into(), "/jobs/7/home/.cargo".into());

        let output = RustToolchainPlugin::with_rustup(rustup)
            .execute(&input)
            .await
            .unwrap();
        assert_eq!(output.outputs["rustc"], "/jobs/7/home/.cargo run stable rustc --version");
        assert!(output.logs[0].starts_with("/jobs/7/home/.cargo toolchain install stable"));
    }
}
