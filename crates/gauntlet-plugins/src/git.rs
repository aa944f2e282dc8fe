use crate::{Plugin, PluginCallInput, PluginCallOutput, capture};
use async_trait::async_trait;
use gauntlet_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Checks out the triggering revision into the job workspace.
///
/// The source is the `repository` parameter, falling back to the repository
/// configured for the run. The revision is `ref` from the parameters, then
/// the event sha, then the event ref; with none of those the default branch
/// is left checked out.
pub struct GitCheckoutPlugin {
    git: PathBuf,
}

impl Default for GitCheckoutPlugin {
    fn default() -> Self {
        Self::new()
    }
}

impl GitCheckoutPlugin {
    pub fn new() -> Self {
        Self {
            git: PathBuf::from("git"),
        }
    }

    pub fn with_git(git: impl Into<PathBuf>) -> Self {
        Self { git: git.into() }
    }

    async fn git(&self, input: &PluginCallInput, dir: &Path, args: &[&str]) -> Result<String> {
        debug!(?args, dir = %dir.display(), "git");
        let output = capture(&self.git, args, dir, input)
            .await
            .map_err(|e| Error::Checkout(format!("failed to run git: {}", e)))?;

        if !output.status.success() {
            return Err(Error::Checkout(format!(
                "git {} failed: {}",
                args.first().copied().unwrap_or_default(),
                String::from_utf8_lossy(&output.stderr).trim()
            )));
        }
        Ok(String::from_utf8_lossy(&output.stdout).trim().to_string())
    }
}

#[async_trait]
impl Plugin for GitCheckoutPlugin {
    fn name(&self) -> &str {
        "git-checkout"
    }

    async fn execute(&self, input: &PluginCallInput) -> Result<PluginCallOutput> {
        let repository = input
            .param("repository")
            .or(input.repository.as_deref())
            .ok_or_else(|| Error::Checkout("no repository configured for checkout".into()))?;

        let dest = match input.param("path") {
            Some(path) => input.workspace.join(path),
            None => input.workspace.clone(),
        };
        tokio::fs::create_dir_all(&dest)
            .await
            .map_err(|e| Error::Checkout(format!("cannot create {}: {}", dest.display(), e)))?;

        info!(repository, dest = %dest.display(), "Cloning sources");
        let dest_arg = dest.to_string_lossy();
        self.git(input, &input.workspace, &["clone", "--quiet", repository, dest_arg.as_ref()])
            .await?;

        let explicit_ref = input.param("ref");
        let sha = input.event.get("sha").map(String::as_str);
        let event_ref = input.event.get("ref").map(String::as_str);

        match (explicit_ref, sha, event_ref) {
            (Some(rev), _, _) | (None, Some(rev), _) => {
                if self
                    .git(input, &dest, &["checkout", "--quiet", "--detach", rev])
                    .await
                    .is_err()
                {
                    // Not a local object yet; fetch it by name.
                    self.git(input, &dest, &["fetch", "--quiet", "origin", rev]).await?;
                    self.git(input, &dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
                        .await?;
                }
            }
            (None, None, Some(git_ref)) => {
                self.git(input, &dest, &["fetch", "--quiet", "origin", git_ref]).await?;
                self.git(input, &dest, &["checkout", "--quiet", "--detach", "FETCH_HEAD"])
                    .await?;
            }
            (None, None, None) => {}
        }

        let head = self.git(input, &dest, &["rev-parse", "HEAD"]).await?;
        info!(head = %head, "Checked out");
        let mut output = PluginCallOutput::success().with_output("sha", head.clone());
        output.log(format!("HEAD is now at {}", head));
        Ok(output)
    }
}
