//! Execution environment management.

use gauntlet_core::{Error, Result};
use std::path::{Path, PathBuf};
use tracing::{info, warn};

/// Trait for execution environments.
#[async_trait::async_trait]
pub trait Environment: Send + Sync {
    /// Prepare the execution environment. Failures are `Provisioning`
    /// errors.
    async fn prepare(&self) -> Result<()>;

    /// Get the working directory.
    fn working_dir(&self) -> &Path;

    /// Home directory private to this job run; `~` in cache paths and
    /// `HOME`/`CARGO_HOME` for its steps point here.
    fn home_dir(&self) -> &Path;

    /// Cleanup the execution environment.
    async fn cleanup(&self) -> Result<()>;
}

/// Host environment: a fresh directory on the local machine holding the
/// job's `workspace/` and `home/`.
pub struct HostEnvironment {
    root: PathBuf,
    workspace: PathBuf,
    home: PathBuf,
    keep: bool,
}

impl HostEnvironment {
    pub fn new(root: PathBuf) -> Self {
        Self {
            workspace: root.join("workspace"),
            home: root.join("home"),
            root,
            keep: false,
        }
    }

    /// Leave the directory on disk after the job.
    pub fn keep_workspace(mut self, keep: bool) -> Self {
        self.keep = keep;
        self
    }
}

async fn create_dir(path: &Path) -> Result<()> {
    tokio::fs::create_dir_all(path)
        .await
        .map_err(|e| Error::Provisioning(format!("Failed to create {}: {}", path.display(), e)))
}

#[async_trait::async_trait]
impl Environment for HostEnvironment {
    async fn prepare(&self) -> Result<()> {
        info!(root = %self.root.display(), "Preparing host environment");
        if tokio::fs::try_exists(&self.root).await.unwrap_or(false) {
            tokio::fs::remove_dir_all(&self.root).await.map_err(|e| {
                Error::Provisioning(format!(
                    "Failed to clear {}: {}",
                    self.root.display(),
                    e
                ))
            })?;
        }
        create_dir(&self.workspace).await?;
        create_dir(&self.home).await?;
        Ok(())
    }

    fn working_dir(&self) -> &Path {
        &self.workspace
    }

    fn home_dir(&self) -> &Path {
        &self.home
    }

    async fn cleanup(&self) -> Result<()> {
        if self.keep {
            return Ok(());
        }
        info!(root = %self.root.display(), "Cleaning up host environment");
        match tokio::fs::remove_dir_all(&self.root).await {
            Ok(()) => Ok(()),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            Err(e) => {
                warn!(root = %self.root.display(), error = %e, "Environment cleanup failed");
                Err(e.into())
            }
        }
    }
}
