//! Restore/save policy on top of a [`CacheProvider`].

use crate::provider::CacheProvider;
use crate::types::{CacheRestoreRequest, CacheSaveRequest, RestoreResult};
use gauntlet_core::run::{CacheLookup, CacheSaveStatus, JobStatus};
use std::sync::Arc;
use tracing::{info, warn};

/// Whether a post-job save should go ahead.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SaveDecision {
    Save,
    Skip(&'static str),
}

/// Applies the cache policy for jobs: restore failures degrade to a miss,
/// saves only happen after a successful job that did not get an exact hit.
#[derive(Clone)]
pub struct CacheManager {
    provider: Arc<dyn CacheProvider>,
    scope: Option<String>,
}

impl CacheManager {
    pub fn new(provider: Arc<dyn CacheProvider>, scope: Option<String>) -> Self {
        Self { provider, scope }
    }

    pub fn scope(&self) -> Option<&str> {
        self.scope.as_deref()
    }

    pub fn provider(&self) -> &Arc<dyn CacheProvider> {
        &self.provider
    }

    /// Restore for a cache step. Never fails the job.
    pub async fn restore(&self, mut request: CacheRestoreRequest) -> RestoreResult {
        if request.scope.is_none() {
            request.scope = self.scope.clone();
        }
        match self.provider.restore(&request).await {
            Ok(result) => result,
            Err(e) => {
                warn!(key = %request.key, error = %e, "Cache restore failed, treating as miss");
                RestoreResult::miss(0)
            }
        }
    }

    /// Decide whether the entry for `lookup` should be saved once the job
    /// reached `job_status`.
    pub fn should_save(lookup: &CacheLookup, job_status: JobStatus) -> SaveDecision {
        match job_status {
            JobStatus::Succeeded => {}
            JobStatus::Cancelled => return SaveDecision::Skip("job cancelled"),
            _ => return SaveDecision::Skip("job did not succeed"),
        }
        match lookup {
            CacheLookup::Hit(_) => SaveDecision::Skip("exact hit"),
            CacheLookup::Unresolved => SaveDecision::Skip("key unresolved"),
            CacheLookup::Miss | CacheLookup::PartialHit(_) => SaveDecision::Save,
        }
    }

    /// Save after the job has finished. Errors are reported in the status
    /// rather than returned.
    pub async fn save(
        &self,
        lookup: &CacheLookup,
        job_status: JobStatus,
        mut request: CacheSaveRequest,
    ) -> CacheSaveStatus {
        if let SaveDecision::Skip(reason) = Self::should_save(lookup, job_status) {
            info!(key = %request.key, reason, "Skipping cache save");
            return CacheSaveStatus::Skipped(reason.to_string());
        }
        if request.scope.is_none() {
            request.scope = self.scope.clone();
        }
        match self.provider.save(&request).await {
            Ok(_) => CacheSaveStatus::Saved,
            Err(e) => {
                warn!(key = %request.key, error = %e, "Cache save failed");
                CacheSaveStatus::Failed(e.to_string())
            }
        }
    }
}
