//! Error types for Gauntlet CI.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    // Pipeline errors
    #[error("Invalid pipeline definition: {0}")]
    InvalidPipeline(String),

    // Environment errors
    #[error("Provisioning failed: {0}")]
    Provisioning(String),

    #[error("Checkout failed: {0}")]
    Checkout(String),

    // Cache errors
    #[error("Cache key resolution failed: {0}")]
    Resolution(String),

    #[error("Cache save failed for key {key}: {message}")]
    CacheSave { key: String, message: String },

    // Step errors
    #[error("Step failed with exit code {exit_code}: {message}")]
    StepFailed { exit_code: i32, message: String },

    #[error("Step timed out after {timeout_secs}s")]
    StepTimeout { timeout_secs: u64 },

    // Job errors
    #[error("Job cancelled")]
    Cancelled,

    #[error("Invalid job status transition from {from} to {to}")]
    InvalidTransition { from: String, to: String },

    // Infrastructure errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// Short classification used in run reports.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::Provisioning(_) => ErrorKind::Provisioning,
            Error::Checkout(_) => ErrorKind::Checkout,
            Error::Resolution(_) => ErrorKind::Resolution,
            Error::CacheSave { .. } => ErrorKind::CacheSave,
            Error::StepFailed { .. } | Error::StepTimeout { .. } => ErrorKind::StepFailure,
            Error::Cancelled => ErrorKind::Cancelled,
            _ => ErrorKind::Internal,
        }
    }
}

/// Failure taxonomy reported on a job run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    Provisioning,
    Checkout,
    Resolution,
    StepFailure,
    CacheSave,
    Cancelled,
    Internal,
}

pub type Result<T> = std::result::Result<T, Error>;

impl From<serde_json::Error> for Error {
    fn from(err: serde_json::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}

impl From<serde_yaml::Error> for Error {
    fn from(err: serde_yaml::Error) -> Self {
        Error::Serialization(err.to_string())
    }
}
