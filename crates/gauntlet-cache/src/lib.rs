//! Dependency cache for Gauntlet CI.
//!
//! Keys are derived from lockfile contents, entries are tar archives kept
//! by a [`CacheProvider`], and [`CacheManager`] applies the restore/save
//! policy a job follows.

pub mod archiver;
pub mod keys;
pub mod manager;
pub mod provider;
pub mod types;

pub use keys::{MatchKind, hash_files, resolve_key, sanitize_key, select_match, storage_name};
pub use manager::{CacheManager, SaveDecision};
pub use provider::{CacheProvider, FilesystemProvider};
pub use types::{
    CacheEntry, CacheRestoreRequest, CacheSaveRequest, CompressionType, RestoreResult, SaveResult,
};
