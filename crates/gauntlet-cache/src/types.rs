//! Cache types and requests.

use chrono::{DateTime, Utc};
use gauntlet_core::run::CacheLookup;
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Request to restore a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheRestoreRequest {
    /// Primary cache key.
    pub key: String,
    /// Prefixes to try, in order, if the primary key misses.
    #[serde(default)]
    pub restore_keys: Vec<String>,
    /// Paths as written in the workflow (`~/.cargo/registry`, `target`).
    pub paths: Vec<String>,
    /// Namespace for cache isolation.
    pub scope: Option<String>,
    /// Directory relative paths are resolved against.
    pub base_dir: PathBuf,
    /// Directory `~` expands to.
    pub home_dir: Option<PathBuf>,
}

/// Request to save a cache entry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheSaveRequest {
    pub key: String,
    pub paths: Vec<String>,
    pub scope: Option<String>,
    pub base_dir: PathBuf,
    pub home_dir: Option<PathBuf>,
    #[serde(default)]
    pub compression: CompressionType,
}

impl CacheRestoreRequest {
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        resolve_paths(&self.paths, &self.base_dir, self.home_dir.as_deref())
    }
}

impl CacheSaveRequest {
    pub fn resolved_paths(&self) -> Vec<PathBuf> {
        resolve_paths(&self.paths, &self.base_dir, self.home_dir.as_deref())
    }
}

fn resolve_paths(paths: &[String], base_dir: &Path, home_dir: Option<&Path>) -> Vec<PathBuf> {
    paths
        .iter()
        .map(|p| resolve_path(p, base_dir, home_dir))
        .collect()
}

/// Expand `~` and anchor relative paths at `base_dir`.
pub fn resolve_path(path: &str, base_dir: &Path, home_dir: Option<&Path>) -> PathBuf {
    let home = home_dir.unwrap_or(base_dir);
    if path == "~" {
        return home.to_path_buf();
    }
    if let Some(rest) = path.strip_prefix("~/") {
        return home.join(rest);
    }
    let path = Path::new(path);
    if path.is_absolute() {
        path.to_path_buf()
    } else {
        base_dir.join(path)
    }
}

/// Compression algorithm.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum CompressionType {
    None,
    #[default]
    Zstd,
}

impl CompressionType {
    pub fn extension(&self) -> &'static str {
        match self {
            CompressionType::None => "tar",
            CompressionType::Zstd => "tar.zst",
        }
    }
}

/// A stored cache entry, persisted as JSON next to its archive.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheEntry {
    /// Original (unsanitized) key.
    pub key: String,
    pub created_at: DateTime<Utc>,
    pub size_bytes: u64,
    /// SHA-256 of the archive file.
    pub checksum: String,
    /// Path labels stored, by archive slot.
    pub paths: Vec<String>,
    pub compression: CompressionType,
}

/// Result of a cache restore operation.
#[derive(Debug, Clone)]
pub struct RestoreResult {
    pub lookup: CacheLookup,
    /// The entry that was restored, if any.
    pub entry: Option<CacheEntry>,
    pub duration_ms: u64,
}

impl RestoreResult {
    pub fn miss(duration_ms: u64) -> Self {
        Self {
            lookup: CacheLookup::Miss,
            entry: None,
            duration_ms,
        }
    }
}

/// Result of a cache save operation.
#[derive(Debug, Clone)]
pub struct SaveResult {
    pub entry: CacheEntry,
    pub duration_ms: u64,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_resolve_path() {
        let base = Path::new("/work/job");
        let home = Path::new("/home/ci");
        assert_eq!(
            resolve_path("~/.cargo/registry", base, Some(home)),
            PathBuf::from("/home/ci/.cargo/registry")
        );
        assert_eq!(resolve_path("target", base, Some(home)), PathBuf::from("/work/job/target"));
        assert_eq!(resolve_path("/opt/cache", base, Some(home)), PathBuf::from("/opt/cache"));
        assert_eq!(resolve_path("~", base, None), PathBuf::from("/work/job"));
    }
}
