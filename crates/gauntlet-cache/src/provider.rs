//! Cache storage provider trait and implementations.

use crate::archiver::{create_archive, extract_archive};
use crate::keys::{MatchKind, sanitize_key, select_match, storage_name};
use crate::types::{CacheEntry, CacheRestoreRequest, CacheSaveRequest, RestoreResult, SaveResult};
use async_trait::async_trait;
use chrono::Utc;
use gauntlet_core::run::CacheLookup;
use gauntlet_core::{Error, Result};
use sha2::{Digest, Sha256};
use std::io::{BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Instant;
use tracing::{debug, info, warn};

/// Trait for cache storage backends.
#[async_trait]
pub trait CacheProvider: Send + Sync {
    /// Restore the best matching entry onto the request's paths.
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult>;

    /// Archive the request's paths under its key, replacing any entry
    /// already stored there.
    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult>;

    /// Check if a key exists.
    async fn exists(&self, key: &str, scope: Option<&str>) -> Result<bool>;

    /// Delete a cache entry. Deleting a missing key is not an error.
    async fn delete(&self, key: &str, scope: Option<&str>) -> Result<()>;

    /// List entries whose key starts with `prefix`, newest first.
    async fn list(&self, prefix: &str, scope: Option<&str>) -> Result<Vec<CacheEntry>>;
}

const DEFAULT_SCOPE: &str = "default";

/// Filesystem-backed cache store.
///
/// Layout: `<root>/<scope>/<storage name>.tar.zst` plus a `.json` sidecar
/// holding the [`CacheEntry`] with the original key. Archives are checked
/// against the sidecar's checksum before anything is extracted.
pub struct FilesystemProvider {
    root_dir: PathBuf,
}

impl FilesystemProvider {
    pub fn new(root_dir: impl Into<PathBuf>) -> Self {
        Self {
            root_dir: root_dir.into(),
        }
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    fn scope_dir(&self, scope: Option<&str>) -> PathBuf {
        self.root_dir.join(sanitize_key(scope.unwrap_or(DEFAULT_SCOPE)))
    }

    fn meta_path(&self, key: &str, scope: Option<&str>) -> PathBuf {
        self.scope_dir(scope).join(format!("{}.json", storage_name(key)))
    }

    fn archive_path(&self, entry: &CacheEntry, scope: Option<&str>) -> PathBuf {
        self.scope_dir(scope).join(format!(
            "{}.{}",
            storage_name(&entry.key),
            entry.compression.extension()
        ))
    }
}

fn read_entries(dir: &Path) -> Result<Vec<CacheEntry>> {
    let read_dir = match std::fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e.into()),
    };

    let mut entries = Vec::new();
    for item in read_dir {
        let path = item?.path();
        if path.extension().and_then(|e| e.to_str()) != Some("json") {
            continue;
        }
        let raw = std::fs::read(&path)?;
        match serde_json::from_slice::<CacheEntry>(&raw) {
            Ok(entry) => entries.push(entry),
            Err(e) => warn!(path = %path.display(), error = %e, "Ignoring unreadable cache metadata"),
        }
    }
    Ok(entries)
}

fn checksum_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = Sha256::new();
    std::io::copy(&mut file, &mut hasher)?;
    Ok(hex::encode(hasher.finalize()))
}

async fn blocking<T, F>(f: F) -> Result<T>
where
    T: Send + 'static,
    F: FnOnce() -> Result<T> + Send + 'static,
{
    tokio::task::spawn_blocking(f)
        .await
        .map_err(|e| Error::Internal(format!("Cache task panicked: {}", e)))?
}

#[async_trait]
impl CacheProvider for FilesystemProvider {
    async fn restore(&self, request: &CacheRestoreRequest) -> Result<RestoreResult> {
        let start = Instant::now();
        let scope = request.scope.as_deref();

        let entries = self.list("", scope).await?;
        let Some((entry, kind)) = select_match(&entries, &request.key, &request.restore_keys)
        else {
            debug!(key = %request.key, "Cache miss");
            return Ok(RestoreResult::miss(start.elapsed().as_millis() as u64));
        };
        let entry = entry.clone();

        let archive = self.archive_path(&entry, scope);
        let targets = request.resolved_paths();
        let compression = entry.compression;
        let expected = entry.checksum.clone();
        blocking(move || {
            let actual = checksum_file(&archive).map_err(|e| {
                Error::Internal(format!("Failed to read {}: {}", archive.display(), e))
            })?;
            if actual != expected {
                return Err(Error::Internal(format!(
                    "Checksum mismatch for {}: expected {}, found {}",
                    archive.display(),
                    expected,
                    actual
                )));
            }
            let file = std::fs::File::open(&archive).map_err(|e| {
                Error::Internal(format!("Failed to open {}: {}", archive.display(), e))
            })?;
            extract_archive(BufReader::new(file), &targets, compression)
        })
        .await?;

        let lookup = match kind {
            MatchKind::Exact => CacheLookup::Hit(entry.key.clone()),
            MatchKind::Prefix => CacheLookup::PartialHit(entry.key.clone()),
        };
        info!(key = %request.key, matched = %entry.key, exact = kind == MatchKind::Exact, "Cache restored");

        Ok(RestoreResult {
            lookup,
            entry: Some(entry),
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn save(&self, request: &CacheSaveRequest) -> Result<SaveResult> {
        let start = Instant::now();
        let dir = self.scope_dir(request.scope.as_deref());
        let sources = request.resolved_paths();
        let mut entry = CacheEntry {
            key: request.key.clone(),
            created_at: Utc::now(),
            size_bytes: 0,
            checksum: String::new(),
            paths: request.paths.clone(),
            compression: request.compression,
        };
        let archive = self.archive_path(&entry, request.scope.as_deref());
        let meta = self.meta_path(&entry.key, request.scope.as_deref());

        let entry = blocking(move || {
            std::fs::create_dir_all(&dir)?;

            // Concurrent saves of one key are last-write-wins: each writer
            // renames a complete temp file into place.
            let tmp = tempfile::NamedTempFile::new_in(&dir)?;
            {
                let mut writer = BufWriter::new(tmp.as_file());
                create_archive(&mut writer, &sources, entry.compression)?;
                writer.flush()?;
            }
            tmp.persist(&archive)
                .map_err(|e| Error::CacheSave {
                    key: entry.key.clone(),
                    message: e.to_string(),
                })?;

            entry.size_bytes = std::fs::metadata(&archive)?.len();
            entry.checksum = checksum_file(&archive)?;

            let mut meta_tmp = tempfile::NamedTempFile::new_in(&dir)?;
            serde_json::to_writer_pretty(meta_tmp.as_file_mut(), &entry)?;
            meta_tmp.persist(&meta).map_err(|e| Error::CacheSave {
                key: entry.key.clone(),
                message: e.to_string(),
            })?;
            Ok(entry)
        })
        .await?;

        info!(key = %entry.key, size_bytes = entry.size_bytes, "Cache saved");
        Ok(SaveResult {
            entry,
            duration_ms: start.elapsed().as_millis() as u64,
        })
    }

    async fn exists(&self, key: &str, scope: Option<&str>) -> Result<bool> {
        Ok(tokio::fs::try_exists(self.meta_path(key, scope)).await?)
    }

    async fn delete(&self, key: &str, scope: Option<&str>) -> Result<()> {
        let meta = self.meta_path(key, scope);
        let raw = match tokio::fs::read(&meta).await {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(()),
            Err(e) => return Err(e.into()),
        };
        let entry: CacheEntry = serde_json::from_slice(&raw)?;
        let archive = self.archive_path(&entry, scope);
        match tokio::fs::remove_file(&archive).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(e.into()),
        }
        tokio::fs::remove_file(&meta).await?;
        debug!(key, "Cache entry deleted");
        Ok(())
    }

    async fn list(&self, prefix: &str, scope: Option<&str>) -> Result<Vec<CacheEntry>> {
        let dir = self.scope_dir(scope);
        let prefix = prefix.to_string();
        let mut entries = blocking(move || read_entries(&dir)).await?;
        entries.retain(|e| e.key.starts_with(&prefix));
        entries.sort_by(|a, b| b.created_at.cmp(&a.created_at).then_with(|| b.key.cmp(&a.key)));
        Ok(entries)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::CompressionType;

    struct Fixture {
        _root: tempfile::TempDir,
        provider: FilesystemProvider,
        work: tempfile::TempDir,
    }

    fn fixture() -> Fixture {
        let root = tempfile::tempdir().unwrap();
        let provider = FilesystemProvider::new(root.path().join("cache"));
        Fixture {
            _root: root,
            provider,
            work: tempfile::tempdir().unwrap(),
        }
    }

    fn save_request(work: &Path, key: &str) -> CacheSaveRequest {
        CacheSaveRequest {
            key: key.to_string(),
            paths: vec!["target".into()],
            scope: Some("ci".into()),
            base_dir: work.to_path_buf(),
            home_dir: None,
            compression: CompressionType::Zstd,
        }
    }

    fn restore_request(work: &Path, key: &str, restore_keys: &[&str]) -> CacheRestoreRequest {
        CacheRestoreRequest {
            key: key.to_string(),
            restore_keys: restore_keys.iter().map(|k| k.to_string()).collect(),
            paths: vec!["target".into()],
            scope: Some("ci".into()),
            base_dir: work.to_path_buf(),
            home_dir: None,
        }
    }

    #[tokio::test]
    async fn test_save_then_exact_restore() {
        let fx = fixture();
        let target = fx.work.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("libfoo.rlib"), "artifact").unwrap();

        let saved = fx
            .provider
            .save(&save_request(fx.work.path(), "linux-cargo-abc"))
            .await
            .unwrap();
        assert!(saved.entry.size_bytes > 0);
        assert_eq!(saved.entry.checksum.len(), 64);
        assert!(fx.provider.exists("linux-cargo-abc", Some("ci")).await.unwrap());

        std::fs::remove_dir_all(&target).unwrap();
        let restored = fx
            .provider
            .restore(&restore_request(fx.work.path(), "linux-cargo-abc", &[]))
            .await
            .unwrap();
        assert_eq!(restored.lookup, CacheLookup::Hit("linux-cargo-abc".into()));
        assert_eq!(
            std::fs::read_to_string(target.join("libfoo.rlib")).unwrap(),
            "artifact"
        );
    }

    #[tokio::test]
    async fn test_restore_key_gives_partial_hit() {
        let fx = fixture();
        std::fs::create_dir_all(fx.work.path().join("target")).unwrap();
        fx.provider
            .save(&save_request(fx.work.path(), "linux-cargo-old"))
            .await
            .unwrap();

        let restored = fx
            .provider
            .restore(&restore_request(fx.work.path(), "linux-cargo-new", &["linux-cargo-"]))
            .await
            .unwrap();
        assert_eq!(restored.lookup, CacheLookup::PartialHit("linux-cargo-old".into()));
    }

    #[tokio::test]
    async fn test_miss_without_entries() {
        let fx = fixture();
        let restored = fx
            .provider
            .restore(&restore_request(fx.work.path(), "linux-cargo-new", &["linux-cargo-"]))
            .await
            .unwrap();
        assert_eq!(restored.lookup, CacheLookup::Miss);
        assert!(restored.entry.is_none());
    }

    #[tokio::test]
    async fn test_scopes_are_isolated() {
        let fx = fixture();
        std::fs::create_dir_all(fx.work.path().join("target")).unwrap();
        fx.provider
            .save(&save_request(fx.work.path(), "k"))
            .await
            .unwrap();
        assert!(fx.provider.exists("k", Some("ci")).await.unwrap());
        assert!(!fx.provider.exists("k", Some("other")).await.unwrap());
        assert!(!fx.provider.exists("k", None).await.unwrap());
    }

    #[tokio::test]
    async fn test_list_and_delete() {
        let fx = fixture();
        std::fs::create_dir_all(fx.work.path().join("target")).unwrap();
        for key in ["linux-cargo-1", "linux-cargo-2", "macos-cargo-1"] {
            fx.provider
                .save(&save_request(fx.work.path(), key))
                .await
                .unwrap();
        }

        let linux = fx.provider.list("linux-", Some("ci")).await.unwrap();
        assert_eq!(linux.len(), 2);
        assert!(linux[0].created_at >= linux[1].created_at);

        fx.provider.delete("linux-cargo-1", Some("ci")).await.unwrap();
        fx.provider.delete("linux-cargo-1", Some("ci")).await.unwrap();
        assert_eq!(fx.provider.list("", Some("ci")).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_corrupted_archive_is_not_extracted() {
        let fx = fixture();
        let target = fx.work.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("libfoo.rlib"), "artifact").unwrap();
        fx.provider
            .save(&save_request(fx.work.path(), "linux-cargo-abc"))
            .await
            .unwrap();

        let archive = fx
            .provider
            .root_dir()
            .join("ci")
            .join(format!("{}.tar.zst", storage_name("linux-cargo-abc")));
        let mut bytes = std::fs::read(&archive).unwrap();
        bytes.extend_from_slice(b"tampered");
        std::fs::write(&archive, bytes).unwrap();

        std::fs::write(target.join("in-progress"), "keep").unwrap();
        let err = fx
            .provider
            .restore(&restore_request(fx.work.path(), "linux-cargo-abc", &[]))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("Checksum mismatch"));
        assert!(target.join("in-progress").exists());
    }

    #[tokio::test]
    async fn test_keys_that_sanitize_alike_do_not_collide() {
        let fx = fixture();
        let target = fx.work.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("v"), "slash").unwrap();
        fx.provider.save(&save_request(fx.work.path(), "a/b")).await.unwrap();
        std::fs::write(target.join("v"), "underscore").unwrap();
        fx.provider.save(&save_request(fx.work.path(), "a_b")).await.unwrap();

        assert_eq!(fx.provider.list("a", Some("ci")).await.unwrap().len(), 2);
        fx.provider
            .restore(&restore_request(fx.work.path(), "a/b", &[]))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(target.join("v")).unwrap(), "slash");
    }

    #[tokio::test]
    async fn test_resave_replaces_entry() {
        let fx = fixture();
        let target = fx.work.path().join("target");
        std::fs::create_dir_all(&target).unwrap();
        std::fs::write(target.join("v"), "1").unwrap();
        fx.provider.save(&save_request(fx.work.path(), "k")).await.unwrap();
        std::fs::write(target.join("v"), "2").unwrap();
        fx.provider.save(&save_request(fx.work.path(), "k")).await.unwrap();

        assert_eq!(fx.provider.list("k", Some("ci")).await.unwrap().len(), 1);
        std::fs::remove_dir_all(&target).unwrap();
        fx.provider
            .restore(&restore_request(fx.work.path(), "k", &[]))
            .await
            .unwrap();
        assert_eq!(std::fs::read_to_string(target.join("v")).unwrap(), "2");
    }
}
