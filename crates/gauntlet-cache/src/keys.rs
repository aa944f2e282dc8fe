//! Cache key derivation and entry selection.

use crate::types::CacheEntry;
use gauntlet_core::interpolation::InterpolationContext;
use gauntlet_core::{Error, Result};
use regex::Regex;
use sha2::{Digest, Sha256};
use std::path::{Path, PathBuf};
use std::sync::LazyLock;
use walkdir::WalkDir;

static HASH_FILES: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"\$\{\{\s*hashFiles\(([^)]*)\)\s*\}\}").expect("hashFiles pattern is valid")
});

/// Directories never searched by `**/` patterns.
const IGNORED_DIRS: &[&str] = &[".git", "target", "node_modules"];

/// Hash the contents of every file matching `patterns` under `workspace`.
///
/// Patterns are workspace-relative paths, optionally prefixed with `**/`
/// to match at any depth. The result is the hex SHA-256 over the per-file
/// digests, taken in sorted path order. Nothing matching is an error.
pub fn hash_files(workspace: &Path, patterns: &[&str]) -> Result<String> {
    let mut files: Vec<PathBuf> = Vec::new();
    for pattern in patterns {
        files.extend(match_pattern(workspace, pattern));
    }
    files.sort();
    files.dedup();

    if files.is_empty() {
        return Err(Error::Resolution(format!(
            "no files match {:?} in {}",
            patterns,
            workspace.display()
        )));
    }

    let mut hasher = Sha256::new();
    for path in &files {
        let contents = std::fs::read(path).map_err(|e| {
            Error::Resolution(format!("failed to read {}: {}", path.display(), e))
        })?;
        hasher.update(Sha256::digest(&contents));
    }

    Ok(hex::encode(hasher.finalize()))
}

fn match_pattern(workspace: &Path, pattern: &str) -> Vec<PathBuf> {
    let pattern = pattern.trim();
    let Some(suffix) = pattern.strip_prefix("**/") else {
        let path = workspace.join(pattern);
        return if path.is_file() { vec![path] } else { vec![] };
    };

    WalkDir::new(workspace)
        .into_iter()
        .filter_entry(|entry| {
            entry.depth() == 0
                || !entry.file_type().is_dir()
                || !IGNORED_DIRS.iter().any(|dir| entry.file_name() == *dir)
        })
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter(|entry| {
            entry
                .path()
                .strip_prefix(workspace)
                .map(|rel| rel.ends_with(suffix))
                .unwrap_or(false)
        })
        .map(|entry| entry.into_path())
        .collect()
}

/// Resolve a key template: `hashFiles(...)` calls first, then the
/// remaining `${{ ... }}` expressions.
pub fn resolve_key(template: &str, ctx: &InterpolationContext, workspace: &Path) -> Result<String> {
    let mut resolved = String::with_capacity(template.len());
    let mut last = 0;

    for caps in HASH_FILES.captures_iter(template) {
        let (Some(whole), Some(args)) = (caps.get(0), caps.get(1)) else {
            continue;
        };
        let patterns: Vec<&str> = args
            .as_str()
            .split(',')
            .map(|arg| arg.trim().trim_matches(|c| c == '\'' || c == '"'))
            .filter(|arg| !arg.is_empty())
            .collect();
        if patterns.is_empty() {
            return Err(Error::Resolution("hashFiles() needs at least one pattern".into()));
        }

        resolved.push_str(&template[last..whole.start()]);
        resolved.push_str(&hash_files(workspace, &patterns)?);
        last = whole.end();
    }
    resolved.push_str(&template[last..]);

    let key = ctx.interpolate(&resolved).trim().to_string();
    if key.is_empty() {
        return Err(Error::Resolution(format!(
            "cache key template '{}' resolved to an empty key",
            template
        )));
    }
    Ok(key)
}

/// How an entry was selected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MatchKind {
    Exact,
    Prefix,
}

/// Pick the entry to restore from an index.
///
/// An exact key match wins outright. Otherwise restore-key prefixes are
/// tried in order; the first prefix with any match yields its newest entry
/// (ties go to the lexicographically greatest key).
pub fn select_match<'a>(
    entries: &'a [CacheEntry],
    key: &str,
    restore_keys: &[String],
) -> Option<(&'a CacheEntry, MatchKind)> {
    if let Some(entry) = entries.iter().find(|e| e.key == key) {
        return Some((entry, MatchKind::Exact));
    }

    restore_keys.iter().find_map(|prefix| {
        entries
            .iter()
            .filter(|e| e.key.starts_with(prefix.as_str()))
            .max_by(|a, b| {
                a.created_at
                    .cmp(&b.created_at)
                    .then_with(|| a.key.cmp(&b.key))
            })
            .map(|entry| (entry, MatchKind::Prefix))
    })
}

/// Sanitize a key for use in filenames.
pub fn sanitize_key(key: &str) -> String {
    key.chars()
        .map(|c| match c {
            '/' | '\\' | ':' | '*' | '?' | '"' | '<' | '>' | '|' => '_',
            _ => c,
        })
        .collect()
}

/// File stem an entry is stored under: the sanitized key plus a short
/// digest of the original key, so keys that sanitize alike stay apart.
pub fn storage_name(key: &str) -> String {
    let digest = hex::encode(Sha256::digest(key.as_bytes()));
    format!("{}-{}", sanitize_key(key), &digest[..12])
}
