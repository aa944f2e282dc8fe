//! Tar archives of cached paths.
//!
//! Each source path is stored under its slot index (`0`, `1/...`), so an
//! archive can be unpacked onto a different set of absolute locations than
//! the one it was created from.

use crate::types::CompressionType;
use gauntlet_core::{Error, Result};
use std::collections::HashSet;
use std::io::{Read, Write};
use std::path::{Component, Path, PathBuf};
use tracing::debug;

/// Create an archive from paths. Missing sources are skipped.
pub fn create_archive<W: Write>(
    writer: W,
    sources: &[PathBuf],
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let mut encoder = zstd::stream::write::Encoder::new(writer, 3)
                .map_err(|e| Error::Internal(format!("Zstd init failed: {}", e)))?;
            append_sources(&mut encoder, sources)?;
            encoder
                .finish()
                .map_err(|e| Error::Internal(format!("Zstd finish failed: {}", e)))?;
        }
        CompressionType::None => {
            append_sources(writer, sources)?;
        }
    }
    Ok(())
}

fn append_sources<W: Write>(writer: W, sources: &[PathBuf]) -> Result<()> {
    let mut builder = tar::Builder::new(writer);
    builder.follow_symlinks(false);

    for (slot, source) in sources.iter().enumerate() {
        let name = slot.to_string();
        if source.is_dir() {
            builder
                .append_dir_all(&name, source)
                .map_err(|e| Error::Internal(format!("Failed to pack dir {}: {}", source.display(), e)))?;
        } else if source.is_file() {
            builder
                .append_path_with_name(source, &name)
                .map_err(|e| Error::Internal(format!("Failed to pack file {}: {}", source.display(), e)))?;
        } else {
            debug!(path = %source.display(), "Cache path does not exist, skipping");
        }
    }

    builder
        .into_inner()
        .map_err(|e| Error::Internal(format!("Failed to finish tar: {}", e)))?;
    Ok(())
}

/// Extract an archive onto `targets`, slot by slot.
///
/// Every target that has a slot in the archive is removed first, so the
/// restored content replaces local state rather than merging into it.
/// Targets without a slot are left untouched.
pub fn extract_archive<R: Read>(
    reader: R,
    targets: &[PathBuf],
    compression: CompressionType,
) -> Result<()> {
    match compression {
        CompressionType::Zstd => {
            let decoder = zstd::stream::read::Decoder::new(reader)
                .map_err(|e| Error::Internal(format!("Failed to create decoder: {}", e)))?;
            unpack_slots(decoder, targets)
        }
        CompressionType::None => unpack_slots(reader, targets),
    }
}

fn unpack_slots<R: Read>(reader: R, targets: &[PathBuf]) -> Result<()> {
    let mut archive = tar::Archive::new(reader);
    let mut cleared: HashSet<usize> = HashSet::new();

    let entries = archive
        .entries()
        .map_err(|e| Error::Internal(format!("Failed to read archive: {}", e)))?;

    for entry in entries {
        let mut entry =
            entry.map_err(|e| Error::Internal(format!("Corrupt archive entry: {}", e)))?;
        let entry_path = entry
            .path()
            .map_err(|e| Error::Internal(format!("Invalid entry path: {}", e)))?
            .into_owned();

        let (slot, rest) = split_slot(&entry_path)?;
        let target = targets.get(slot).ok_or_else(|| {
            Error::Internal(format!("Archive slot {} has no target path", slot))
        })?;

        if cleared.insert(slot) {
            remove_existing(target)?;
        }

        let dest = if rest.as_os_str().is_empty() {
            target.clone()
        } else {
            target.join(&rest)
        };
        if let Some(parent) = dest.parent() {
            std::fs::create_dir_all(parent)?;
        }
        entry
            .unpack(&dest)
            .map_err(|e| Error::Internal(format!("Failed to unpack {}: {}", dest.display(), e)))?;
    }

    Ok(())
}

fn split_slot(path: &Path) -> Result<(usize, PathBuf)> {
    let mut components = path.components();
    let slot = match components.next() {
        Some(Component::Normal(first)) => first
            .to_str()
            .and_then(|s| s.parse::<usize>().ok())
            .ok_or_else(|| Error::Internal(format!("Unexpected archive entry {}", path.display())))?,
        _ => {
            return Err(Error::Internal(format!(
                "Unexpected archive entry {}",
                path.display()
            )));
        }
    };

    let mut rest = PathBuf::new();
    for component in components {
        match component {
            Component::Normal(part) => rest.push(part),
            Component::CurDir => {}
            _ => {
                return Err(Error::Internal(format!(
                    "Refusing to unpack {} outside its target",
                    path.display()
                )));
            }
        }
    }
    Ok((slot, rest))
}

fn remove_existing(target: &Path) -> Result<()> {
    match std::fs::symlink_metadata(target) {
        Ok(meta) if meta.is_dir() => std::fs::remove_dir_all(target)?,
        Ok(_) => std::fs::remove_file(target)?,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(e) => return Err(e.into()),
    }
    Ok(())
}
