// infrahub-backup/src/integrity/mod.rs
//! SHA-256 checksums over backup content and the metadata record that carries them.

pub mod metadata;

use anyhow::{Context, Result};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fs::File;
use std::io;
use std::path::{Component, Path};
use walkdir::WalkDir;

use crate::errors::OpsError;

pub use metadata::BackupMetadata;

/// Directory under the backup root holding the graph database files.
pub const DATABASE_DIR: &str = "database";
/// Workflow database dump, relative to the backup root.
pub const TASK_MANAGER_DUMP: &str = "prefect.dump";
/// Component marker recorded when the workflow dump is part of a backup.
pub const TASK_MANAGER_COMPONENT: &str = "task-manager-db";

/// Lowercase hex SHA-256 of a file, streamed.
pub fn compute_digest(path: &Path) -> Result<String> {
    let mut file =
        File::open(path).with_context(|| format!("Failed to open {} for hashing", path.display()))?;
    let mut hasher = Sha256::new();
    io::copy(&mut file, &mut hasher)
        .with_context(|| format!("Failed to read {} for hashing", path.display()))?;
    Ok(hex::encode(hasher.finalize()))
}

/// Relative path with `/` separators, as recorded in metadata.
fn checksum_key(root: &Path, path: &Path) -> Result<String> {
    let relative = path
        .strip_prefix(root)
        .with_context(|| format!("{} is outside {}", path.display(), root.display()))?;
    Ok(relative
        .components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/"))
}

/// Digests every regular file under `dir`, keyed relative to `root`.
///
/// Any read error aborts; a partial map is never returned.
pub fn checksum_tree(root: &Path, dir: &Path) -> Result<BTreeMap<String, String>> {
    let mut checksums = BTreeMap::new();
    for entry in WalkDir::new(dir).sort_by_file_name() {
        let entry = entry.with_context(|| format!("Failed to walk {}", dir.display()))?;
        if !entry.file_type().is_file() {
            continue;
        }
        let key = checksum_key(root, entry.path())?;
        checksums.insert(key, compute_digest(entry.path())?);
    }
    Ok(checksums)
}

/// Checksums for a staged backup root: all database files, plus the workflow dump when included.
pub fn compute_backup_checksums(
    backup_root: &Path,
    include_task_manager: bool,
) -> Result<BTreeMap<String, String>> {
    let mut checksums = checksum_tree(backup_root, &backup_root.join(DATABASE_DIR))?;
    if include_task_manager {
        let dump = backup_root.join(TASK_MANAGER_DUMP);
        if !dump.is_file() {
            return Err(OpsError::MissingBackupFile(TASK_MANAGER_DUMP.to_string()).into());
        }
        checksums.insert(TASK_MANAGER_DUMP.to_string(), compute_digest(&dump)?);
    }
    Ok(checksums)
}

/// Rejects a database checksum key that could resolve outside `<backup_root>/database`.
pub fn check_database_key(key: &str) -> Result<()> {
    let path = Path::new(key);
    let confined = path.starts_with(DATABASE_DIR)
        && path.components().count() > 1
        && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !confined {
        return Err(OpsError::UnexpectedChecksumKey(key.to_string()).into());
    }
    Ok(())
}

/// Recomputes one recorded checksum under `backup_root`.
pub fn verify_entry(backup_root: &Path, relative: &str, expected: &str) -> Result<()> {
    let path = backup_root.join(relative);
    if !path.is_file() {
        return Err(OpsError::MissingBackupFile(relative.to_string()).into());
    }
    let actual = compute_digest(&path)?;
    if !actual.eq_ignore_ascii_case(expected) {
        return Err(OpsError::ChecksumMismatch {
            path: relative.to_string(),
            expected: expected.to_string(),
            actual,
        }
        .into());
    }
    Ok(())
}
