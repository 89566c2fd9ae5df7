// infrahub-backup/src/restore/verification.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use crate::errors::OpsError;
use crate::integrity::{BackupMetadata, TASK_MANAGER_DUMP, check_database_key, verify_entry};

/// What to do with the workflow database for one restore.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskManagerPlan {
    pub included: bool,
    pub dump_present: bool,
    pub excluded: bool,
}

impl TaskManagerPlan {
    pub fn restore(&self) -> bool {
        self.included && self.dump_present && !self.excluded
    }
}

/// Decides whether the workflow database is restored.
///
/// A backup that claims the workflow database but lacks its dump is rejected
/// unless the caller excluded it.
pub fn plan_task_manager_restore(
    backup_root: &Path,
    metadata: &BackupMetadata,
    exclude_task_manager: bool,
) -> Result<TaskManagerPlan> {
    let plan = TaskManagerPlan {
        included: metadata.includes_task_manager(),
        dump_present: backup_root.join(TASK_MANAGER_DUMP).is_file(),
        excluded: exclude_task_manager,
    };

    if plan.included && !plan.dump_present && !plan.excluded {
        return Err(OpsError::MissingBackupFile(TASK_MANAGER_DUMP.to_string()))
            .context("backup metadata includes the task manager database but its dump is missing");
    }

    if plan.included && plan.excluded {
        info!("Skipping task manager database restore as requested");
    } else if !plan.included {
        info!("Backup does not include task manager database; skipping restore");
    } else {
        info!("Task manager database dump detected; will restore");
    }
    Ok(plan)
}

/// Verifies every recorded checksum except the workflow dump's.
///
/// All keys are checked to name files under `database/` before any file is read.
pub fn verify_database_checksums(backup_root: &Path, metadata: &BackupMetadata) -> Result<usize> {
    for relative in metadata.checksums.keys() {
        if relative != TASK_MANAGER_DUMP {
            check_database_key(relative)?;
        }
    }

    let mut verified = 0;
    for (relative, expected) in &metadata.checksums {
        if relative == TASK_MANAGER_DUMP {
            continue;
        }
        verify_entry(backup_root, relative, expected)?;
        verified += 1;
    }
    info!("Verified {} database file checksum(s)", verified);
    Ok(verified)
}

pub fn verify_task_manager_checksum(backup_root: &Path, metadata: &BackupMetadata) -> Result<()> {
    let expected = metadata
        .checksums
        .get(TASK_MANAGER_DUMP)
        .with_context(|| format!("missing checksum for {} in metadata", TASK_MANAGER_DUMP))?;
    verify_entry(backup_root, TASK_MANAGER_DUMP, expected)?;
    info!("Verified task manager database checksum");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::errors::find_ops_error;
    use crate::integrity::{TASK_MANAGER_COMPONENT, compute_backup_checksums, compute_digest};
    use std::fs;
    use tempfile::{TempDir, tempdir};

    fn staged(with_dump: bool) -> Result<(TempDir, BackupMetadata)> {
        let dir = tempdir()?;
        fs::create_dir_all(dir.path().join("database"))?;
        fs::write(dir.path().join("database/neo4j.dump"), b"graph")?;
        if with_dump {
            fs::write(dir.path().join(TASK_MANAGER_DUMP), b"prefect")?;
        }
        let metadata = BackupMetadata {
            backup_id: "b".into(),
            created_at: String::new(),
            tool_version: String::new(),
            infrahub_version: String::new(),
            neo4j_edition: "community".into(),
            components: vec![TASK_MANAGER_COMPONENT.into()],
            checksums: compute_backup_checksums(dir.path(), with_dump)?,
        };
        Ok((dir, metadata))
    }

    #[test]
    fn plan_matrix() -> Result<()> {
        let (dir, metadata) = staged(true)?;
        assert!(plan_task_manager_restore(dir.path(), &metadata, false)?.restore());
        assert!(!plan_task_manager_restore(dir.path(), &metadata, true)?.restore());

        let mut without = metadata.clone();
        without.components.clear();
        without.checksums.remove(TASK_MANAGER_DUMP);
        assert!(!plan_task_manager_restore(dir.path(), &without, false)?.restore());
        Ok(())
    }

    #[test]
    fn claimed_but_missing_dump_is_rejected_unless_excluded() -> Result<()> {
        let (dir, metadata) = staged(false)?;
        let err = plan_task_manager_restore(dir.path(), &metadata, false).unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::MissingBackupFile(_))));
        assert!(!plan_task_manager_restore(dir.path(), &metadata, true)?.restore());
        Ok(())
    }

    #[test]
    fn database_checksums_skip_the_workflow_dump() -> Result<()> {
        let (dir, metadata) = staged(true)?;
        fs::write(dir.path().join(TASK_MANAGER_DUMP), b"corrupt")?;
        assert_eq!(verify_database_checksums(dir.path(), &metadata)?, 1);

        let err = verify_task_manager_checksum(dir.path(), &metadata).unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::ChecksumMismatch { .. })));
        Ok(())
    }

    #[test]
    fn keys_outside_the_database_dir_are_rejected() -> Result<()> {
        let (dir, metadata) = staged(true)?;
        let host = tempdir()?;
        let host_file = host.path().join("host_file");
        fs::write(&host_file, b"not part of the backup")?;
        fs::write(dir.path().join("stray.txt"), b"stray")?;

        let mut absolute = metadata.clone();
        let key = host_file.display().to_string();
        absolute.checksums.insert(key.clone(), compute_digest(&host_file)?);
        let err = verify_database_checksums(dir.path(), &absolute).unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::UnexpectedChecksumKey(k)) if *k == key));

        let mut stray = metadata.clone();
        stray
            .checksums
            .insert("stray.txt".into(), compute_digest(&dir.path().join("stray.txt"))?);
        let err = verify_database_checksums(dir.path(), &stray).unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::UnexpectedChecksumKey(k)) if k == "stray.txt"));

        let mut escaping = metadata;
        escaping
            .checksums
            .insert("database/../stray.txt".into(), compute_digest(&dir.path().join("stray.txt"))?);
        assert!(verify_database_checksums(dir.path(), &escaping).is_err());
        Ok(())
    }

    #[test]
    fn workflow_checksum_must_be_recorded() -> Result<()> {
        let (dir, mut metadata) = staged(true)?;
        metadata.checksums.remove(TASK_MANAGER_DUMP);
        let err = verify_task_manager_checksum(dir.path(), &metadata).unwrap_err();
        assert!(err.to_string().contains("missing checksum"));
        Ok(())
    }
}
