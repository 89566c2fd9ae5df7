// infrahub-backup/src/restore/logic.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::info;

use super::verification::{plan_task_manager_restore, verify_database_checksums, verify_task_manager_checksum};
use super::{RestoreOptions, RestoreStep};
use crate::backend::{SERVER_SERVICE, TASK_WORKER_SERVICE};
use crate::backup::archive::extract_tar_gz_archive;
use crate::edition::{detect_for_restore, reconcile};
use crate::errors::OpsError;
use crate::integrity::BackupMetadata;
use crate::ops::{APP_SERVICES, BackupOrchestrator, run_step};

impl BackupOrchestrator<'_> {
    /// Replaces the deployment's data with the contents of `archive`.
    ///
    /// Everything up to and including checksum validation is read-only. After the
    /// application services are stopped a failure leaves them stopped, and the
    /// returned error says so.
    pub fn restore_backup(&self, archive: &Path, opts: &RestoreOptions) -> Result<()> {
        if !archive.is_file() {
            return Err(OpsError::MissingBackupFile(archive.display().to_string()).into());
        }

        let work_dir = tempfile::Builder::new()
            .prefix("infrahub_restore_")
            .tempdir()
            .context("Failed to create temp directory")?;
        let backup_root = work_dir.path().join("backup");

        info!("Restoring from backup: {}", archive.display());
        run_step(RestoreStep::ArchiveExtract, || {
            extract_tar_gz_archive(archive, work_dir.path()).map(|_| ())
        })?;

        let metadata = run_step(RestoreStep::MetadataValidate, || {
            let metadata = BackupMetadata::read_from(&backup_root)?;
            let rendered = String::from_utf8_lossy(&metadata.to_pretty_json()?).into_owned();
            info!("Backup metadata:\n{}", rendered);
            Ok(metadata)
        })?;

        let edition = run_step(RestoreStep::EditionReconcile, || {
            let live = detect_for_restore(self.backend, &self.config.neo4j);
            reconcile(metadata.edition(), &live)
        })?;

        let plan = run_step(RestoreStep::TaskManagerPresenceCheck, || {
            plan_task_manager_restore(&backup_root, &metadata, opts.exclude_task_manager)
        })?;

        run_step(RestoreStep::ChecksumValidate, || {
            verify_database_checksums(&backup_root, &metadata)?;
            if plan.restore() {
                verify_task_manager_checksum(&backup_root, &metadata)?;
            }
            Ok(())
        })?;

        run_step(RestoreStep::WipeTransientData, || {
            self.wipe_transient_data();
            Ok(())
        })?;

        // From here on the deployment is being modified.
        let mut stopped = Vec::new();
        let result = run_step(RestoreStep::StopApp, || self.stop_app_services(&mut stopped)).and_then(|()| {
            if plan.restore() {
                run_step(RestoreStep::WorkflowDbRestore, || self.restore_task_manager_db(&backup_root))?;
            } else {
                info!("Skipping task manager database restore step");
            }
            run_step(RestoreStep::RestartDependencies, || self.restart_dependencies())?;
            run_step(RestoreStep::DatabaseRestore, || {
                self.restore_neo4j(&backup_root, edition, opts.migrate_format)
            })?;
            info!("Restarting Infrahub services...");
            run_step(RestoreStep::RestartApp, || {
                self.start_services(&[SERVER_SERVICE, TASK_WORKER_SERVICE])
            })
        });

        result.with_context(|| {
            format!(
                "restore aborted; application services ({}) may be left stopped and need a manual start once the cause is fixed",
                APP_SERVICES.join(", ")
            )
        })?;

        info!("Restore completed successfully");
        info!("Infrahub should be available shortly");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::backend::{DATABASE_SERVICE, TASK_MANAGER_DB_SERVICE};
    use crate::backup::BackupOptions;
    use crate::backup::archive::create_tar_gz_archive;
    use crate::config::Configuration;
    use crate::errors::find_ops_error;
    use crate::integrity::{TASK_MANAGER_COMPONENT, TASK_MANAGER_DUMP, compute_backup_checksums};
    use crate::ops::test_support::{fast_config, orchestrator};
    use std::fs;
    use std::path::PathBuf;
    use tempfile::{TempDir, tempdir};

    /// Builds an archive the way a backup would, optionally corrupting it afterwards.
    fn archive_with(edition: &str, tamper: bool, drop_dump: bool) -> Result<(TempDir, PathBuf)> {
        let stage = tempdir()?;
        let root = stage.path().join("backup");
        fs::create_dir_all(root.join("database"))?;
        fs::write(root.join("database/neo4j.dump"), b"graph")?;
        fs::write(root.join(TASK_MANAGER_DUMP), b"prefect")?;
        let metadata = BackupMetadata {
            backup_id: "infrahub_backup_20240101_000000".into(),
            created_at: "2024-01-01T00:00:00Z".into(),
            tool_version: "0.1.0".into(),
            infrahub_version: "1.3.0".into(),
            neo4j_edition: edition.into(),
            components: vec![TASK_MANAGER_COMPONENT.into()],
            checksums: compute_backup_checksums(&root, true)?,
        };
        metadata.write_to(&root)?;
        if tamper {
            fs::write(root.join("database/neo4j.dump"), b"tampered")?;
        }
        if drop_dump {
            fs::remove_file(root.join(TASK_MANAGER_DUMP))?;
        }

        let out = tempdir()?;
        let archive = out.path().join("infrahub_backup_20240101_000000.tar.gz");
        create_tar_gz_archive(stage.path(), &archive)?;
        Ok((out, archive))
    }

    fn live(edition: &str) -> FakeBackend {
        FakeBackend::new()
            .on("dbms.components", &format!("edition\n{edition}"))
            .on("neo4j.pid", "5")
            .on("uname -m", "x86_64")
            .on("/proc/5/stat", "gone")
    }

    fn config() -> Configuration {
        fast_config()
    }

    #[test]
    fn community_restore_end_to_end() -> Result<()> {
        let (_dir, archive) = archive_with("community", false, false)?;
        let backend = live("community");
        let config = config();

        orchestrator(&config, &backend).restore_backup(&archive, &RestoreOptions::default())?;

        let order = [
            "cache: redis-cli FLUSHALL",
            "stop infrahub-server",
            "pg_restore",
            "database load",
            "start infrahub-server task-worker",
        ];
        let positions: Vec<usize> = order
            .iter()
            .map(|p| backend.position(p).unwrap_or_else(|| panic!("missing call {p}")))
            .collect();
        assert!(positions.windows(2).all(|w| w[0] < w[1]), "{positions:?}");

        // Dependencies come back between the workflow and graph restores.
        let dependencies = backend
            .calls()
            .iter()
            .position(|c| c == "start task-manager")
            .expect("task manager restart");
        assert!(positions[2] < dependencies && dependencies < positions[3]);
        assert_eq!(
            backend.remote(DATABASE_SERVICE, "/tmp/infrahubops/neo4j.dump").as_deref(),
            Some(&b"graph"[..])
        );
        assert_eq!(
            backend.remote(TASK_MANAGER_DB_SERVICE, "/tmp/infrahubops_prefect.dump").as_deref(),
            Some(&b"prefect"[..])
        );
        Ok(())
    }

    #[test]
    fn enterprise_backup_on_community_fails_before_any_change() -> Result<()> {
        let (_dir, archive) = archive_with("enterprise", false, false)?;
        let backend = live("community");
        let config = config();

        let err = orchestrator(&config, &backend)
            .restore_backup(&archive, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::IncompatibleEdition)));
        assert!(!backend.called("redis-cli"));
        assert!(!backend.called("stop "));
        Ok(())
    }

    #[test]
    fn community_backup_on_enterprise_uses_the_community_procedure() -> Result<()> {
        let (_dir, archive) = archive_with("community", false, false)?;
        let backend = live("enterprise");
        let config = config();

        orchestrator(&config, &backend).restore_backup(&archive, &RestoreOptions::default())?;
        assert!(backend.called("database load"));
        assert!(!backend.called("database restore"));
        Ok(())
    }

    #[test]
    fn checksum_mismatch_aborts_before_wipe() -> Result<()> {
        let (_dir, archive) = archive_with("community", true, false)?;
        let backend = live("community");
        let config = config();

        let err = orchestrator(&config, &backend)
            .restore_backup(&archive, &RestoreOptions::default())
            .unwrap_err();
        match find_ops_error(&err) {
            Some(OpsError::ChecksumMismatch { path, .. }) => assert_eq!(path, "database/neo4j.dump"),
            other => panic!("unexpected error: {other:?}"),
        }
        assert!(!backend.called("redis-cli"));
        assert!(!backend.called("stop "));
        Ok(())
    }

    #[test]
    fn missing_workflow_dump_can_be_excluded() -> Result<()> {
        let (_dir, archive) = archive_with("community", false, true)?;
        let config = config();

        let backend = live("community");
        let err = orchestrator(&config, &backend)
            .restore_backup(&archive, &RestoreOptions::default())
            .unwrap_err();
        assert!(format!("{err:#}").contains("TaskManagerPresenceCheck step failed"));

        let backend = live("community");
        let opts = RestoreOptions {
            exclude_task_manager: true,
            ..RestoreOptions::default()
        };
        orchestrator(&config, &backend).restore_backup(&archive, &opts)?;
        assert!(!backend.called("pg_restore"));
        Ok(())
    }

    #[test]
    fn database_restore_failure_leaves_app_stopped_and_names_the_step() -> Result<()> {
        let (_dir, archive) = archive_with("community", false, false)?;
        let backend = live("community").fail("database load", "store locked");
        let config = config();

        let err = orchestrator(&config, &backend)
            .restore_backup(&archive, &RestoreOptions::default())
            .unwrap_err();
        let rendered = format!("{err:#}");
        assert!(rendered.contains("DatabaseRestore step failed"), "{rendered}");
        assert!(rendered.contains("left stopped"), "{rendered}");
        assert!(!backend.called("start infrahub-server"));
        assert!(!backend.running_services().contains(SERVER_SERVICE));
        Ok(())
    }

    #[test]
    fn missing_archive_and_metadata() -> Result<()> {
        let backend = live("community");
        let config = config();
        let err = orchestrator(&config, &backend)
            .restore_backup(Path::new("/no/such/backup.tar.gz"), &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::MissingBackupFile(_))));

        let stage = tempdir()?;
        fs::create_dir_all(stage.path().join("backup/database"))?;
        let out = tempdir()?;
        let archive = out.path().join("broken.tar.gz");
        create_tar_gz_archive(stage.path(), &archive)?;
        let err = orchestrator(&config, &backend)
            .restore_backup(&archive, &RestoreOptions::default())
            .unwrap_err();
        assert!(matches!(find_ops_error(&err), Some(OpsError::MissingMetadata)));
        Ok(())
    }

    #[test]
    fn backup_then_restore_round_trip() -> Result<()> {
        let dir = tempdir()?;
        let config = Configuration {
            backup_dir: dir.path().to_path_buf(),
            ..fast_config()
        };
        let source = live("community")
            .on("psql", "0")
            .remote_file(DATABASE_SERVICE, "/tmp/infrahubops_dump/neo4j.dump", b"graph")
            .remote_file(TASK_MANAGER_DB_SERVICE, "/tmp/infrahubops_prefect.dump", b"prefect");
        let report = orchestrator(&config, &source).create_backup(&BackupOptions::default())?;

        let target = live("community");
        orchestrator(&config, &target).restore_backup(&report.archive, &RestoreOptions::default())?;
        assert_eq!(
            target.remote(DATABASE_SERVICE, "/tmp/infrahubops/neo4j.dump").as_deref(),
            Some(&b"graph"[..])
        );
        Ok(())
    }
}
