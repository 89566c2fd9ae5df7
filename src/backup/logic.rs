// infrahub-backup/src/backup/logic.rs
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use std::fs;
use std::thread;
use tracing::{error, info, warn};

use super::archive::create_tar_gz_archive;
use super::{BackupOptions, BackupReport, BackupStep};
use crate::edition::{EditionInfo, detect_for_backup};
use crate::integrity::{BackupMetadata, TASK_MANAGER_COMPONENT, compute_backup_checksums};
use crate::ops::{BackupOrchestrator, run_step};
use crate::utils::format_bytes;

/// `infrahub_backup_YYYYMMDD_HHMMSS.tar.gz` in UTC.
pub fn backup_filename(now: DateTime<Utc>) -> String {
    format!("infrahub_backup_{}.tar.gz", now.format("%Y%m%d_%H%M%S"))
}

impl BackupOrchestrator<'_> {
    /// Produces one self-describing archive under the configured backup directory.
    ///
    /// For community deployments the application services are stopped for the
    /// duration and restarted afterwards on every path. A failed restart after a
    /// written archive is reported on the returned `BackupReport`.
    pub fn create_backup(&self, opts: &BackupOptions) -> Result<BackupReport> {
        let edition = run_step(BackupStep::EditionDetect, || {
            Ok(detect_for_backup(self.backend, &self.config.neo4j))
        })?;

        if edition.is_community() {
            warn!("Neo4j Community Edition detected: Infrahub services will be stopped during the backup");
            let grace = self.config.community_grace_period();
            if !grace.is_zero() {
                warn!("Continuing in {} seconds, press Ctrl+C to abort", grace.as_secs());
                thread::sleep(grace);
            }
        }

        let infrahub_version = self.infrahub_version();

        if opts.force {
            info!("Skipping running task check (--force)");
        } else {
            run_step(BackupStep::TaskCheck, || self.wait_for_running_tasks())?;
        }

        let mut stopped = Vec::new();
        if edition.is_community() {
            if let Err(err) = run_step(BackupStep::Quiesce, || self.stop_app_services(&mut stopped)) {
                if let Err(restart_err) = self.restart_stopped(&stopped) {
                    error!("Failed to restart services after aborted stop: {restart_err:#}");
                }
                return Err(err);
            }
        }

        let outcome = self.write_backup(opts, &edition, infrahub_version);
        let restarted = self.restart_stopped(&stopped);

        match (outcome, restarted) {
            (Ok(report), Ok(())) => Ok(report),
            (Ok(mut report), Err(restart_err)) => {
                error!("Backup succeeded but services could not be restarted: {restart_err:#}");
                report.restart_error = Some(restart_err);
                Ok(report)
            }
            (Err(err), Ok(())) => Err(err),
            (Err(err), Err(restart_err)) => {
                error!("Failed to restart services after backup failure: {restart_err:#}");
                Err(err)
            }
        }
    }

    fn restart_stopped(&self, stopped: &[String]) -> Result<()> {
        if stopped.is_empty() {
            return Ok(());
        }
        let services: Vec<&str> = stopped.iter().map(String::as_str).collect();
        run_step(BackupStep::Resume, || self.start_services(&services))
    }

    fn write_backup(&self, opts: &BackupOptions, edition: &EditionInfo, infrahub_version: String) -> Result<BackupReport> {
        let now = Utc::now();
        let filename = backup_filename(now);
        let include_task_manager = !opts.exclude_task_manager;

        let work_dir = tempfile::Builder::new()
            .prefix("infrahub_backup_")
            .tempdir()
            .context("Failed to create working directory")?;
        let backup_root = work_dir.path().join("backup");
        fs::create_dir_all(&backup_root)
            .with_context(|| format!("Failed to create {}", backup_root.display()))?;

        run_step(BackupStep::DatabaseBackup, || {
            self.backup_neo4j(&backup_root, edition.edition, &opts.neo4j_metadata)
        })?;

        if include_task_manager {
            run_step(BackupStep::WorkflowDbBackup, || self.backup_task_manager_db(&backup_root))?;
        } else {
            info!("Skipping task manager database backup (--exclude-task-manager)");
        }

        let checksums = run_step(BackupStep::Checksum, || {
            compute_backup_checksums(&backup_root, include_task_manager)
        })?;

        let metadata = BackupMetadata {
            backup_id: filename.trim_end_matches(".tar.gz").to_string(),
            created_at: now.to_rfc3339_opts(SecondsFormat::Secs, true),
            tool_version: env!("CARGO_PKG_VERSION").to_string(),
            infrahub_version,
            neo4j_edition: edition.edition.as_str().to_string(),
            components: if include_task_manager {
                vec![TASK_MANAGER_COMPONENT.to_string()]
            } else {
                Vec::new()
            },
            checksums,
        };
        run_step(BackupStep::MetadataWrite, || metadata.write_to(&backup_root))?;

        let archive = self.config.backup_dir.join(&filename);
        run_step(BackupStep::Archive, || create_tar_gz_archive(work_dir.path(), &archive))?;

        let size_bytes = fs::metadata(&archive)
            .with_context(|| format!("Failed to stat {}", archive.display()))?
            .len();
        info!("Backup created: {} ({})", archive.display(), format_bytes(size_bytes));

        Ok(BackupReport {
            archive,
            size_bytes,
            metadata,
            restart_error: None,
        })
    }
}
