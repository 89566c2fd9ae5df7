// infrahub-backup/src/backup/task_manager.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::backend::{ExecOptions, TASK_MANAGER_DB_SERVICE};
use crate::integrity::TASK_MANAGER_DUMP;
use crate::ops::BackupOrchestrator;

const REMOTE_DUMP_NAME: &str = "infrahubops_prefect.dump";

impl BackupOrchestrator<'_> {
    pub(crate) fn postgres_exec_options(&self) -> ExecOptions {
        ExecOptions::default().with_env("PGPASSWORD", &self.config.postgres.password)
    }

    pub(crate) fn remote_task_manager_dump(&self) -> String {
        let dir = self.writable_temp_dir(TASK_MANAGER_DB_SERVICE);
        format!("{}/{}", dir.trim_end_matches('/'), REMOTE_DUMP_NAME)
    }

    /// Dumps the workflow database to `<backup_root>/prefect.dump` in custom format.
    pub(crate) fn backup_task_manager_db(&self, backup_root: &Path) -> Result<()> {
        info!("Backing up PostgreSQL database...");
        let pg = &self.config.postgres;
        let remote_dump = self.remote_task_manager_dump();

        self.exec_with(
            TASK_MANAGER_DB_SERVICE,
            &[
                "pg_dump",
                "-Fc",
                "-h",
                "localhost",
                "-U",
                &pg.username,
                "-d",
                &pg.database,
                "-f",
                &remote_dump,
            ],
            &self.postgres_exec_options(),
        )
        .context("Failed to create prefect database dump")?;

        let copied = self
            .backend
            .copy_from(TASK_MANAGER_DB_SERVICE, &remote_dump, &backup_root.join(TASK_MANAGER_DUMP))
            .context("Failed to copy prefect database dump");

        if let Err(err) = self.exec(TASK_MANAGER_DB_SERVICE, &["rm", "-f", &remote_dump]) {
            warn!("Failed to remove remote prefect dump {}: {err:#}", remote_dump);
        }
        copied?;
        info!("PostgreSQL backup completed");
        Ok(())
    }
}
