// infrahub-backup/src/restore/db_restore.rs
use anyhow::{Context, Result};
use std::path::Path;
use tracing::{info, warn};

use crate::backend::{DATABASE_SERVICE, ExecOptions, TASK_MANAGER_DB_SERVICE};
use crate::backup::db_dump::NEO4J_TEMP_BACKUP_DIR;
use crate::edition::Neo4jEdition;
use crate::integrity::{DATABASE_DIR, TASK_MANAGER_DUMP};
use crate::ops::BackupOrchestrator;
use crate::utils::command::shell_quote;

/// Cypher script shipped in the database image that re-applies users and roles.
pub const NEO4J_METADATA_SCRIPT: &str = "/data/scripts/neo4j/restore_metadata.cypher";

const NEO4J_USER: &str = "neo4j";

impl BackupOrchestrator<'_> {
    fn system_cypher(&self, statement: &str) -> Result<String> {
        let neo4j = &self.config.neo4j;
        self.exec(
            DATABASE_SERVICE,
            &[
                "cypher-shell",
                "-u",
                &neo4j.username,
                &format!("-p{}", neo4j.password),
                "-d",
                "system",
                statement,
            ],
        )
    }

    /// Loads `<backup_root>/database` into the graph database.
    pub(crate) fn restore_neo4j(&self, backup_root: &Path, edition: Neo4jEdition, migrate_format: bool) -> Result<()> {
        self.backend
            .copy_to(DATABASE_SERVICE, &backup_root.join(DATABASE_DIR), NEO4J_TEMP_BACKUP_DIR)
            .context("Failed to copy backup to container")?;

        let result = self
            .exec(DATABASE_SERVICE, &["chown", "-R", "neo4j:neo4j", NEO4J_TEMP_BACKUP_DIR])
            .context("Failed to change backup ownership")
            .and_then(|_| match edition {
                Neo4jEdition::Community => self.restore_neo4j_community(migrate_format),
                Neo4jEdition::Enterprise => self.restore_neo4j_enterprise(migrate_format),
            });

        if let Err(err) = self.exec(DATABASE_SERVICE, &["rm", "-rf", NEO4J_TEMP_BACKUP_DIR]) {
            warn!("Failed to cleanup temporary Neo4j backup data: {err:#}");
        }
        result
    }

    fn restore_neo4j_enterprise(&self, migrate_format: bool) -> Result<()> {
        info!("Restoring Neo4j database (Enterprise Edition)...");
        let database = &self.config.neo4j.database;
        let as_neo4j = ExecOptions::as_user(NEO4J_USER);

        self.system_cypher(&format!("stop database {}", database))
            .context("Failed to stop neo4j database")?;

        self.exec_stream(
            DATABASE_SERVICE,
            &[
                "neo4j-admin",
                "database",
                "restore",
                "--expand-commands",
                "--overwrite-destination=true",
                &format!("--from-path={}", NEO4J_TEMP_BACKUP_DIR),
                database,
            ],
            &as_neo4j,
        )
        .context("Failed to restore neo4j")?;

        if migrate_format {
            self.exec_stream(
                DATABASE_SERVICE,
                &["neo4j-admin", "database", "migrate", "--expand-commands", "--to-format=block", database],
                &as_neo4j,
            )
            .context("Failed to migrate neo4j to block format")?;
        }

        let neo4j = &self.config.neo4j;
        let script = format!(
            "cat {} | cypher-shell -u {} -p{} -d system --param {}",
            NEO4J_METADATA_SCRIPT,
            shell_quote(&neo4j.username),
            shell_quote(&neo4j.password),
            shell_quote(&format!("database => '{}'", database)),
        );
        self.exec_with(DATABASE_SERVICE, &["sh", "-c", &script], &as_neo4j)
            .context("Failed to restore neo4j metadata")?;

        self.system_cypher(&format!("start database {}", database))
            .context("Failed to start neo4j database")?;
        info!("Neo4j database restored");
        Ok(())
    }

    fn restore_neo4j_community(&self, migrate_format: bool) -> Result<()> {
        info!("Restoring Neo4j database (Community Edition dump)...");
        let database = &self.config.neo4j.database;
        let as_neo4j = ExecOptions::as_user(NEO4J_USER);

        self.process_controller().while_paused(|| {
            self.exec_stream(
                DATABASE_SERVICE,
                &[
                    "neo4j-admin",
                    "database",
                    "load",
                    "--overwrite-destination=true",
                    &format!("--from-path={}", NEO4J_TEMP_BACKUP_DIR),
                    database,
                ],
                &as_neo4j,
            )
            .context("Failed to load neo4j dump")?;

            if migrate_format {
                self.exec_stream(
                    DATABASE_SERVICE,
                    &["neo4j-admin", "database", "migrate", "--to-format=block", database],
                    &as_neo4j,
                )
                .context("Failed to migrate neo4j to block format")?;
            }
            Ok(())
        })?;
        info!("Neo4j dump restored successfully");
        Ok(())
    }

    /// Recreates the workflow database from `<backup_root>/prefect.dump`.
    pub(crate) fn restore_task_manager_db(&self, backup_root: &Path) -> Result<()> {
        info!("Restoring PostgreSQL database...");
        self.start_services(&[TASK_MANAGER_DB_SERVICE])
            .context("Failed to start task-manager-db")?;

        let remote_dump = self.remote_task_manager_dump();
        self.backend
            .copy_to(TASK_MANAGER_DB_SERVICE, &backup_root.join(TASK_MANAGER_DUMP), &remote_dump)
            .context("Failed to copy dump to container")?;

        let pg = &self.config.postgres;
        let restored = self
            .exec_with(
                TASK_MANAGER_DB_SERVICE,
                &[
                    "pg_restore",
                    "-h",
                    "localhost",
                    "-d",
                    "postgres",
                    "-U",
                    &pg.username,
                    "--clean",
                    "--create",
                    &remote_dump,
                ],
                &self.postgres_exec_options(),
            )
            .context("Failed to restore postgresql");

        if let Err(err) = self.exec(TASK_MANAGER_DB_SERVICE, &["rm", "-f", &remote_dump]) {
            warn!("Failed to remove temporary postgres dump: {err:#}");
        }
        restored?;
        info!("PostgreSQL database restored");
        Ok(())
    }
}
