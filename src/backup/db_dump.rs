// infrahub-backup/src/backup/db_dump.rs
use anyhow::{Context, Result};
use std::fs;
use std::path::Path;
use tracing::{info, warn};

use crate::backend::{DATABASE_SERVICE, ExecOptions};
use crate::edition::Neo4jEdition;
use crate::integrity::DATABASE_DIR;
use crate::ops::BackupOrchestrator;
use crate::watchdog::REMOTE_WORK_DIR;

/// Staging directory for enterprise backups and restores inside the database container.
pub const NEO4J_TEMP_BACKUP_DIR: &str = "/tmp/infrahubops";

impl BackupOrchestrator<'_> {
    /// Captures the graph database into `<backup_root>/database`.
    pub(crate) fn backup_neo4j(&self, backup_root: &Path, edition: Neo4jEdition, neo4j_metadata: &str) -> Result<()> {
        match edition {
            Neo4jEdition::Enterprise => self.backup_neo4j_enterprise(backup_root, neo4j_metadata),
            Neo4jEdition::Community => self.backup_neo4j_community(backup_root),
        }
    }

    /// Online backup with `neo4j-admin database backup`.
    fn backup_neo4j_enterprise(&self, backup_root: &Path, neo4j_metadata: &str) -> Result<()> {
        info!("Backing up Neo4j database (Enterprise Edition online backup)...");
        self.exec(DATABASE_SERVICE, &["mkdir", "-p", NEO4J_TEMP_BACKUP_DIR])
            .context("Failed to create backup directory in the database container")?;

        let result = (|| {
            let database = &self.config.neo4j.database;
            self.exec_stream(
                DATABASE_SERVICE,
                &[
                    "neo4j-admin",
                    "database",
                    "backup",
                    "--expand-commands",
                    &format!("--include-metadata={}", neo4j_metadata),
                    &format!("--to-path={}", NEO4J_TEMP_BACKUP_DIR),
                    database,
                ],
                &ExecOptions::default(),
            )
            .context("Failed to backup neo4j")?;

            self.backend
                .copy_from(DATABASE_SERVICE, NEO4J_TEMP_BACKUP_DIR, &backup_root.join(DATABASE_DIR))
                .context("Failed to copy database backup")
        })();

        if let Err(err) = self.exec(DATABASE_SERVICE, &["rm", "-rf", NEO4J_TEMP_BACKUP_DIR]) {
            warn!("Failed to remove temporary Neo4j backup directory: {err:#}");
        }
        result?;
        info!("Neo4j backup completed");
        Ok(())
    }

    /// Offline `neo4j-admin database dump` with the database process paused.
    fn backup_neo4j_community(&self, backup_root: &Path) -> Result<()> {
        info!("Backing up Neo4j database (Community Edition offline dump)...");
        let database = self.config.neo4j.database.clone();
        let database_dir = backup_root.join(DATABASE_DIR);
        fs::create_dir_all(&database_dir)
            .with_context(|| format!("Failed to prepare local dump directory {}", database_dir.display()))?;

        self.process_controller().while_paused(|| {
            self.exec(DATABASE_SERVICE, &["mkdir", "-p", REMOTE_WORK_DIR])
                .context("Failed to prepare remote dump directory")?;
            self.exec_stream(
                DATABASE_SERVICE,
                &[
                    "neo4j-admin",
                    "database",
                    "dump",
                    "--overwrite-destination=true",
                    &format!("--to-path={}", REMOTE_WORK_DIR),
                    &database,
                ],
                &ExecOptions::default(),
            )
            .context("Failed to dump neo4j database")?;

            let dump_file = format!("{}.dump", database);
            self.backend
                .copy_from(
                    DATABASE_SERVICE,
                    &format!("{}/{}", REMOTE_WORK_DIR, dump_file),
                    &database_dir.join(&dump_file),
                )
                .context("Failed to copy neo4j dump")
        })?;

        if let Err(err) = self.exec(DATABASE_SERVICE, &["rm", "-rf", REMOTE_WORK_DIR]) {
            warn!("Failed to remove remote dump directory: {err:#}");
        }
        info!("Neo4j dump completed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::backend::fake::FakeBackend;
    use crate::ops::test_support::{fast_config, orchestrator};
    use tempfile::tempdir;

    #[test]
    fn enterprise_backup_copies_the_staging_dir_and_cleans_it() -> Result<()> {
        let backend = FakeBackend::new()
            .remote_file(DATABASE_SERVICE, "/tmp/infrahubops/neo4j.backup", b"full")
            .remote_file(DATABASE_SERVICE, "/tmp/infrahubops/neo4j/inc.backup", b"inc");
        let config = fast_config();
        let work = tempdir()?;

        orchestrator(&config, &backend).backup_neo4j(work.path(), Neo4jEdition::Enterprise, "users")?;

        assert!(backend.called("neo4j-admin database backup --expand-commands --include-metadata=users --to-path=/tmp/infrahubops neo4j"));
        assert_eq!(fs::read(work.path().join("database/neo4j.backup"))?, b"full");
        assert_eq!(fs::read(work.path().join("database/neo4j/inc.backup"))?, b"inc");
        assert!(backend.called("rm -rf /tmp/infrahubops"));
        Ok(())
    }

    #[test]
    fn enterprise_failure_still_removes_staging_dir() {
        let backend = FakeBackend::new().fail("neo4j-admin database backup", "disk full");
        let config = fast_config();
        let work = tempdir().expect("tempdir");

        let err = orchestrator(&config, &backend)
            .backup_neo4j(work.path(), Neo4jEdition::Enterprise, "all")
            .unwrap_err();
        assert!(format!("{err:#}").contains("Failed to backup neo4j"));
        assert!(backend.called("rm -rf /tmp/infrahubops"));
    }

    #[test]
    fn community_dump_runs_while_paused() -> Result<()> {
        let backend = FakeBackend::new()
            .on("neo4j.pid", "77")
            .on("uname -m", "x86_64")
            .on("/proc/77/stat", "gone")
            .remote_file(DATABASE_SERVICE, "/tmp/infrahubops_dump/neo4j.dump", b"dump");
        let config = fast_config();
        let work = tempdir()?;

        orchestrator(&config, &backend).backup_neo4j(work.path(), Neo4jEdition::Community, "all")?;

        assert_eq!(fs::read(work.path().join("database/neo4j.dump"))?, b"dump");
        let stop = backend.position("database: kill 77").expect("stop");
        let dump = backend.position("neo4j-admin database dump").expect("dump");
        let resume = backend.position("kill -CONT 77").expect("resume");
        assert!(stop < dump && dump < resume);
        Ok(())
    }
}
