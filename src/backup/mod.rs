pub(crate) mod archive;
pub(crate) mod db_dump;
mod logic;
pub(crate) mod s3_upload;
pub(crate) mod task_manager;

use std::fmt;
use std::path::PathBuf;

use crate::integrity::BackupMetadata;

pub use logic::backup_filename;

/// Stages of CreateBackup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BackupStep {
    EditionDetect,
    Quiesce,
    TaskCheck,
    DatabaseBackup,
    WorkflowDbBackup,
    Checksum,
    MetadataWrite,
    Archive,
    Resume,
}

impl fmt::Display for BackupStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone)]
pub struct BackupOptions {
    /// Skip the running-task check.
    pub force: bool,
    pub exclude_task_manager: bool,
    /// Value for `neo4j-admin database backup --include-metadata` (enterprise only).
    pub neo4j_metadata: String,
}

impl Default for BackupOptions {
    fn default() -> Self {
        Self {
            force: false,
            exclude_task_manager: false,
            neo4j_metadata: "all".to_string(),
        }
    }
}

/// Result of a backup whose archive was written.
///
/// Restarting services happens after the archive exists, so its failure is kept
/// apart from the archive itself.
#[derive(Debug)]
pub struct BackupReport {
    pub archive: PathBuf,
    pub size_bytes: u64,
    pub metadata: BackupMetadata,
    pub restart_error: Option<anyhow::Error>,
}

impl BackupReport {
    /// Fails if services could not be restarted, naming the valid archive.
    pub fn services_restored(&mut self) -> anyhow::Result<()> {
        match self.restart_error.take() {
            None => Ok(()),
            Some(err) => Err(err.context(format!(
                "backup written to {} but application services were not restarted",
                self.archive.display()
            ))),
        }
    }
}
