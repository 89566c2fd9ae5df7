pub(crate) mod db_restore;
mod logic;
pub(crate) mod verification;

use std::fmt;

/// Stages of RestoreBackup, in execution order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RestoreStep {
    ArchiveExtract,
    MetadataValidate,
    EditionReconcile,
    TaskManagerPresenceCheck,
    ChecksumValidate,
    WipeTransientData,
    StopApp,
    WorkflowDbRestore,
    RestartDependencies,
    DatabaseRestore,
    RestartApp,
}

impl fmt::Display for RestoreStep {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(self, f)
    }
}

#[derive(Debug, Clone, Default)]
pub struct RestoreOptions {
    pub exclude_task_manager: bool,
    /// Convert the restored store to the block format.
    pub migrate_format: bool,
}
