use std::path::PathBuf;
use std::time::Duration;

use thiserror::Error;

/// Conditions that callers need to tell apart from generic failures.
///
/// These travel inside `anyhow::Error` and are recovered with `downcast_ref`.
#[derive(Error, Debug)]
pub enum OpsError {
    #[error("no Infrahub deployment found")]
    EnvironmentNotFound,

    #[error("multiple {kind} found: {} (select one explicitly)", candidates.join(", "))]
    AmbiguousEnvironment { kind: &'static str, candidates: Vec<String> },

    #[error("command `{program} {}` failed ({status}): {stderr}", args.join(" "))]
    CommandFailed {
        program: String,
        args: Vec<String>,
        status: String,
        stdout: String,
        stderr: String,
    },

    #[error("cannot restore an enterprise backup on a community edition Neo4j")]
    IncompatibleEdition,

    #[error("checksum mismatch for {path}: expected {expected}, got {actual}")]
    ChecksumMismatch {
        path: String,
        expected: String,
        actual: String,
    },

    #[error("missing backup file: {0}")]
    MissingBackupFile(String),

    #[error("checksum entry {0:?} does not name a file under database/")]
    UnexpectedChecksumKey(String),

    #[error("invalid backup file: missing metadata")]
    MissingMetadata,

    #[error("invalid pid {0:?} in neo4j pid file")]
    InvalidPid(String),

    #[error("timed out after {after:?} waiting for {what}")]
    Timeout { what: String, after: Duration },

    #[error("{count} task(s) still running in the task manager (use --force to skip this check)")]
    RunningTasks { count: u64 },

    #[error("S3 upload failed; the local backup is still valid at {}", archive.display())]
    UploadFailed { archive: PathBuf },
}

/// Returns the first `OpsError` in an error chain, if any.
pub fn find_ops_error(err: &anyhow::Error) -> Option<&OpsError> {
    // Context values are only visible through anyhow's own downcast.
    err.downcast_ref::<OpsError>()
        .or_else(|| err.chain().find_map(|cause| cause.downcast_ref::<OpsError>()))
}
