//! Neo4j edition detection and the restore-time reconciliation policy.

use anyhow::{Context, Result};
use std::fmt;
use tracing::{info, warn};

use crate::backend::{DATABASE_SERVICE, ExecOptions, ExecutionBackend};
use crate::config::Neo4jConfig;
use crate::errors::OpsError;
use crate::utils::command::argv;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Neo4jEdition {
    Community,
    Enterprise,
}

impl Neo4jEdition {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Community => "community",
            Self::Enterprise => "enterprise",
        }
    }

    /// Case-insensitive parse of a recorded edition name.
    pub fn parse(value: &str) -> Option<Self> {
        match value.trim().to_lowercase().as_str() {
            "community" => Some(Self::Community),
            "enterprise" => Some(Self::Enterprise),
            _ => None,
        }
    }

    /// Anything mentioning "community" is community; everything else is enterprise.
    pub fn classify(probe_output: &str) -> Result<Self> {
        let normalized = probe_output.trim().to_lowercase();
        if normalized.is_empty() {
            anyhow::bail!("edition probe returned no output");
        }
        if normalized.contains("community") {
            Ok(Self::Community)
        } else {
            Ok(Self::Enterprise)
        }
    }
}

impl fmt::Display for Neo4jEdition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Outcome of one detection; immutable once produced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EditionInfo {
    pub edition: Neo4jEdition,
    pub detection_error: Option<String>,
}

impl EditionInfo {
    pub fn detected(edition: Neo4jEdition) -> Self {
        Self {
            edition,
            detection_error: None,
        }
    }

    pub fn is_community(&self) -> bool {
        self.edition == Neo4jEdition::Community
    }
}

/// Asks the running database which edition it is.
pub fn probe_edition(backend: &dyn ExecutionBackend, neo4j: &Neo4jConfig) -> Result<Neo4jEdition> {
    let password = format!("-p{}", neo4j.password);
    let output = backend
        .exec(
            DATABASE_SERVICE,
            &argv(&[
                "cypher-shell",
                "-u",
                &neo4j.username,
                &password,
                "--format",
                "plain",
                "CALL dbms.components() YIELD edition RETURN edition",
            ]),
            &ExecOptions::default(),
        )
        .context("failed to query neo4j edition")?;
    // Plain output is a header line followed by the value.
    let value = output.lines().skip(1).collect::<Vec<_>>().join("\n");
    Neo4jEdition::classify(&value)
}

/// Backup detection: an undetermined edition is treated as non-community.
pub fn detect_for_backup(backend: &dyn ExecutionBackend, neo4j: &Neo4jConfig) -> EditionInfo {
    match probe_edition(backend, neo4j) {
        Ok(edition) => {
            info!("Detected Neo4j {} edition", edition);
            EditionInfo::detected(edition)
        }
        Err(err) => {
            warn!("Could not determine Neo4j edition: {err:#}");
            EditionInfo {
                edition: Neo4jEdition::Enterprise,
                detection_error: Some(format!("{err:#}")),
            }
        }
    }
}

/// Restore detection: failure falls back to the community procedure.
pub fn detect_for_restore(backend: &dyn ExecutionBackend, neo4j: &Neo4jConfig) -> EditionInfo {
    match probe_edition(backend, neo4j) {
        Ok(edition) => EditionInfo::detected(edition),
        Err(err) => {
            warn!("Could not detect Neo4j edition during restore; defaulting to community workflow: {err:#}");
            EditionInfo {
                edition: Neo4jEdition::Community,
                detection_error: Some(format!("{err:#}")),
            }
        }
    }
}

/// Chooses the restore procedure from the recorded and the live edition.
pub fn reconcile(recorded: Option<Neo4jEdition>, live: &EditionInfo) -> Result<Neo4jEdition> {
    if live.detection_error.is_some() {
        return Ok(Neo4jEdition::Community);
    }
    let edition = match (recorded, live.edition) {
        (Some(Neo4jEdition::Community), Neo4jEdition::Enterprise) => Neo4jEdition::Community,
        (Some(Neo4jEdition::Enterprise), Neo4jEdition::Community) => {
            return Err(OpsError::IncompatibleEdition.into());
        }
        (_, live_edition) => live_edition,
    };
    info!("Using Neo4j {} edition procedure for restore", edition);
    Ok(edition)
}
