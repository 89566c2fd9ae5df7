use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use super::{TASK_MANAGER_COMPONENT, TASK_MANAGER_DUMP};
use crate::edition::Neo4jEdition;
use crate::errors::OpsError;

pub const METADATA_FILE: &str = "backup_information.json";

/// `backup_information.json`, written once per backup and only read afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BackupMetadata {
    #[serde(rename = "backupID")]
    pub backup_id: String,
    pub created_at: String,
    pub tool_version: String,
    pub infrahub_version: String,
    pub neo4j_edition: String,
    #[serde(default)]
    pub components: Vec<String>,
    #[serde(default)]
    pub checksums: BTreeMap<String, String>,
}

impl BackupMetadata {
    /// Recorded edition, if it names one we know.
    pub fn edition(&self) -> Option<Neo4jEdition> {
        Neo4jEdition::parse(&self.neo4j_edition)
    }

    /// The workflow database is part of this backup.
    pub fn includes_task_manager(&self) -> bool {
        self.components.iter().any(|c| c == TASK_MANAGER_COMPONENT)
            || self.checksums.contains_key(TASK_MANAGER_DUMP)
    }

    pub fn to_pretty_json(&self) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        let formatter = serde_json::ser::PrettyFormatter::with_indent(b"    ");
        let mut serializer = serde_json::Serializer::with_formatter(&mut buf, formatter);
        self.serialize(&mut serializer)
            .context("Failed to serialize backup metadata")?;
        Ok(buf)
    }

    pub fn write_to(&self, backup_root: &Path) -> Result<()> {
        let path = backup_root.join(METADATA_FILE);
        fs::write(&path, self.to_pretty_json()?)
            .with_context(|| format!("Failed to write {}", path.display()))
    }

    pub fn read_from(backup_root: &Path) -> Result<Self> {
        let path = backup_root.join(METADATA_FILE);
        if !path.is_file() {
            return Err(OpsError::MissingMetadata.into());
        }
        let raw = fs::read(&path).with_context(|| format!("Failed to read {}", path.display()))?;
        serde_json::from_slice(&raw).with_context(|| format!("Failed to parse {}", path.display()))
    }
}
