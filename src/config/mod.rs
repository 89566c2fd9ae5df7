// infrahub-backup/src/config/mod.rs
use anyhow::{Context, Result};
use serde::Deserialize;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

pub const DEFAULT_BACKUP_DIR: &str = "./infrahub_backups";
pub const DEFAULT_S3_REGION: &str = "us-east-1";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Neo4jConfig {
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for Neo4jConfig {
    fn default() -> Self {
        Self {
            username: "neo4j".to_string(),
            password: "admin".to_string(),
            database: "neo4j".to_string(),
        }
    }
}

/// Connection to the task manager (Prefect) PostgreSQL database.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct PostgresConfig {
    pub username: String,
    pub password: String,
    pub database: String,
}

impl Default for PostgresConfig {
    fn default() -> Self {
        Self {
            username: "postgres".to_string(),
            password: "postgres".to_string(),
            database: "prefect".to_string(),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct S3Config {
    pub bucket_name: String,
    pub region: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub endpoint_url: Option<String>,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            region: DEFAULT_S3_REGION.to_string(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            endpoint_url: None,
        }
    }
}

impl S3Config {
    /// Checks that everything an upload needs is present.
    pub fn validate(&self) -> Result<()> {
        if self.bucket_name.trim().is_empty() {
            anyhow::bail!("S3 bucket not configured (set S3_BUCKET)");
        }
        if self.access_key_id.trim().is_empty() {
            anyhow::bail!("S3 access key ID not configured (set S3_ACCESS_KEY_ID)");
        }
        if self.secret_access_key.trim().is_empty() {
            anyhow::bail!("S3 secret key not configured (set S3_SECRET_ACCESS_KEY)");
        }
        if let Some(endpoint) = &self.endpoint_url {
            let parsed = Url::parse(endpoint)
                .with_context(|| format!("Invalid S3 endpoint URL: {}", endpoint))?;
            if !matches!(parsed.scheme(), "http" | "https") {
                anyhow::bail!("S3 endpoint must use http or https: {}", endpoint);
            }
        }
        Ok(())
    }
}

/// Process-wide settings, built once at startup and passed by reference afterwards.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct Configuration {
    pub compose_project: Option<String>,
    pub k8s_namespace: Option<String>,
    pub backup_dir: PathBuf,
    pub neo4j: Neo4jConfig,
    pub postgres: PostgresConfig,
    pub log_format: LogFormat,
    pub community_grace_period_secs: u64,
    pub task_wait_timeout_secs: u64,
    pub s3_upload: bool,
    pub s3_storage: S3Config,
}

impl Default for Configuration {
    fn default() -> Self {
        Self {
            compose_project: None,
            k8s_namespace: None,
            backup_dir: PathBuf::from(DEFAULT_BACKUP_DIR),
            neo4j: Neo4jConfig::default(),
            postgres: PostgresConfig::default(),
            log_format: LogFormat::Text,
            community_grace_period_secs: 10,
            task_wait_timeout_secs: 300,
            s3_upload: false,
            s3_storage: S3Config::default(),
        }
    }
}

impl Configuration {
    /// Defaults, then the optional JSON file, then `.env` and the process environment.
    pub fn load(config_path: Option<&Path>) -> Result<Self> {
        let mut config = match config_path {
            Some(path) => Self::load_from_json(path)?,
            None => Self::default(),
        };
        dotenv::dotenv().ok();
        config.apply_env(|key| std::env::var(key).ok())?;
        Ok(config)
    }

    pub fn load_from_json(config_path: &Path) -> Result<Self> {
        let config_content = fs::read_to_string(config_path)
            .with_context(|| format!("Failed to read config file at {}", config_path.display()))?;
        serde_json::from_str(&config_content).with_context(|| {
            format!(
                "Failed to parse JSON from config file at {}",
                config_path.display()
            )
        })
    }

    /// Overlays values found through `lookup`; empty values are ignored.
    pub fn apply_env<F>(&mut self, lookup: F) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).filter(|value| !value.trim().is_empty());

        if let Some(project) = get("INFRAHUB_PROJECT") {
            self.compose_project = Some(project);
        }
        if let Some(namespace) = get("INFRAHUB_K8S_NAMESPACE") {
            self.k8s_namespace = Some(namespace);
        }
        if let Some(dir) = get("INFRAHUB_BACKUP_DIR") {
            self.backup_dir = PathBuf::from(dir);
        }
        if let Some(format) = get("INFRAHUB_LOG_FORMAT") {
            self.log_format = match format.to_lowercase().as_str() {
                "json" => LogFormat::Json,
                "text" => LogFormat::Text,
                other => anyhow::bail!("INFRAHUB_LOG_FORMAT must be text or json, got {:?}", other),
            };
        }
        if let Some(flag) = get("INFRAHUB_S3_UPLOAD") {
            self.s3_upload = parse_bool("INFRAHUB_S3_UPLOAD", &flag)?;
        }

        if let Some(v) = get("INFRAHUB_NEO4J_USERNAME") {
            self.neo4j.username = v;
        }
        if let Some(v) = get("INFRAHUB_NEO4J_PASSWORD") {
            self.neo4j.password = v;
        }
        if let Some(v) = get("INFRAHUB_NEO4J_DATABASE") {
            self.neo4j.database = v;
        }
        if let Some(v) = get("INFRAHUB_POSTGRES_USERNAME") {
            self.postgres.username = v;
        }
        if let Some(v) = get("INFRAHUB_POSTGRES_PASSWORD") {
            self.postgres.password = v;
        }
        if let Some(v) = get("INFRAHUB_POSTGRES_DATABASE") {
            self.postgres.database = v;
        }

        if let Some(v) = get("S3_BUCKET") {
            self.s3_storage.bucket_name = v;
        }
        if let Some(v) = get("S3_ENDPOINT") {
            self.s3_storage.endpoint_url = Some(v);
        }
        if let Some(v) = get("S3_REGION") {
            self.s3_storage.region = v;
        }
        if let Some(v) = get("S3_ACCESS_KEY_ID") {
            self.s3_storage.access_key_id = v;
        }
        if let Some(v) = get("S3_SECRET_ACCESS_KEY") {
            self.s3_storage.secret_access_key = v;
        }
        Ok(())
    }

    pub fn community_grace_period(&self) -> Duration {
        Duration::from_secs(self.community_grace_period_secs)
    }

    pub fn task_wait_timeout(&self) -> Duration {
        Duration::from_secs(self.task_wait_timeout_secs)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => anyhow::bail!("{} must be a boolean, got {:?}", key, other),
    }
}
