//! Where commands run.
//!
//! The orchestrator only ever sees `dyn ExecutionBackend`. The two variants map the
//! same logical services onto Docker Compose containers or Kubernetes pods.

pub mod compose;
pub mod kubernetes;

#[cfg(test)]
pub(crate) mod fake;

use anyhow::Result;
use std::collections::BTreeMap;
use std::path::Path;
use tracing::{debug, info};

use crate::config::Configuration;
use crate::errors::{OpsError, find_ops_error};
use crate::utils::command::{CommandExecutor, CommandRunner};

pub use compose::ComposeBackend;
pub use kubernetes::KubernetesBackend;

pub const DATABASE_SERVICE: &str = "database";
pub const TASK_MANAGER_DB_SERVICE: &str = "task-manager-db";
pub const TASK_MANAGER_SERVICE: &str = "task-manager";
pub const SERVER_SERVICE: &str = "infrahub-server";
pub const TASK_WORKER_SERVICE: &str = "task-worker";
pub const CACHE_SERVICE: &str = "cache";
pub const MESSAGE_QUEUE_SERVICE: &str = "message-queue";

/// Per-call execution tweaks. Never persisted.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOptions {
    pub user: Option<String>,
    pub env: BTreeMap<String, String>,
}

impl ExecOptions {
    pub fn as_user(user: &str) -> Self {
        Self {
            user: Some(user.to_string()),
            ..Self::default()
        }
    }

    pub fn with_env(mut self, key: &str, value: &str) -> Self {
        self.env.insert(key.to_string(), value.to_string());
        self
    }
}

pub trait ExecutionBackend {
    /// Short backend name, e.g. `docker` or `kubernetes`.
    fn name(&self) -> &'static str;

    /// The resolved target (compose project or namespace); empty before `detect`.
    fn target(&self) -> String;

    fn detect(&mut self) -> Result<()>;

    fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String>;

    fn exec_stream(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String>;

    fn copy_to(&self, service: &str, local: &Path, remote: &str) -> Result<()>;

    fn copy_from(&self, service: &str, remote: &str, local: &Path) -> Result<()>;

    fn start(&self, services: &[&str]) -> Result<()>;

    fn stop(&self, services: &[&str]) -> Result<()>;

    fn is_running(&self, service: &str) -> Result<bool>;
}

/// Picks and detects the backend for this run using the real CLIs.
pub fn detect_backend(config: &Configuration) -> Result<Box<dyn ExecutionBackend>> {
    select_backend(config, || Box::new(CommandExecutor::new()))
}

/// An explicit namespace selects Kubernetes and an explicit project selects Compose.
/// Otherwise Compose is tried first, then Kubernetes. Ambiguity is never papered over.
pub fn select_backend<F>(config: &Configuration, make_runner: F) -> Result<Box<dyn ExecutionBackend>>
where
    F: Fn() -> Box<dyn CommandRunner>,
{
    if let Some(namespace) = &config.k8s_namespace {
        let mut backend = KubernetesBackend::new(make_runner(), Some(namespace.clone()));
        backend.detect()?;
        return Ok(announce(Box::new(backend)));
    }
    if let Some(project) = &config.compose_project {
        let mut backend = ComposeBackend::new(make_runner(), Some(project.clone()));
        backend.detect()?;
        return Ok(announce(Box::new(backend)));
    }

    let mut compose = ComposeBackend::new(make_runner(), None);
    match compose.detect() {
        Ok(()) => return Ok(announce(Box::new(compose))),
        Err(err) if is_ambiguous(&err) => return Err(err),
        Err(err) => debug!("docker compose detection failed: {err:#}"),
    }

    let mut kubernetes = KubernetesBackend::new(make_runner(), None);
    match kubernetes.detect() {
        Ok(()) => Ok(announce(Box::new(kubernetes))),
        Err(err) if is_ambiguous(&err) => Err(err),
        Err(err) => {
            debug!("kubernetes detection failed: {err:#}");
            Err(OpsError::EnvironmentNotFound.into())
        }
    }
}

fn is_ambiguous(err: &anyhow::Error) -> bool {
    matches!(
        find_ops_error(err),
        Some(OpsError::AmbiguousEnvironment { .. })
    )
}

fn announce(backend: Box<dyn ExecutionBackend>) -> Box<dyn ExecutionBackend> {
    info!(
        backend = backend.name(),
        target = %backend.target(),
        "Detected Infrahub deployment"
    );
    backend
}

/// Accepts an explicit target if it is among the candidates, or the single discovered one.
pub(crate) fn choose_target(
    kind: &'static str,
    explicit: Option<&str>,
    candidates: Vec<String>,
) -> Result<String> {
    if let Some(target) = explicit {
        if candidates.iter().any(|c| c == target) {
            return Ok(target.to_string());
        }
        anyhow::bail!("{} {} does not host an Infrahub deployment", kind, target);
    }
    match candidates.len() {
        0 => Err(OpsError::EnvironmentNotFound.into()),
        1 => Ok(candidates.into_iter().next().unwrap_or_default()),
        _ => Err(OpsError::AmbiguousEnvironment { kind, candidates }.into()),
    }
}
