use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeSet, HashMap};
use std::path::Path;

use super::{ExecOptions, ExecutionBackend, SERVER_SERVICE, choose_target};
use crate::utils::command::{CommandRunner, argv, non_empty_lines};

const DOCKER: &str = "docker";

/// Docker Compose deployment; runtime units are containers.
pub struct ComposeBackend {
    runner: Box<dyn CommandRunner>,
    requested_project: Option<String>,
    project: String,
    container_cache: RefCell<HashMap<String, String>>,
}

impl ComposeBackend {
    pub fn new(runner: Box<dyn CommandRunner>, project: Option<String>) -> Self {
        Self {
            runner,
            requested_project: project,
            project: String::new(),
            container_cache: RefCell::new(HashMap::new()),
        }
    }

    fn compose_args(&self, rest: &[&str]) -> Vec<String> {
        let mut args = argv(&["compose", "-p", &self.project]);
        args.extend(rest.iter().map(|s| s.to_string()));
        args
    }

    /// Resolves a service to a container id: running containers first, then any state.
    fn container_for(&self, service: &str) -> Result<String> {
        if let Some(id) = self.container_cache.borrow().get(service) {
            return Ok(id.clone());
        }

        let candidates = [
            self.compose_args(&["ps", "-q", service]),
            self.compose_args(&["ps", "-q", "--all", service]),
        ];
        for args in &candidates {
            let Ok(output) = self.runner.run(DOCKER, args) else {
                continue;
            };
            if let Some(id) = non_empty_lines(&output).into_iter().next() {
                self.container_cache
                    .borrow_mut()
                    .insert(service.to_string(), id.clone());
                return Ok(id);
            }
        }
        anyhow::bail!(
            "no container found for service {} in compose project {}",
            service,
            self.project
        )
    }

    fn exec_args(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<Vec<String>> {
        let container = self.container_for(service)?;
        let mut args = argv(&["exec"]);
        if let Some(user) = &opts.user {
            args.push("-u".to_string());
            args.push(user.clone());
        }
        for (key, value) in &opts.env {
            args.push("-e".to_string());
            args.push(format!("{}={}", key, value));
        }
        args.push(container);
        args.extend(command.iter().cloned());
        Ok(args)
    }

    fn compose_services(&self, verb: &str, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        let mut rest = vec![verb];
        rest.extend_from_slice(services);
        self.runner
            .run_quiet(DOCKER, &self.compose_args(&rest))
            .with_context(|| format!("Failed to {} services: {}", verb, services.join(", ")))
    }
}

/// Compose projects that contain an Infrahub server container, sorted and deduplicated.
pub fn list_compose_projects(runner: &dyn CommandRunner) -> Result<Vec<String>> {
    let output = runner.run(
        DOCKER,
        &argv(&[
            "ps",
            "-a",
            "--filter",
            &format!("label=com.docker.compose.service={}", SERVER_SERVICE),
            "--format",
            "{{.Label \"com.docker.compose.project\"}}",
        ]),
    )?;
    let projects: BTreeSet<String> = non_empty_lines(&output).into_iter().collect();
    Ok(projects.into_iter().collect())
}

impl ExecutionBackend for ComposeBackend {
    fn name(&self) -> &'static str {
        "docker"
    }

    fn target(&self) -> String {
        self.project.clone()
    }

    fn detect(&mut self) -> Result<()> {
        self.runner
            .run_quiet(DOCKER, &argv(&["compose", "version"]))
            .context("docker compose CLI not available")?;
        let projects = list_compose_projects(self.runner.as_ref())?;
        self.project = choose_target(
            "docker compose projects",
            self.requested_project.as_deref(),
            projects,
        )?;
        Ok(())
    }

    fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run(DOCKER, &args)
    }

    fn exec_stream(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        let args = self.exec_args(service, command, opts)?;
        self.runner.run_streaming(DOCKER, &args)
    }

    fn copy_to(&self, service: &str, local: &Path, remote: &str) -> Result<()> {
        let container = self.container_for(service)?;
        let args = vec![
            "cp".to_string(),
            local.display().to_string(),
            format!("{}:{}", container, remote),
        ];
        self.runner.run_quiet(DOCKER, &args)
    }

    fn copy_from(&self, service: &str, remote: &str, local: &Path) -> Result<()> {
        let container = self.container_for(service)?;
        let args = vec![
            "cp".to_string(),
            format!("{}:{}", container, remote),
            local.display().to_string(),
        ];
        self.runner.run_quiet(DOCKER, &args)
    }

    fn start(&self, services: &[&str]) -> Result<()> {
        self.compose_services("start", services)
    }

    fn stop(&self, services: &[&str]) -> Result<()> {
        self.compose_services("stop", services)
    }

    fn is_running(&self, service: &str) -> Result<bool> {
        let output = self
            .runner
            .run(DOCKER, &self.compose_args(&["ps", "--status", "running", "--services"]))?;
        Ok(non_empty_lines(&output).iter().any(|s| s == service))
    }
}
