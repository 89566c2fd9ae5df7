//! Shared orchestration state and the service-level helpers both flows use.

use anyhow::{Context, Result};
use regex::Regex;
use std::fmt::Display;
use std::thread;
use std::time::{Duration, Instant};
use tracing::{debug, info, info_span, warn};

use crate::backend::{
    self, CACHE_SERVICE, DATABASE_SERVICE, ExecOptions, ExecutionBackend, MESSAGE_QUEUE_SERVICE,
    SERVER_SERVICE, TASK_MANAGER_DB_SERVICE, TASK_MANAGER_SERVICE, TASK_WORKER_SERVICE,
};
use crate::config::Configuration;
use crate::errors::OpsError;
use crate::utils::command::{argv, non_empty_lines};
use crate::utils::find_orchestrator_clis;
use crate::watchdog::{ProcessController, WatchdogAssets, WatchdogTimings};

/// Services that write to the databases and are stopped around offline operations.
pub const APP_SERVICES: &[&str] = &[SERVER_SERVICE, TASK_WORKER_SERVICE, TASK_MANAGER_SERVICE];

const TEMP_DIR_CANDIDATES: &[&str] = &["/tmp", "/var/tmp"];

/// Runs one named step inside its own span; failures name the step.
pub(crate) fn run_step<T, S, F>(step: S, f: F) -> Result<T>
where
    S: Display,
    F: FnOnce() -> Result<T>,
{
    let span = info_span!("step", name = %step);
    let _guard = span.enter();
    debug!("step started");
    f().with_context(|| format!("{} step failed", step))
}

/// Checks the local CLIs and attaches to the deployment.
pub fn connect(config: &Configuration) -> Result<Box<dyn ExecutionBackend>> {
    run_step("PrereqCheck", || {
        for (name, path) in find_orchestrator_clis()? {
            debug!(cli = %name, path = %path.display(), "found orchestrator CLI");
        }
        Ok(())
    })?;
    run_step("EnvDetect", || backend::detect_backend(config))
}

/// Drives backup and restore against one detected deployment.
pub struct BackupOrchestrator<'a> {
    pub(crate) config: &'a Configuration,
    pub(crate) backend: &'a dyn ExecutionBackend,
    pub(crate) watchdog_assets: WatchdogAssets,
    pub(crate) watchdog_timings: WatchdogTimings,
    pub(crate) task_poll_interval: Duration,
}

impl<'a> BackupOrchestrator<'a> {
    pub fn new(config: &'a Configuration, backend: &'a dyn ExecutionBackend) -> Self {
        Self {
            config,
            backend,
            watchdog_assets: WatchdogAssets::embedded(),
            watchdog_timings: WatchdogTimings::default(),
            task_poll_interval: Duration::from_secs(5),
        }
    }

    #[cfg(test)]
    pub fn with_watchdog(mut self, assets: WatchdogAssets, timings: WatchdogTimings) -> Self {
        self.watchdog_assets = assets;
        self.watchdog_timings = timings;
        self
    }

    #[cfg(test)]
    pub fn with_task_poll_interval(mut self, interval: Duration) -> Self {
        self.task_poll_interval = interval;
        self
    }

    pub(crate) fn exec(&self, service: &str, command: &[&str]) -> Result<String> {
        self.exec_with(service, command, &ExecOptions::default())
    }

    pub(crate) fn exec_with(&self, service: &str, command: &[&str], opts: &ExecOptions) -> Result<String> {
        self.backend.exec(service, &argv(command), opts)
    }

    pub(crate) fn exec_stream(&self, service: &str, command: &[&str], opts: &ExecOptions) -> Result<String> {
        self.backend.exec_stream(service, &argv(command), opts)
    }

    pub(crate) fn process_controller(&self) -> ProcessController<'_> {
        ProcessController::new(
            self.backend,
            DATABASE_SERVICE,
            self.watchdog_assets,
            self.watchdog_timings,
        )
    }

    /// Stops the running application services one at a time.
    ///
    /// Each service is pushed onto `stopped` as soon as it is down, so the caller
    /// knows exactly what to bring back even when a later stop fails.
    pub(crate) fn stop_app_services(&self, stopped: &mut Vec<String>) -> Result<()> {
        for service in APP_SERVICES {
            let running = self
                .backend
                .is_running(service)
                .with_context(|| format!("Failed to check state of {}", service))?;
            if !running {
                debug!(service, "already stopped");
                continue;
            }
            info!("Stopping {}", service);
            self.backend.stop(&[service])?;
            stopped.push(service.to_string());
        }
        Ok(())
    }

    pub(crate) fn start_services(&self, services: &[&str]) -> Result<()> {
        if services.is_empty() {
            return Ok(());
        }
        info!("Starting {}", services.join(", "));
        self.backend.start(services)
    }

    /// Best-effort version of the running Infrahub server.
    pub(crate) fn infrahub_version(&self) -> String {
        let output = self.exec(
            SERVER_SERVICE,
            &["python", "-c", "import infrahub; print(infrahub.__version__)"],
        );
        let version = output.ok().and_then(|out| {
            Regex::new(r"\d+\.\d+\.\d+[0-9A-Za-z.+-]*")
                .ok()?
                .find(&out)
                .map(|m| m.as_str().to_string())
        });
        version.unwrap_or_else(|| {
            warn!("Could not determine Infrahub version");
            "unknown".to_string()
        })
    }

    fn count_running_tasks(&self) -> Result<u64> {
        let pg = &self.config.postgres;
        let opts = ExecOptions::default().with_env("PGPASSWORD", &pg.password);
        let output = self.exec_with(
            TASK_MANAGER_DB_SERVICE,
            &[
                "psql",
                "-h",
                "localhost",
                "-U",
                &pg.username,
                "-d",
                &pg.database,
                "-tAc",
                "SELECT count(*) FROM flow_run WHERE state_type IN ('RUNNING', 'PENDING', 'CANCELLING')",
            ],
            &opts,
        )?;
        output
            .trim()
            .parse::<u64>()
            .with_context(|| format!("Unexpected task count output {:?}", output.trim()))
    }

    /// Waits until the task manager reports no running work, up to the configured timeout.
    pub(crate) fn wait_for_running_tasks(&self) -> Result<()> {
        let timeout = self.config.task_wait_timeout();
        let started = Instant::now();
        loop {
            let count = self
                .count_running_tasks()
                .context("Failed to query running tasks")?;
            if count == 0 {
                info!("No running tasks in the task manager");
                return Ok(());
            }
            if started.elapsed() >= timeout {
                return Err(OpsError::RunningTasks { count }.into());
            }
            info!("Waiting for {} running task(s) to finish...", count);
            thread::sleep(self.task_poll_interval);
        }
    }

    /// First of `/tmp`, `/var/tmp` that the service can write to.
    pub(crate) fn writable_temp_dir(&self, service: &str) -> String {
        for dir in TEMP_DIR_CANDIDATES {
            if self.exec(service, &["test", "-w", dir]).is_ok() {
                return dir.to_string();
            }
        }
        warn!(service, "No writable temp directory confirmed; using /tmp");
        TEMP_DIR_CANDIDATES[0].to_string()
    }

    /// Clears cache and message-queue state. Failures are logged, never fatal.
    pub(crate) fn wipe_transient_data(&self) {
        match self.exec(CACHE_SERVICE, &["redis-cli", "FLUSHALL"]) {
            Ok(_) => info!("Flushed cache"),
            Err(err) => warn!("Failed to flush cache: {err:#}"),
        }

        let queues = match self.exec(
            MESSAGE_QUEUE_SERVICE,
            &["rabbitmqctl", "list_queues", "--quiet", "--no-table-headers", "name"],
        ) {
            Ok(output) => non_empty_lines(&output),
            Err(err) => {
                warn!("Failed to list message queues: {err:#}");
                return;
            }
        };
        for queue in &queues {
            if let Err(err) = self.exec(MESSAGE_QUEUE_SERVICE, &["rabbitmqctl", "purge_queue", queue]) {
                warn!(queue = %queue, "Failed to purge queue: {err:#}");
            }
        }
        info!("Purged {} message queue(s)", queues.len());
    }

    /// Brings back the task manager and makes sure the graph database is up.
    pub(crate) fn restart_dependencies(&self) -> Result<()> {
        self.start_services(&[TASK_MANAGER_SERVICE])?;
        if !self.backend.is_running(DATABASE_SERVICE)? {
            self.start_services(&[DATABASE_SERVICE])?;
        }
        Ok(())
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use super::*;

    pub(crate) static TEST_WATCHDOG: &[(&str, &[u8])] = &[("amd64", b"watchdog"), ("arm64", b"watchdog")];

    pub(crate) fn fast_config() -> Configuration {
        Configuration {
            community_grace_period_secs: 0,
            task_wait_timeout_secs: 0,
            ..Configuration::default()
        }
    }

    pub(crate) fn orchestrator<'a>(
        config: &'a Configuration,
        backend: &'a dyn ExecutionBackend,
    ) -> BackupOrchestrator<'a> {
        let timings = WatchdogTimings {
            ready_timeout: Duration::from_millis(20),
            ready_poll: Duration::from_millis(2),
            stop_timeout: Duration::from_millis(20),
            stop_poll: Duration::from_millis(2),
        };
        BackupOrchestrator::new(config, backend)
            .with_watchdog(WatchdogAssets::from_table(TEST_WATCHDOG), timings)
            .with_task_poll_interval(Duration::from_millis(1))
    }
}
