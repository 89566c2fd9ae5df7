//! Pausing the community-edition Neo4j process for offline dump and load.
//!
//! A helper binary is deployed into the database container first so the container
//! stays alive while the database process is stopped. The stop signal is only sent
//! once the helper has reported readiness. After the body runs, the process is always
//! sent a continue signal, whether the body succeeded or not.

use anyhow::{Context, Result};
use std::io::Write;
use std::thread;
use std::time::{Duration, Instant};
use tempfile::NamedTempFile;
use tracing::{debug, info, warn};

use crate::backend::{ExecOptions, ExecutionBackend};
use crate::errors::OpsError;
use crate::utils::cleanup::with_release;
use crate::utils::command::{argv, shell_quote};

include!(concat!(env!("OUT_DIR"), "/watchdog_assets.rs"));

pub const NEO4J_PID_FILE: &str = "/var/lib/neo4j/run/neo4j.pid";
pub const WATCHDOG_BINARY: &str = "/tmp/neo4j-watchdog";
pub const WATCHDOG_READY_FILE: &str = "/tmp/neo4j-watchdog.ready";
pub const WATCHDOG_LOG_FILE: &str = "/tmp/neo4j-watchdog.log";
/// Scratch directory inside the database container for dumps.
pub const REMOTE_WORK_DIR: &str = "/tmp/infrahubops_dump";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Architecture {
    Amd64,
    Arm64,
}

impl Architecture {
    /// Maps `uname -m` output onto a supported helper build.
    pub fn from_uname(machine: &str) -> Result<Self> {
        match machine.trim().to_lowercase().as_str() {
            "x86_64" | "amd64" => Ok(Self::Amd64),
            "aarch64" | "arm64" => Ok(Self::Arm64),
            "" => anyhow::bail!("empty architecture string"),
            other => anyhow::bail!("unsupported neo4j architecture {:?}", other),
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Amd64 => "amd64",
            Self::Arm64 => "arm64",
        }
    }
}

/// Helper binaries by architecture.
#[derive(Debug, Clone, Copy)]
pub struct WatchdogAssets {
    table: &'static [(&'static str, &'static [u8])],
}

impl WatchdogAssets {
    pub fn embedded() -> Self {
        Self {
            table: EMBEDDED_WATCHDOGS,
        }
    }

    #[cfg(test)]
    pub fn from_table(table: &'static [(&'static str, &'static [u8])]) -> Self {
        Self { table }
    }

    pub fn binary_for(&self, arch: Architecture) -> Result<&'static [u8]> {
        self.table
            .iter()
            .find(|(name, _)| *name == arch.as_str())
            .map(|(_, bytes)| *bytes)
            .with_context(|| format!("no embedded neo4j watchdog binary for linux/{}", arch.as_str()))
    }
}

#[derive(Debug, Clone, Copy)]
pub struct WatchdogTimings {
    pub ready_timeout: Duration,
    pub ready_poll: Duration,
    pub stop_timeout: Duration,
    pub stop_poll: Duration,
}

impl Default for WatchdogTimings {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(5),
            ready_poll: Duration::from_millis(250),
            stop_timeout: Duration::from_secs(120),
            stop_poll: Duration::from_secs(1),
        }
    }
}

pub struct ProcessController<'a> {
    backend: &'a dyn ExecutionBackend,
    service: &'a str,
    assets: WatchdogAssets,
    timings: WatchdogTimings,
}

impl<'a> ProcessController<'a> {
    pub fn new(
        backend: &'a dyn ExecutionBackend,
        service: &'a str,
        assets: WatchdogAssets,
        timings: WatchdogTimings,
    ) -> Self {
        Self {
            backend,
            service,
            assets,
            timings,
        }
    }

    fn exec(&self, command: &[&str]) -> Result<String> {
        self.backend
            .exec(self.service, &argv(command), &ExecOptions::default())
    }

    /// Reads and validates the database process id.
    pub fn read_pid(&self) -> Result<u32> {
        let output = self
            .exec(&["cat", NEO4J_PID_FILE])
            .context("Failed to read neo4j pid file")?;
        let pid = output.trim();
        pid.parse::<u32>()
            .map_err(|_| OpsError::InvalidPid(pid.to_string()).into())
    }

    pub fn architecture(&self) -> Result<Architecture> {
        let output = self
            .exec(&["uname", "-m"])
            .context("Failed to detect neo4j architecture")?;
        Architecture::from_uname(&output)
    }

    /// Deploys the helper, launches it and waits for its readiness marker.
    fn start_watchdog(&self) -> Result<()> {
        self.exec(&["mkdir", "-p", REMOTE_WORK_DIR])
            .context("Failed to prepare neo4j working directory")?;

        let arch = self.architecture()?;
        let binary = self.assets.binary_for(arch)?;

        let mut staged = NamedTempFile::new().context("Failed to stage watchdog binary")?;
        staged.write_all(binary)?;
        staged.flush()?;
        self.backend
            .copy_to(self.service, staged.path(), WATCHDOG_BINARY)
            .context("Failed to copy watchdog binary into the database container")?;
        self.exec(&["chmod", "+x", WATCHDOG_BINARY])
            .context("Failed to make watchdog binary executable")?;

        if let Err(err) = self.exec(&["rm", "-f", WATCHDOG_READY_FILE, WATCHDOG_LOG_FILE]) {
            debug!("could not clear stale watchdog markers: {err:#}");
        }

        let launch = format!(
            "nohup {} --ready-file {} >{} 2>&1 &",
            shell_quote(WATCHDOG_BINARY),
            shell_quote(WATCHDOG_READY_FILE),
            shell_quote(WATCHDOG_LOG_FILE)
        );
        self.exec(&["sh", "-c", &launch])
            .context("Failed to launch neo4j watchdog")?;

        self.wait_for_ready()
    }

    fn wait_for_ready(&self) -> Result<()> {
        let deadline = Instant::now() + self.timings.ready_timeout;
        loop {
            if self.exec(&["test", "-f", WATCHDOG_READY_FILE]).is_ok() {
                debug!("neo4j watchdog is ready");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OpsError::Timeout {
                    what: "neo4j watchdog readiness".to_string(),
                    after: self.timings.ready_timeout,
                }
                .into());
            }
            thread::sleep(self.timings.ready_poll);
        }
    }

    fn wait_until_stopped(&self, pid: u32) -> Result<()> {
        let probe = format!("cat /proc/{pid}/stat 2>/dev/null || echo gone");
        let deadline = Instant::now() + self.timings.stop_timeout;
        loop {
            let stat = self
                .exec(&["sh", "-c", &probe])
                .context("Failed to inspect neo4j process state")?;
            if is_stopped(&stat) {
                info!(pid, "Neo4j process stopped");
                return Ok(());
            }
            if Instant::now() >= deadline {
                return Err(OpsError::Timeout {
                    what: format!("neo4j process {pid} to stop"),
                    after: self.timings.stop_timeout,
                }
                .into());
            }
            thread::sleep(self.timings.stop_poll);
        }
    }

    fn remove_artifacts(&self) {
        if let Err(err) = self.exec(&["rm", "-f", WATCHDOG_BINARY, WATCHDOG_READY_FILE, WATCHDOG_LOG_FILE]) {
            warn!("Failed to remove neo4j watchdog files: {err:#}");
        }
    }

    /// Sends the continue signal, then removes the helper files.
    pub fn resume(&self, pid: u32) -> Result<()> {
        let resumed = self
            .exec(&["kill", "-CONT", &pid.to_string()])
            .with_context(|| format!("Failed to resume neo4j process {pid}"));
        self.remove_artifacts();
        resumed.map(|_| ())
    }

    /// Runs `body` with the database process stopped.
    ///
    /// If the helper never becomes ready the process is not touched. Once the stop
    /// signal has been attempted, `resume` always runs; its failure is returned
    /// only when `body` succeeded.
    pub fn while_paused<T, F>(&self, body: F) -> Result<T>
    where
        F: FnOnce() -> Result<T>,
    {
        let pid = self.read_pid()?;
        info!(pid, "Stopping Neo4j process for offline operation");

        if let Err(err) = self.start_watchdog() {
            self.remove_artifacts();
            return Err(err.context("neo4j watchdog did not start; neo4j was left running"));
        }

        with_release(
            || {
                self.exec(&["kill", &pid.to_string()])
                    .with_context(|| format!("Failed to stop neo4j process {pid}"))?;
                self.wait_until_stopped(pid)?;
                body()
            },
            || self.resume(pid),
        )
    }
}

/// A `/proc/<pid>/stat` line in stopped, traced or zombie state, or a vanished process.
fn is_stopped(stat: &str) -> bool {
    let stat = stat.trim();
    if stat.is_empty() || stat == "gone" {
        return true;
    }
    // The command name may contain spaces and parentheses; the state follows the last ')'.
    let state = stat
        .rfind(')')
        .and_then(|idx| stat[idx + 1..].split_whitespace().next());
    matches!(state, Some("T" | "t" | "Z" | "X"))
}
