//! In-memory backend for orchestrator tests.
//!
//! Every call is journaled as one line and can be scripted by substring:
//! `service: program args` for exec, `copy_to service local remote`,
//! `copy_from service remote local`, `start a b` and `stop a b`.
//! Remote files live in a map keyed by service and absolute path.

use anyhow::{Context, Result};
use std::cell::RefCell;
use std::collections::{BTreeMap, BTreeSet};
use std::fs;
use std::path::Path;
use walkdir::WalkDir;

use super::{
    CACHE_SERVICE, DATABASE_SERVICE, ExecOptions, ExecutionBackend, MESSAGE_QUEUE_SERVICE,
    SERVER_SERVICE, TASK_MANAGER_DB_SERVICE, TASK_MANAGER_SERVICE, TASK_WORKER_SERVICE,
};
use crate::errors::OpsError;

pub(crate) struct FakeBackend {
    rules: Vec<(String, std::result::Result<String, String>)>,
    journal: RefCell<Vec<String>>,
    files: RefCell<BTreeMap<(String, String), Vec<u8>>>,
    running: RefCell<BTreeSet<String>>,
}

impl FakeBackend {
    pub(crate) fn new() -> Self {
        let running = [
            DATABASE_SERVICE,
            TASK_MANAGER_DB_SERVICE,
            TASK_MANAGER_SERVICE,
            SERVER_SERVICE,
            TASK_WORKER_SERVICE,
            CACHE_SERVICE,
            MESSAGE_QUEUE_SERVICE,
        ]
        .into_iter()
        .map(str::to_string)
        .collect();
        Self {
            rules: Vec::new(),
            journal: RefCell::new(Vec::new()),
            files: RefCell::new(BTreeMap::new()),
            running: RefCell::new(running),
        }
    }

    pub(crate) fn on(mut self, pattern: &str, output: &str) -> Self {
        self.rules.push((pattern.to_string(), Ok(output.to_string())));
        self
    }

    pub(crate) fn fail(mut self, pattern: &str, stderr: &str) -> Self {
        self.rules.push((pattern.to_string(), Err(stderr.to_string())));
        self
    }

    pub(crate) fn remote_file(self, service: &str, path: &str, contents: &[u8]) -> Self {
        self.files
            .borrow_mut()
            .insert((service.to_string(), path.to_string()), contents.to_vec());
        self
    }

    pub(crate) fn stopped(self, service: &str) -> Self {
        self.running.borrow_mut().remove(service);
        self
    }

    pub(crate) fn calls(&self) -> Vec<String> {
        self.journal.borrow().clone()
    }

    /// Index of the first journaled call containing `pattern`.
    pub(crate) fn position(&self, pattern: &str) -> Option<usize> {
        self.journal.borrow().iter().position(|c| c.contains(pattern))
    }

    pub(crate) fn called(&self, pattern: &str) -> bool {
        self.position(pattern).is_some()
    }

    pub(crate) fn remote(&self, service: &str, path: &str) -> Option<Vec<u8>> {
        self.files
            .borrow()
            .get(&(service.to_string(), path.to_string()))
            .cloned()
    }

    pub(crate) fn running_services(&self) -> BTreeSet<String> {
        self.running.borrow().clone()
    }

    fn answer(&self, line: String) -> Result<String> {
        self.journal.borrow_mut().push(line.clone());
        match self.rules.iter().find(|(pattern, _)| line.contains(pattern.as_str())) {
            Some((_, Ok(output))) => Ok(output.clone()),
            Some((_, Err(stderr))) => Err(OpsError::CommandFailed {
                program: "fake".to_string(),
                args: vec![line],
                status: "exit status: 1".to_string(),
                stdout: String::new(),
                stderr: stderr.clone(),
            }
            .into()),
            None => Ok(String::new()),
        }
    }

    fn exec_line(service: &str, command: &[String], opts: &ExecOptions) -> String {
        let mut line = format!("{}: {}", service, command.join(" "));
        if let Some(user) = &opts.user {
            line.push_str(&format!(" [user={}]", user));
        }
        for key in opts.env.keys() {
            line.push_str(&format!(" [env={}]", key));
        }
        line
    }
}

impl ExecutionBackend for FakeBackend {
    fn name(&self) -> &'static str {
        "fake"
    }

    fn target(&self) -> String {
        "test".to_string()
    }

    fn detect(&mut self) -> Result<()> {
        Ok(())
    }

    fn exec(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        self.answer(Self::exec_line(service, command, opts))
    }

    fn exec_stream(&self, service: &str, command: &[String], opts: &ExecOptions) -> Result<String> {
        self.answer(Self::exec_line(service, command, opts))
    }

    fn copy_to(&self, service: &str, local: &Path, remote: &str) -> Result<()> {
        self.answer(format!("copy_to {} {} {}", service, local.display(), remote))?;
        let mut files = self.files.borrow_mut();
        if local.is_file() {
            let contents = fs::read(local).with_context(|| format!("fake copy_to {}", local.display()))?;
            files.insert((service.to_string(), remote.to_string()), contents);
            return Ok(());
        }
        for entry in WalkDir::new(local) {
            let entry = entry?;
            if !entry.file_type().is_file() {
                continue;
            }
            let relative = entry.path().strip_prefix(local)?;
            let key = format!("{}/{}", remote.trim_end_matches('/'), relative.to_string_lossy());
            files.insert((service.to_string(), key), fs::read(entry.path())?);
        }
        Ok(())
    }

    fn copy_from(&self, service: &str, remote: &str, local: &Path) -> Result<()> {
        self.answer(format!("copy_from {} {} {}", service, remote, local.display()))?;
        let files = self.files.borrow();
        if let Some(contents) = files.get(&(service.to_string(), remote.to_string())) {
            let target = if local.is_dir() {
                let name = remote.rsplit('/').next().unwrap_or(remote);
                local.join(name)
            } else {
                local.to_path_buf()
            };
            fs::write(&target, contents)?;
            return Ok(());
        }

        let prefix = format!("{}/", remote.trim_end_matches('/'));
        let mut found = false;
        for ((owner, path), contents) in files.iter() {
            let Some(relative) = path.strip_prefix(&prefix) else {
                continue;
            };
            if owner != service {
                continue;
            }
            let target = local.join(relative);
            if let Some(parent) = target.parent() {
                fs::create_dir_all(parent)?;
            }
            fs::write(&target, contents)?;
            found = true;
        }
        if !found {
            anyhow::bail!("fake: no such remote path {}:{}", service, remote);
        }
        Ok(())
    }

    fn start(&self, services: &[&str]) -> Result<()> {
        self.answer(format!("start {}", services.join(" ")))?;
        let mut running = self.running.borrow_mut();
        for service in services {
            running.insert(service.to_string());
        }
        Ok(())
    }

    fn stop(&self, services: &[&str]) -> Result<()> {
        self.answer(format!("stop {}", services.join(" ")))?;
        let mut running = self.running.borrow_mut();
        for service in services {
            running.remove(*service);
        }
        Ok(())
    }

    fn is_running(&self, service: &str) -> Result<bool> {
        Ok(self.running.borrow().contains(service))
    }
}
