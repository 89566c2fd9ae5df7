// Local process execution for the orchestrator CLIs (docker, kubectl).
use anyhow::{Context, Result};
use regex::Regex;
use std::io::{BufRead, BufReader, Read};
use std::process::{Command, Stdio};
use std::sync::OnceLock;
use tracing::{debug, info, warn};

use crate::errors::OpsError;

/// Runs a local program and returns its captured stdout.
///
/// A non-zero exit becomes `OpsError::CommandFailed` carrying both output streams.
pub trait CommandRunner {
    fn run(&self, program: &str, args: &[String]) -> Result<String>;

    /// Like `run` but surfaces stdout line by line as it is produced.
    fn run_streaming(&self, program: &str, args: &[String]) -> Result<String>;

    fn run_quiet(&self, program: &str, args: &[String]) -> Result<()> {
        self.run(program, args).map(|_| ())
    }
}

#[derive(Debug, Default, Clone)]
pub struct CommandExecutor;

impl CommandExecutor {
    pub fn new() -> Self {
        Self
    }
}

impl CommandRunner for CommandExecutor {
    fn run(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program, args = ?redact_args(args), "running command");
        let output = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .output()
            .with_context(|| format!("Failed to execute {}", program))?;

        let stdout = String::from_utf8_lossy(&output.stdout).into_owned();
        if !output.status.success() {
            return Err(OpsError::CommandFailed {
                program: program.to_string(),
                args: redact_args(args),
                status: output.status.to_string(),
                stdout,
                stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
            }
            .into());
        }
        Ok(stdout)
    }

    fn run_streaming(&self, program: &str, args: &[String]) -> Result<String> {
        debug!(program, args = ?redact_args(args), "running streaming command");
        let mut child = Command::new(program)
            .args(args)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("Failed to execute {}", program))?;

        // stderr is drained on its own thread so a chatty child cannot block on a full pipe.
        let stderr_reader = child.stderr.take().map(|mut stderr| {
            std::thread::spawn(move || {
                let mut buf = String::new();
                if let Err(err) = stderr.read_to_string(&mut buf) {
                    warn!("Failed to read stderr: {}", err);
                }
                buf
            })
        });

        let mut collected = String::new();
        if let Some(stdout) = child.stdout.take() {
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        // Reap the child so a broken pipe does not leave it behind.
                        if let Err(kill_err) = child.kill() {
                            debug!("Failed to kill {}: {}", program, kill_err);
                        }
                        if let Err(wait_err) = child.wait() {
                            warn!("Failed to wait for {}: {}", program, wait_err);
                        }
                        return Err(err).with_context(|| format!("Failed to read output of {}", program));
                    }
                };
                info!(target: "remote", "{}", line);
                collected.push_str(&line);
                collected.push('\n');
            }
        }

        let status = child
            .wait()
            .with_context(|| format!("Failed to wait for {}", program))?;
        let stderr = stderr_reader
            .and_then(|handle| handle.join().ok())
            .unwrap_or_default();

        if !status.success() {
            return Err(OpsError::CommandFailed {
                program: program.to_string(),
                args: redact_args(args),
                status: status.to_string(),
                stdout: collected,
                stderr: stderr.trim().to_string(),
            }
            .into());
        }
        Ok(collected)
    }
}

/// Builds an owned argument vector from string slices.
pub fn argv(items: &[&str]) -> Vec<String> {
    items.iter().map(|s| s.to_string()).collect()
}

/// Splits command output into trimmed, non-empty lines.
pub fn non_empty_lines(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty())
        .map(str::to_string)
        .collect()
}

/// Masks credentials before arguments reach logs or error messages.
///
/// Covers `-p<secret>` (cypher-shell), `--password <secret>`, and `*PASSWORD=<secret>` assignments,
/// including inside `sh -c` scripts.
pub fn redact_args(args: &[String]) -> Vec<String> {
    static INLINE: OnceLock<Option<Regex>> = OnceLock::new();
    let inline = INLINE
        .get_or_init(|| Regex::new(r"(^|\s)(-p|--password[= ]|[A-Z_]*PASSWORD=)\S+").ok())
        .as_ref();

    let mut redacted = Vec::with_capacity(args.len());
    let mut mask_next = false;
    for arg in args {
        if mask_next {
            redacted.push("****".to_string());
            mask_next = false;
            continue;
        }
        if arg == "--password" {
            mask_next = true;
            redacted.push(arg.clone());
            continue;
        }
        let masked = match inline {
            Some(re) => re.replace_all(arg, "${1}${2}****").into_owned(),
            None => arg.clone(),
        };
        redacted.push(masked);
    }
    redacted
}

/// Quotes `arg` for a POSIX shell.
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || "-_./=:,@+".contains(c))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}
