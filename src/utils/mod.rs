pub mod cleanup;
pub mod command;

use anyhow::Result;
use std::path::PathBuf;
use which::which;

/// Orchestrator CLIs the tool can drive; at least one must be installed.
pub const ORCHESTRATOR_CLIS: &[&str] = &["docker", "kubectl"];

/// Finds the installed orchestrator CLIs in the system PATH.
pub fn find_orchestrator_clis() -> Result<Vec<(String, PathBuf)>> {
    let found: Vec<(String, PathBuf)> = ORCHESTRATOR_CLIS
        .iter()
        .filter_map(|name| which(name).ok().map(|path| (name.to_string(), path)))
        .collect();
    if found.is_empty() {
        anyhow::bail!(
            "neither docker nor kubectl found in PATH. Please install the CLI of the orchestrator running Infrahub."
        );
    }
    Ok(found)
}

/// Formats a byte count with binary units, e.g. `1.5 MiB`.
pub fn format_bytes(bytes: u64) -> String {
    const UNITS: [&str; 6] = ["B", "KiB", "MiB", "GiB", "TiB", "PiB"];
    if bytes < 1024 {
        return format!("{} B", bytes);
    }
    let mut value = bytes as f64;
    let mut unit = 0;
    while value >= 1024.0 && unit < UNITS.len() - 1 {
        value /= 1024.0;
        unit += 1;
    }
    format!("{:.1} {}", value, UNITS[unit])
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn formats_sizes() {
        assert_eq!(format_bytes(512), "512 B");
        assert_eq!(format_bytes(1536), "1.5 KiB");
        assert_eq!(format_bytes(5 * 1024 * 1024), "5.0 MiB");
    }
}
