// Build script that embeds the Neo4j watchdog helper binaries found under assets/watchdog.
// Architectures without a binary are left out of the table and fail at runtime.

use std::env;
use std::fs;
use std::path::PathBuf;

const ARCHITECTURES: &[&str] = &["amd64", "arm64"];

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let manifest_dir = PathBuf::from(env::var("CARGO_MANIFEST_DIR")?);
    let asset_dir = manifest_dir.join("assets").join("watchdog");
    println!("cargo:rerun-if-changed={}", asset_dir.display());

    let mut embedded = 0;
    let mut table = String::from("pub(crate) static EMBEDDED_WATCHDOGS: &[(&str, &[u8])] = &[\n");
    for arch in ARCHITECTURES {
        let path = asset_dir.join(format!("neo4j-watchdog-linux-{arch}"));
        println!("cargo:rerun-if-changed={}", path.display());
        if path.is_file() {
            table.push_str(&format!("    ({arch:?}, include_bytes!({:?})),\n", path.display().to_string()));
            embedded += 1;
        } else {
            println!("cargo:warning=no Neo4j watchdog binary for {arch} at {}", path.display());
        }
    }
    if embedded == 0 {
        println!(
            "cargo:warning=no Neo4j watchdog binaries embedded; Community Edition backup and restore will fail at runtime"
        );
    }
    table.push_str("];\n");

    let out = PathBuf::from(env::var("OUT_DIR")?).join("watchdog_assets.rs");
    fs::write(out, table)?;
    Ok(())
}
