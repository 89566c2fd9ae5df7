//! Infrahub Backup/Restore Tool
//!
//! Provides a CLI for backing up and restoring Infrahub deployments running on
//! Docker Compose or Kubernetes.

// infrahub-backup/src/main.rs
mod backend;
mod backup;
mod config;
mod edition;
mod errors;
mod integrity;
mod ops;
mod restore;
mod utils;
mod watchdog;

use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use tracing::{debug, error, info};
use tracing_subscriber::EnvFilter;

use backup::{BackupOptions, s3_upload};
use config::{Configuration, LogFormat};
use errors::OpsError;
use ops::BackupOrchestrator;
use restore::RestoreOptions;
use utils::command::CommandExecutor;

#[derive(Parser, Debug)]
#[command(name = "infrahub-backup", version, about = "Backup and restore Infrahub deployments")]
struct Cli {
    /// JSON configuration file.
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Docker Compose project to target.
    #[arg(long, global = true)]
    project: Option<String>,

    /// Kubernetes namespace to target.
    #[arg(long = "k8s-namespace", global = true)]
    k8s_namespace: Option<String>,

    /// Directory that receives backup archives.
    #[arg(long, global = true)]
    backup_dir: Option<PathBuf>,

    #[arg(long, global = true, value_enum)]
    log_format: Option<LogFormat>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Create a backup archive of the running deployment.
    Create(CreateArgs),
    /// Restore a deployment from a backup archive.
    Restore(RestoreArgs),
    /// Inspect the deployments reachable from this machine.
    Environment {
        #[command(subcommand)]
        action: EnvironmentAction,
    },
}

#[derive(Args, Debug)]
struct CreateArgs {
    /// Do not wait for running tasks to finish.
    #[arg(long)]
    force: bool,

    /// Leave the task manager database out of the backup.
    #[arg(long)]
    exclude_task_manager: bool,

    /// Upload the archive to S3-compatible storage once written.
    #[arg(long)]
    s3_upload: bool,

    /// Metadata captured by the enterprise online backup.
    #[arg(long, default_value = "all")]
    neo4j_metadata: String,
}

#[derive(Args, Debug)]
struct RestoreArgs {
    /// Backup archive to restore.
    file: PathBuf,

    /// Do not restore the task manager database.
    #[arg(long)]
    exclude_task_manager: bool,

    /// Migrate the restored Neo4j store to the block format.
    #[arg(long)]
    restore_migrate_format: bool,
}

#[derive(Subcommand, Debug)]
enum EnvironmentAction {
    /// Detect the deployment this tool would target.
    Detect,
    /// List every deployment found on Docker and Kubernetes.
    List,
}

/// Main entry point for the backup/restore tool
fn main() -> ExitCode {
    let cli = Cli::parse();

    let config = match build_config(&cli) {
        Ok(config) => config,
        Err(e) => {
            eprintln!("❌ Error: {:?}", e);
            return ExitCode::FAILURE;
        }
    };
    init_tracing(config.log_format);

    match run_app(cli.command, &config) {
        Ok(_) => {
            println!("✅ Operation completed successfully.");
            ExitCode::SUCCESS
        }
        Err(e) => {
            error!("{e:#}");
            eprintln!("❌ Error: {:?}", e);
            ExitCode::FAILURE
        }
    }
}

/// Defaults, then the JSON file and environment, then CLI flags.
fn build_config(cli: &Cli) -> Result<Configuration> {
    let mut config = Configuration::load(cli.config.as_deref())?;
    if let Some(project) = &cli.project {
        config.compose_project = Some(project.clone());
    }
    if let Some(namespace) = &cli.k8s_namespace {
        config.k8s_namespace = Some(namespace.clone());
    }
    if let Some(dir) = &cli.backup_dir {
        config.backup_dir = dir.clone();
    }
    if let Some(format) = cli.log_format {
        config.log_format = format;
    }
    Ok(config)
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_writer(std::io::stderr);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

fn run_app(command: Command, config: &Configuration) -> Result<()> {
    match command {
        Command::Create(args) => {
            info!("🚀 Starting Backup Process...");
            let backend = ops::connect(config)?;
            let orchestrator = BackupOrchestrator::new(config, backend.as_ref());
            let opts = BackupOptions {
                force: args.force,
                exclude_task_manager: args.exclude_task_manager,
                neo4j_metadata: args.neo4j_metadata,
            };
            let mut report = orchestrator
                .create_backup(&opts)
                .context("Backup process failed")?;

            let mut upload_error = None;
            if args.s3_upload || config.s3_upload {
                if let Err(err) = upload_archive(config, &report.archive) {
                    error!("S3 upload failed; local backup kept at {}", report.archive.display());
                    upload_error = Some(err);
                }
            }

            // Service restoration is reported first; the archive itself is valid either way.
            report.services_restored()?;
            if let Some(err) = upload_error {
                return Err(err);
            }
            info!("Backup available at {}", report.archive.display());
        }
        Command::Restore(args) => {
            info!("🔄 Starting Restore Process...");
            let backend = ops::connect(config)?;
            let orchestrator = BackupOrchestrator::new(config, backend.as_ref());
            let opts = RestoreOptions {
                exclude_task_manager: args.exclude_task_manager,
                migrate_format: args.restore_migrate_format,
            };
            orchestrator
                .restore_backup(&args.file, &opts)
                .context("Restore process failed")?;
        }
        Command::Environment { action } => match action {
            EnvironmentAction::Detect => {
                let backend = ops::connect(config)?;
                println!("{}: {}", backend.name(), backend.target());
            }
            EnvironmentAction::List => list_environments(),
        },
    }
    Ok(())
}

/// Uploads on a runtime of its own; the orchestrator itself is blocking.
fn upload_archive(config: &Configuration, archive: &Path) -> Result<()> {
    let runtime = tokio::runtime::Runtime::new().context("Failed to start async runtime for S3 upload")?;
    runtime
        .block_on(s3_upload::upload_backup(&config.s3_storage, archive))
        .context(OpsError::UploadFailed {
            archive: archive.to_path_buf(),
        })
        .map(|_| ())
}

/// Prints every reachable deployment; one orchestrator failing does not hide the other.
fn list_environments() {
    let runner = CommandExecutor::new();
    match backend::compose::list_compose_projects(&runner) {
        Ok(projects) if !projects.is_empty() => {
            println!("Docker Compose projects:");
            for project in projects {
                println!("  {}", project);
            }
        }
        Ok(_) => println!("No Docker Compose projects found"),
        Err(err) => debug!("docker listing failed: {err:#}"),
    }
    match backend::kubernetes::list_kubernetes_namespaces(&runner) {
        Ok(namespaces) if !namespaces.is_empty() => {
            println!("Kubernetes namespaces:");
            for namespace in namespaces {
                println!("  {}", namespace);
            }
        }
        Ok(_) => println!("No Kubernetes namespaces found"),
        Err(err) => debug!("kubectl listing failed: {err:#}"),
    }
}
