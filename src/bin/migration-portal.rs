//! # Migration Portal CLI
//!
//! Runs a migration task in the foreground (`start`) and sends operator
//! commands to the controller serving it. Status is rendered from the task
//! workspace and works with or without a running controller.

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use migration_portal::config::{ConfigManager, ModeManager, PortalConfig};
use migration_portal::control::{send_command, ControlServer};
use migration_portal::logging::init_structured_logging;
use migration_portal::manager::MigrationManager;
use migration_portal::report::StatusReport;
use migration_portal::state_machine::OperatorCommand;
use migration_portal::workspace::TaskWorkspace;
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "migration-portal")]
#[command(about = "Orchestrates full, incremental and reverse database migrations")]
#[command(version = env!("CARGO_PKG_VERSION"))]
pub struct Cli {
    /// Configuration file (default: discovered under ./config)
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the task id from the configuration
    #[arg(short, long)]
    task_id: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Debug, Subcommand)]
pub enum Commands {
    /// Start the task and serve operator commands until it stops
    Start,
    /// Stop every phase and finish the task
    Stop,
    /// Show migration progress
    Status {
        /// Include the per-object list
        #[arg(short, long)]
        detail: bool,
    },
    /// Stop incremental migration and prepare reverse migration
    StopIncremental,
    /// Resume an interrupted incremental migration
    ResumeIncremental,
    /// Restart incremental migration
    RestartIncremental,
    /// Start reverse migration
    StartReverse,
    /// Stop reverse migration
    StopReverse,
    /// Resume an interrupted reverse migration
    ResumeReverse,
    /// Restart reverse migration
    RestartReverse,
    /// Migration mode management
    #[command(subcommand)]
    Mode(ModeCommands),
}

#[derive(Debug, Subcommand)]
pub enum ModeCommands {
    /// List built-in and custom modes
    List,
    /// Add a custom mode from a definition file
    Add {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Replace a custom mode with a definition file
    Update {
        #[arg(value_name = "FILE")]
        path: PathBuf,
    },
    /// Delete a custom mode
    Delete { name: String },
    /// Write a mode definition template
    Template {
        #[arg(value_name = "DIR", default_value = ".")]
        dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    init_structured_logging();

    let config_manager = match &cli.config {
        Some(path) => ConfigManager::load_from_file(path),
        None => ConfigManager::load(),
    }
    .context("failed to load configuration")?;
    let mut config = config_manager.config().clone();
    if let Some(task_id) = cli.task_id {
        config.migration.task_id = task_id;
    }

    match cli.command {
        Commands::Start => run_start(Arc::new(config)).await,
        Commands::Status { detail } => {
            let workspace = TaskWorkspace::new(&config.workspace.root, config.migration.task_id.clone());
            let report = StatusReport::new(workspace, config.migration.source_type).render(detail)?;
            println!("{report}");
            Ok(())
        }
        Commands::Mode(command) => run_mode(&config, command),
        Commands::Stop => forward(&config, OperatorCommand::Stop).await,
        Commands::StopIncremental => forward(&config, OperatorCommand::StopIncremental).await,
        Commands::ResumeIncremental => forward(&config, OperatorCommand::ResumeIncremental).await,
        Commands::RestartIncremental => forward(&config, OperatorCommand::RestartIncremental).await,
        Commands::StartReverse => forward(&config, OperatorCommand::StartReverse).await,
        Commands::StopReverse => forward(&config, OperatorCommand::StopReverse).await,
        Commands::ResumeReverse => forward(&config, OperatorCommand::ResumeReverse).await,
        Commands::RestartReverse => forward(&config, OperatorCommand::RestartReverse).await,
    }
}

async fn run_start(config: Arc<PortalConfig>) -> anyhow::Result<()> {
    let manager = MigrationManager::connect(config)?;
    let server = ControlServer::bind(Arc::clone(&manager)).await?;

    let starter = {
        let manager = Arc::clone(&manager);
        tokio::spawn(async move { manager.start().await })
    };

    tokio::select! {
        _ = manager.wait_stopped() => {}
        signal = tokio::signal::ctrl_c() => {
            if let Err(e) = signal {
                warn!(error = %e, "Failed to listen for interrupt");
            }
            info!("Interrupt received, stopping migration task");
            manager.stop().await;
        }
    }

    let started = starter.await.context("start sequence panicked")?;
    server.stop().await;
    println!("{}", manager.status(false)?);
    started?;
    Ok(())
}

async fn forward(config: &PortalConfig, command: OperatorCommand) -> anyhow::Result<()> {
    let workspace = TaskWorkspace::new(&config.workspace.root, config.migration.task_id.clone());
    let reply = send_command(&workspace, command).await?;
    println!("{}", reply.message);
    if !reply.success {
        bail!("{command} failed");
    }
    Ok(())
}

fn run_mode(config: &PortalConfig, command: ModeCommands) -> anyhow::Result<()> {
    let modes = ModeManager::new(&config.workspace.data_dir);
    match command {
        ModeCommands::List => {
            for mode in modes.list() {
                let phases: Vec<String> = mode.phases().iter().map(ToString::to_string).collect();
                println!("{}\t{}", mode.name, phases.join(","));
            }
        }
        ModeCommands::Add { path } => {
            let mode = modes.add(&path)?;
            println!("Migration mode {} added", mode.name);
        }
        ModeCommands::Update { path } => {
            let mode = modes.update(&path)?;
            println!("Migration mode {} updated", mode.name);
        }
        ModeCommands::Delete { name } => {
            modes.delete(&name)?;
            println!("Migration mode {name} deleted");
        }
        ModeCommands::Template { dir } => {
            let path = modes.template(&dir)?;
            println!("Template written to {}", path.display());
        }
    }
    Ok(())
}
