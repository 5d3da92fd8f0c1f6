use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use spoor::config::{self, Settings};
use spoor::regen::{Coordinator, Trigger};
use spoor::sidecar;
use spoor::snapshot::survey::ProjectSurvey;
use spoor::store::ExportFormat;

#[derive(Parser)]
#[command(name = "spoor", version, about = "Keeps a project's activity report current")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

/// Options shared by commands that read configuration.
#[derive(clap::Args)]
struct ProjectArgs {
    /// Project root
    #[arg(default_value = ".")]
    path: PathBuf,
    /// Configuration file (default: Spoor.toml in the project root)
    #[arg(long)]
    config: Option<PathBuf>,
    /// Configuration profile merged over the default profile
    #[arg(long)]
    profile: Option<String>,
}

#[derive(Subcommand)]
enum Command {
    /// Write a default Spoor.toml
    Init {
        /// Project root
        #[arg(default_value = ".")]
        path: PathBuf,
    },
    /// Update the report, then regenerate it whenever the project changes
    Watch {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Regenerate the report once
    Track {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Print the persisted report
    Report {
        #[command(flatten)]
        project: ProjectArgs,
    },
    /// Export the persisted report
    Export {
        #[command(flatten)]
        project: ProjectArgs,
        /// Export format: json or csv
        #[arg(long, default_value = "json")]
        format: ExportFormat,
    },
}

type CliResult = Result<(), Box<dyn std::error::Error>>;

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();
    let result = match cli.command {
        Command::Init { path } => config::init(&path).await.map_err(Into::into),
        Command::Watch { project } => watch(&project).await,
        Command::Track { project } => track(&project).await,
        Command::Report { project } => report(&project).await,
        Command::Export { project, format } => export(&project, format).await,
    };

    match result {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!("{}", e);
            ExitCode::FAILURE
        }
    }
}

async fn load(project: &ProjectArgs) -> Result<Settings, config::ConfigError> {
    config::load_settings(
        &project.path,
        project.config.as_deref(),
        project.profile.as_deref(),
    )
    .await
}

/// Runs a sidecar until interrupted.
async fn watch(project: &ProjectArgs) -> CliResult {
    let settings = load(project).await?;
    let (enabled, grace) = (settings.enabled, settings.grace);

    let Some(sidecar) =
        sidecar::start(project.path.clone(), settings, Arc::new(ProjectSurvey)).await
    else {
        return if enabled {
            Err("watcher failed to start".into())
        } else {
            Ok(())
        };
    };

    tracing::info!("Watcher started. Press Ctrl+C to stop.");
    tokio::signal::ctrl_c().await?;

    tracing::info!("Stopping...");
    sidecar.stop(grace).await;
    Ok(())
}

async fn track(project: &ProjectArgs) -> CliResult {
    let settings = load(project).await?;
    let store = settings.store(&project.path);

    tracing::info!("Tracking project at {}", project.path.display());
    let coordinator = Coordinator::new(&project.path, Arc::new(ProjectSurvey), store.clone());
    coordinator.run(Trigger::Manual).await?;

    tracing::info!("Report generated at {}", store.report_path().display());
    Ok(())
}

async fn report(project: &ProjectArgs) -> CliResult {
    let store = load(project).await?.store(&project.path);
    match store.load().await? {
        Some(snapshot) => print!("{}", serde_yaml::to_string(&snapshot)?),
        None => tracing::warn!("No report found at {}", store.report_path().display()),
    }
    Ok(())
}

async fn export(project: &ProjectArgs, format: ExportFormat) -> CliResult {
    let store = load(project).await?.store(&project.path);
    store.export(format).await?;
    Ok(())
}
