//! Detector Host (cmon-dh) - Main entry point
//!
//! Operator CLI around [`DetectorService`]: run the host, manage detector
//! packages and push frame pairs through the enabled detectors.

use std::path::PathBuf;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use cmon_common::events::CmonEvent;
use cmon_dh::config::{HostConfig, SERVICE_NAME};
use cmon_dh::DetectorService;
use tokio::signal;
use tokio::sync::broadcast::error::RecvError;
use tracing::{debug, info, warn};

/// Command-line arguments for cmon-dh
#[derive(Parser, Debug)]
#[command(name = "cmon-dh")]
#[command(about = "Detector host for the continuity monitor")]
#[command(version)]
struct Args {
    /// Root folder for the registry, packages and communication directories
    #[arg(short, long, env = "CMON_ROOT_FOLDER")]
    root_folder: Option<PathBuf>,

    /// Bootstrap TOML file
    #[arg(short, long, env = "CMON_DH_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start enabled detectors and run until interrupted
    Serve,
    /// Install or upgrade a detector package
    Install {
        archive: PathBuf,
        /// Reinstall even if the version is not newer
        #[arg(long)]
        force: bool,
    },
    /// Remove a detector, its images and its files
    Uninstall { name: String },
    /// List installed detectors
    List,
    /// Show one detector's runtime status
    Status { name: String },
    /// Analyse frame pairs with every enabled detector and print the error groups
    Process {
        #[arg(long)]
        reference_take: i64,
        #[arg(long)]
        current_take: i64,
        /// Frame ids, comma separated
        #[arg(long, value_delimiter = ',', required = true)]
        frames: Vec<i64>,
        /// Include results flagged as false positives
        #[arg(long)]
        include_false_positives: bool,
    },
}

fn load_config(args: &Args) -> Result<HostConfig> {
    let path = args
        .config
        .clone()
        .or_else(|| cmon_common::config::default_config_path(SERVICE_NAME).filter(|p| p.exists()));
    match path {
        Some(path) => HostConfig::load(&path).with_context(|| format!("Failed to load {}", path.display())),
        None => Ok(HostConfig::default()),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    let config = load_config(&args)?;
    cmon_common::logging::init_logging(&config.logging).context("Failed to initialise logging")?;

    let paths = config.resolve_paths(args.root_folder.clone());
    info!("Starting cmon-dh, root folder {}", paths.root.display());

    let service = DetectorService::connect(config, paths)
        .await
        .context("Failed to initialise detector service")?;

    let outcome = run(&service, args.command).await;
    service.shutdown().await;
    outcome
}

async fn run(service: &DetectorService, command: Command) -> Result<()> {
    match command {
        Command::Serve => {
            spawn_event_log(service);
            match service.start_enabled().await {
                Ok(started) => info!(started = started.len(), "Enabled detectors started"),
                Err(e) => warn!(error = %e, "Enabled detectors not started"),
            }
            shutdown_signal().await;
        }
        Command::Install { archive, force } => {
            let outcome = service
                .install_detector(&archive, force)
                .await
                .with_context(|| format!("Failed to install {}", archive.display()))?;
            println!("{}", outcome.message);
            if let Some(backup) = outcome.backup {
                println!("Previous version backed up to {}", backup.display());
            }
        }
        Command::Uninstall { name } => {
            let report = service
                .uninstall_detector(&name)
                .await
                .with_context(|| format!("Failed to uninstall {}", name))?;
            println!("Detector '{}' uninstalled", report.name);
            for warning in report.warnings {
                println!("warning: {}", warning);
            }
        }
        Command::List => {
            let detectors = service.list_detectors().await?;
            println!("{}", serde_json::to_string_pretty(&detectors)?);
        }
        Command::Status { name } => {
            let status = service.get_detector_status(&name).await?;
            println!("{}", serde_json::to_string_pretty(&status)?);
        }
        Command::Process {
            reference_take,
            current_take,
            frames,
            include_false_positives,
        } => {
            let started = service.start_enabled().await?;
            info!(detectors = ?started, frames = frames.len(), "Processing frame pairs");

            let mut tickets = Vec::new();
            for frame_id in frames {
                for submission in service
                    .process_frame_pair(reference_take, current_take, frame_id)
                    .await?
                {
                    tickets.push(submission.ticket);
                }
            }
            futures::future::join_all(tickets.into_iter().map(|ticket| ticket.wait())).await;

            let groups = service.group_results(current_take, include_false_positives).await;
            println!("{}", serde_json::to_string_pretty(groups.as_ref())?);
        }
    }
    Ok(())
}

/// Log every host event at debug level
fn spawn_event_log(service: &DetectorService) {
    let mut events = service.events().subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(CmonEvent::DetectorStateChanged {
                    name,
                    old_state,
                    new_state,
                    reason,
                    ..
                }) => info!(detector = %name, from = %old_state, to = %new_state, reason = ?reason, "Detector state changed"),
                Ok(event) => debug!(event = event.event_type(), "Host event"),
                Err(RecvError::Lagged(missed)) => warn!(missed, "Event log lagged"),
                Err(RecvError::Closed) => break,
            }
        }
    });
}

/// Graceful shutdown signal handler
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down");
        },
    }
}
