//! `ekosd`: start an equipment profile and keep it running until Ctrl-C

use anyhow::{Context, Result};
use clap::Parser;
use ekos_drivers::{DriverManager, DriverManagerConfig, IndiListener};
use ekos_manager::logging::init_tracing;
use ekos_manager::{EkosManager, ManagerConfig, ManagerEvent, ProfileInfo};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast::error::RecvError;

/// Start the INDI drivers of an equipment profile
#[derive(Parser, Debug)]
#[command(name = "ekosd")]
#[command(about = "Start the INDI drivers of an equipment profile and keep them running")]
#[command(version)]
struct Cli {
    /// Equipment profile (JSON)
    profile: PathBuf,

    /// Driver manager configuration (JSON)
    drivers: Option<PathBuf>,

    /// Ekos manager configuration (JSON)
    manager: Option<PathBuf>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing();

    let driver_config = match &cli.drivers {
        Some(path) => DriverManagerConfig::from_file(path)
            .with_context(|| format!("loading driver configuration {}", path.display()))?,
        None => DriverManagerConfig::default(),
    };
    let manager_config = match &cli.manager {
        Some(path) => ManagerConfig::from_file(path)?,
        None => ManagerConfig::default(),
    };
    let profile = ProfileInfo::from_file(&cli.profile)?;

    let listener = Arc::new(IndiListener::new());
    let drivers = DriverManager::new(driver_config, listener);
    let loaded = drivers
        .load_catalog()
        .await
        .context("loading driver catalog")?;
    tracing::info!("Loaded {} drivers", loaded);

    let manager = EkosManager::new(manager_config, drivers.clone());
    let mut events = manager.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(ManagerEvent::EkosStatusChanged(status)) => {
                    tracing::info!("Ekos status: {:?}", status);
                }
                Ok(ManagerEvent::IndiStatusChanged(status)) => {
                    tracing::info!("INDI status: {:?}", status);
                }
                Ok(ManagerEvent::NewLog(_)) | Err(RecvError::Lagged(_)) => {}
                Err(RecvError::Closed) => break,
            }
        }
    });

    tracing::info!("Starting profile {}", profile.name);
    manager
        .start(profile)
        .await
        .context("starting equipment profile")?;

    tokio::signal::ctrl_c()
        .await
        .context("waiting for shutdown signal")?;
    tracing::info!("Shutting down");

    manager.stop().await;
    drivers.clear_servers().await;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    #[test]
    fn test_cli_parser_builds() {
        Cli::command().debug_assert();
    }

    #[test]
    fn test_positional_paths() {
        let cli = Cli::parse_from(["ekosd", "simulators.json"]);
        assert_eq!(cli.profile, PathBuf::from("simulators.json"));
        assert!(cli.drivers.is_none());
        assert!(cli.manager.is_none());

        let cli = Cli::parse_from(["ekosd", "simulators.json", "drivers.json", "manager.json"]);
        assert_eq!(cli.drivers, Some(PathBuf::from("drivers.json")));
        assert_eq!(cli.manager, Some(PathBuf::from("manager.json")));
    }

    #[test]
    fn test_profile_is_required() {
        let err = Cli::try_parse_from(["ekosd"]).unwrap_err();
        assert_eq!(err.kind(), clap::error::ErrorKind::MissingRequiredArgument);
    }
}
