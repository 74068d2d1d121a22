//! # switchboard
//!
//! Switchboard server binary: loads settings, wires the connection manager
//! and serves until SIGINT/SIGTERM, then drains.

#![deny(unsafe_code)]

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use switchboard_auth::CredentialValidator;
use switchboard_server::metrics::install_recorder;
use switchboard_server::shutdown::ShutdownCoordinator;
use switchboard_server::{
    Collaborators, ConnectionManager, InMemoryDirectory, ServerConfig, SwitchboardServer,
};
use switchboard_settings::SwitchboardSettings;

/// Slack on top of the drain windows before giving up on the HTTP task.
const STOP_SLACK: Duration = Duration::from_secs(1);

/// Switchboard real-time connection manager.
#[derive(Parser, Debug)]
#[command(name = "switchboard", about = "Real-time connection and session manager")]
struct Cli {
    /// Host to bind (overrides settings).
    #[arg(long)]
    host: Option<String>,

    /// Port to bind, 0 for auto-assign (overrides settings).
    #[arg(long)]
    port: Option<u16>,

    /// Settings file (defaults to `~/.switchboard/settings.json`).
    #[arg(long)]
    settings: Option<PathBuf>,

    /// Log filter directive (overrides settings).
    #[arg(long)]
    log_level: Option<String>,
}

impl Cli {
    fn load_settings(&self) -> Result<SwitchboardSettings> {
        let mut settings = match &self.settings {
            Some(path) => switchboard_settings::load_settings_from_path(path)
                .with_context(|| format!("Failed to load settings from {}", path.display()))?,
            None => switchboard_settings::load_settings().context("Failed to load settings")?,
        };
        self.apply_overrides(&mut settings);
        settings.validate().context("Invalid settings")?;
        Ok(settings)
    }

    fn apply_overrides(&self, settings: &mut SwitchboardSettings) {
        if let Some(host) = &self.host {
            settings.server.host.clone_from(host);
        }
        if let Some(port) = self.port {
            settings.server.port = port;
        }
        if let Some(level) = &self.log_level {
            settings.logging.level.clone_from(level);
        }
    }
}

/// Resolves with the name of the signal that asked us to stop.
async fn shutdown_signal() -> Result<&'static str> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{SignalKind, signal};

        let mut term =
            signal(SignalKind::terminate()).context("Failed to listen for SIGTERM")?;
        tokio::select! {
            res = tokio::signal::ctrl_c() => {
                res.context("Failed to listen for ctrl-c")?;
                Ok("SIGINT")
            }
            _ = term.recv() => Ok("SIGTERM"),
        }
    }
    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c()
            .await
            .context("Failed to listen for ctrl-c")?;
        Ok("SIGINT")
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Cli::parse();
    let settings = args.load_settings()?;

    if settings.logging.json {
        switchboard_core::logging::init_json_subscriber(&settings.logging.level);
    } else {
        switchboard_core::logging::init_subscriber(&settings.logging.level);
    }

    let metrics = install_recorder().context("Failed to install metrics recorder")?;
    let validator = CredentialValidator::from_settings(&settings.auth)
        .context("Failed to configure credential validation")?;
    let config = ServerConfig::from_settings(&settings);
    let stop_budget = config.grace_period + config.close_flush + STOP_SLACK;

    // Standalone mode: conversations, roles and messages live in memory.
    let directory = Arc::new(InMemoryDirectory::new());
    let manager = Arc::new(ConnectionManager::new(
        config,
        validator,
        Collaborators::from_directory(directory),
    ));

    let server = SwitchboardServer::new(manager.clone(), metrics);
    let (addr, handle) = server
        .listen()
        .await
        .context("Failed to bind listener")?;
    tracing::info!("switchboard listening on ws://{addr}/ws");

    let signal = shutdown_signal().await?;
    tracing::info!(signal, "shutting down");
    if let Some(report) = manager.drain(signal).await {
        tracing::info!(
            notified = report.notified,
            closed = report.closed,
            force_released = report.force_released,
            "drain complete"
        );
    }
    ShutdownCoordinator::await_tasks(vec![handle], stop_budget).await;

    tracing::info!("shutdown complete");
    Ok(())
}
