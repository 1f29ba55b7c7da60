mod cli;
mod telemetry;

use anyhow::{Context, Result};
use clap::Parser;
use signal_relay::config::ServerConfig;
use signal_relay::registry::Registry;
use signal_relay::server;
use tokio::signal;
use tracing::info;

use crate::cli::{Cli, Commands};

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    match cli.command {
        Some(Commands::Watch { url, id }) => {
            telemetry::init_tracing("warn")?;
            cli::run_watch(url, id).await
        }
        Some(Commands::Send {
            url,
            from,
            to,
            kind,
            payload,
        }) => {
            telemetry::init_tracing("warn")?;
            cli::run_send(url, from, to, kind, payload).await
        }
        Some(Commands::Serve) | None => {
            let telemetry = telemetry::Telemetry::init()?;
            let config = ServerConfig::try_from(cli.server)?;
            run(config, telemetry).await
        }
    }
}

async fn run(config: ServerConfig, telemetry: telemetry::Telemetry) -> Result<()> {
    info!(
        listen_addr = %config.listen_addr,
        write_timeout_ms = config.session.write_timeout.as_millis() as u64,
        static_dir = ?config.static_dir,
        "starting signal-relay"
    );

    let registry = Registry::new();
    let app = server::build_router(&config, registry, Some(telemetry.metrics_handle()));
    let listener = tokio::net::TcpListener::bind(config.listen_addr)
        .await
        .context("failed to bind listener")?;

    server::serve(listener, app, shutdown_signal()).await?;

    info!(
        grace_seconds = config.shutdown_grace.as_secs(),
        "shutdown signal received; sleeping for graceful period"
    );
    tokio::time::sleep(config.shutdown_grace).await;
    info!("graceful shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    let _ = signal::ctrl_c().await;
}
