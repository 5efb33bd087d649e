//! CLI entry point for the encoder control plane
//!
//! Loads configuration, restores persisted state and serves the control API
//! until interrupted.

use clap::Parser;
use encoder_control::{run_server, Config, ControlPlane, DaemonError};
use std::path::PathBuf;
use std::process::ExitCode;
use std::sync::Arc;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

/// Control plane daemon for live encoders
#[derive(Parser, Debug)]
#[command(name = "encoder-controld")]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the configuration file (config.toml)
    #[arg(short, long, default_value = "config.toml")]
    config: PathBuf,

    /// Address to serve the control API on, overriding the configuration
    #[arg(short, long)]
    bind: Option<String>,
}

fn load_config(args: &Args) -> Result<Config, DaemonError> {
    let mut config = if args.config.exists() {
        Config::load(&args.config)?
    } else {
        tracing::warn!(
            path = %args.config.display(),
            "config file not found, using defaults"
        );
        Config::from_env()
    };

    if let Some(bind) = &args.bind {
        config.server.bind_address = bind.clone();
    }
    Ok(config)
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}

async fn run(args: Args) -> Result<(), DaemonError> {
    let config = load_config(&args)?;
    tracing::info!(
        bind_address = %config.server.bind_address,
        state_dir = ?config.storage.state_dir,
        "encoder control plane starting"
    );

    let plane = Arc::new(ControlPlane::new(config));
    plane.init().await?;

    let served = run_server(plane.clone(), shutdown_signal()).await;
    plane.shutdown().await;
    served?;
    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let args = Args::parse();

    match run(args).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            tracing::error!(error = %e, "encoder control plane failed");
            ExitCode::FAILURE
        }
    }
}
