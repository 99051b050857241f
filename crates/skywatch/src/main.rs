use std::path::PathBuf;

use anyhow::Result;
use clap::Parser;
use tokio::sync::broadcast;
use tracing::info;

use skywatch::{telemetry, Server};

#[derive(Parser, Debug)]
#[command(name = "skywatch", about = "Central arbiter for the Skywatch observatory control plane")]
struct Args {
    /// Config file (overrides the discovered local file)
    #[arg(long)]
    config: Option<PathBuf>,

    /// Listening port (overrides config)
    #[arg(long)]
    port: Option<u16>,

    /// Log filter, e.g. "debug" or "skywatch=debug,skycore=info"
    #[arg(long, env = "SKYWATCH_LOG_LEVEL")]
    log_level: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let (mut config, sources) = skyconf::load(args.config.as_deref())?;
    if let Some(port) = args.port {
        config.bind.port = port;
    }
    if let Some(level) = args.log_level {
        config.telemetry.log_level = level;
    }

    telemetry::init(&config.telemetry.log_level)?;
    for file in &sources.files {
        info!(file = %file.display(), "loaded config");
    }
    for var in &sources.env_overrides {
        info!(var, "config overridden from environment");
    }

    let (shutdown_tx, shutdown_rx) = broadcast::channel(1);
    tokio::spawn(async move {
        let _ = tokio::signal::ctrl_c().await;
        let _ = shutdown_tx.send(());
    });

    let port = config.bind.port;
    Server::new(config).run(port, shutdown_rx).await
}
