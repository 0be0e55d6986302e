use anyhow::{anyhow, Context, Result};
use clap::Parser;
use molt::RestartableListener;
use std::sync::Arc;
use tracing::info;

mod config;
mod server;
mod telemetry;

use config::Cli;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    telemetry::init(cli.log_format).map_err(|e| anyhow!("failed to initialize logging: {e}"))?;

    info!("molt-echo starting...");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(pid = std::process::id(), daemon = cli.daemon, "Process started");

    let listener = RestartableListener::bind(&cli.addr, cli.restart_config())
        .await
        .with_context(|| format!("failed to listen on {}", cli.addr))?;

    info!(
        addr = %listener.local_addr(),
        inherited = listener.is_inherited(),
        "Listener ready"
    );

    let listener = Arc::new(listener);
    server::serve(Arc::clone(&listener)).await;

    // Exits from inside the restart loop once draining completes.
    listener.wait_exited().await;
    info!("molt-echo stopped");

    Ok(())
}
