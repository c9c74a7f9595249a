use anyhow::Result;
use tokio_util::sync::CancellationToken;
use tracing::info;
use tracing_subscriber::EnvFilter;

mod config;
mod orchestrator;
mod server;
mod watch;

use config::{ControllerConfig, LogFormat};
use orchestrator::Orchestrator;

fn tracing_init(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt().with_env_filter(filter);
    match format {
        LogFormat::Json => builder.json().init(),
        LogFormat::Text => builder.init(),
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let config = ControllerConfig::load()?;
    tracing_init(config.log_format);

    info!("Starting fleet-controller...");

    let stop = CancellationToken::new();
    let shutdown = stop.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("Shutdown signal received, stopping...");
        }
        shutdown.cancel();
    });

    Orchestrator::new(config).start(stop).await
}
