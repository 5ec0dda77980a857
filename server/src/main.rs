use anyhow::Context;
use clap::Parser;
use std::{net::SocketAddr, path::PathBuf, sync::Arc};
use tracing::info;
use wheelspin_server::{Api, Config, Service};

#[derive(Parser, Debug)]
#[command(author, version, about, long_about = None)]
struct Args {
    /// Path to the YAML config file.
    #[arg(short, long)]
    config: PathBuf,

    /// Overrides the port in the config file.
    #[arg(short, long)]
    port: Option<u16>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Parse args
    let args = Args::parse();

    // Load config
    let config = Config::load(&args.config)
        .and_then(Config::validate)
        .with_context(|| format!("invalid config {}", args.config.display()))?;

    // Create logger
    if config.json_logs {
        tracing_subscriber::fmt()
            .json()
            .with_max_level(config.log_level)
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_max_level(config.log_level)
            .init();
    }

    let port = args.port.unwrap_or(config.port);
    let (per_second, burst) = (config.rate_limit_per_second, config.rate_limit_burst);
    let service = Service::build(config)
        .await
        .context("failed to open store")?;
    let app = Api::new(Arc::new(service))
        .with_rate_limit(per_second, burst)
        .router();

    // Start server
    let addr = format!("0.0.0.0:{port}");
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("failed to bind {addr}"))?;
    info!("Listening on {}", addr);
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .context("axum server error")?;

    Ok(())
}
