//! share-relay: rendezvous and fallback relay for ephemeral file sharing.

use anyhow::Result;
use clap::Parser;
use share_relay::config::{Args, RelayConfig};
use share_relay::relay::serve;
use share_relay::server::RelayServer;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    // Respects RUST_LOG, defaults to info (or debug with --verbose)
    let default_filter = if args.verbose {
        "debug,share_relay=debug,share_core=debug"
    } else {
        "info,share_relay=info"
    };
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let config = RelayConfig::from_args(&args)?;
    info!("Starting share-relay");
    info!(
        "Join window: default {}s, max {}s",
        config.default_join_window.as_secs(),
        config.max_join_window.as_secs()
    );

    let listener = RelayServer::bind(&config.listen).await?;

    serve(listener, config, async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    })
    .await?;

    info!("Shutting down");
    Ok(())
}
