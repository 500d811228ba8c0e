use std::time::Duration;

use tracing::info;
use tracing_subscriber::EnvFilter;

use tether_server::{serve, AppState, ServerConfig};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("info,tether_server=debug")),
        )
        .init();

    info!("Starting tether file host v{}", env!("CARGO_PKG_VERSION"));

    let config = ServerConfig::from_env();
    info!(?config, "Loaded configuration");

    let state = AppState::new(config.clone()).await?;

    let limiter = state.rate_limiter.clone();
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(Duration::from_secs(300));
        loop {
            interval.tick().await;
            limiter.forget_idle(Duration::from_secs(600)).await;
        }
    });

    let listener = tokio::net::TcpListener::bind(config.http_addr).await?;

    tokio::select! {
        result = serve(listener, state) => {
            if let Err(e) = result {
                tracing::error!(error = %e, "HTTP server failed");
                return Err(e.into());
            }
        }
        _ = tokio::signal::ctrl_c() => {
            info!("Received Ctrl+C, shutting down");
        }
    }

    Ok(())
}
