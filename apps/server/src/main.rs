mod api;
mod config;
mod error;
mod main_lib;

use config::ServerConfig;

const DEFAULT_LOG_FILTER: &str =
    "eventsync_server=info,eventsync_core=info,eventsync_storage_sqlite=info,eventsync_connect=info";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // `init` also bridges `log` records from the library crates.
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let config = ServerConfig::from_env()?;
    tracing::info!("Starting eventsync-server with config: {:?}", config);

    let state = main_lib::build_state(&config).await?;
    let router = api::app_router(state.clone());

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    tracing::info!("eventsync-server listening on {}", config.bind_addr);
    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    state.engine.shutdown().await;
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", err);
        std::future::pending::<()>().await;
    }
    tracing::info!("Shutdown signal received");
}
