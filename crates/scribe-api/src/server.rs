//! Server bootstrap

use std::net::SocketAddr;
use tracing::info;

use scribe_core::{Config, Janitor};

use crate::routes::create_router;
use crate::state::AppState;

/// Run the API server (and an in-process janitor) until shutdown
pub async fn run(config: Config) -> scribe_core::Result<()> {
    let state = AppState::from_config(config).await?;
    run_with_state(state).await
}

/// Run over pre-built state; lets tests inject their own backing
pub async fn run_with_state(state: AppState) -> scribe_core::Result<()> {
    let config = state.config.clone();
    let addr = SocketAddr::from((
        config
            .server
            .host
            .parse::<std::net::IpAddr>()
            .map_err(|e| scribe_core::Error::Config(format!("invalid host: {}", e)))?,
        config.server.port,
    ));

    // The janitor's duties are idempotent, so one per API process is fine
    // even when several instances run side by side
    let janitor = Janitor::new(
        state.registry.clone(),
        state.queue.clone(),
        state.blob.clone(),
        config.janitor.clone(),
        config.registry.clone(),
    );
    tokio::spawn(async move { janitor.run().await });

    let app = create_router(state);

    info!("scribe API listening on http://{}", addr);
    log_routes();

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| scribe_core::Error::Internal(format!("failed to bind {}: {}", addr, e)))?;

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await
    .map_err(|e| scribe_core::Error::Internal(format!("server error: {}", e)))?;

    Ok(())
}

fn log_routes() {
    info!("  POST   /transcribe       - submit audio");
    info!("  GET    /status/:job_id   - job status");
    info!("  GET    /result/:job_id   - transcript");
    info!("  DELETE /job/:job_id      - cancel job");
    info!("  GET    /health           - health aggregate");
    info!("  GET    /metrics          - metrics exposition");
    info!("  GET    /stats            - queue statistics");
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
    }
    info!("shutdown signal received");
}
