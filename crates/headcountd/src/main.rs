use anyhow::{Context, Result};
use std::sync::Arc;
use tracing_subscriber::EnvFilter;

mod config;
mod engine;
mod routes;
mod storage;

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    tracing::info!(version = env!("CARGO_PKG_VERSION"), "headcountd starting");

    let config = config::Config::load().context("failed to load configuration")?;
    tracing::info!(
        bind = %config.bind,
        backend = ?config.backend,
        model = %config.model_path.display(),
        upload_dir = %config.upload_dir.display(),
        persist_uploads = config.persist_uploads,
        "configuration loaded"
    );

    // Model loading and directory setup block; keep them off the runtime threads.
    let engine = {
        let config = config.clone();
        tokio::task::spawn_blocking(move || engine::spawn_engine(&config))
            .await
            .context("engine startup task panicked")?
            .context("failed to start detection engine")?
    };

    let state = Arc::new(routes::AppState {
        engine,
        body_limit: config.body_limit(),
    });
    let app = routes::router(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("failed to bind {}", config.bind))?;
    tracing::info!(addr = %listener.local_addr()?, "headcountd ready");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("headcountd shutting down");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::warn!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
}
