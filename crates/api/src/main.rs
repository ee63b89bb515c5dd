use anyhow::Context;
use tracing::{error, info};

use rewardflow_api::app::{self, services};
use rewardflow_infra::config::EngineConfig;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    rewardflow_observability::init();

    let config = EngineConfig::from_env().context("invalid configuration")?;
    let engine = services::build_engine(&config)
        .await
        .context("failed to build services")?;

    let worker = engine.worker.spawn();
    let reaper = engine.reaper.spawn();
    let app = app::build_app(engine.services);

    let listener = tokio::net::TcpListener::bind(&config.http_bind)
        .await
        .with_context(|| format!("failed to bind {}", config.http_bind))?;
    info!(addr = %listener.local_addr()?, worker = %config.worker_id, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("http server failed")?;

    info!("http server stopped, draining worker");
    worker.shutdown().await;
    reaper.shutdown().await;
    info!("shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}
