use conduit_infra::config::ConduitConfig;
use conduit_observability::Metrics;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    conduit_observability::init();
    Metrics::init()?;

    let config = ConduitConfig::from_env()?;

    let admin_token = config.admin_token.clone().unwrap_or_else(|| {
        tracing::warn!("ADMIN_TOKEN not set; using insecure dev default");
        "dev-admin-token".to_string()
    });

    let runtime = conduit_api::app::build_runtime(&config).await?;
    let reclaim = runtime.reclaim;
    let app = conduit_api::app::build_app(runtime.services, admin_token);
    let workers = runtime.orchestrator.spawn(config.workers);

    let listener = tokio::net::TcpListener::bind(config.admin_addr).await?;
    tracing::info!(addr = %listener.local_addr()?, workers = config.workers, "listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Nothing drains reclaimed deliveries once the workers stop reading.
    reclaim.stop();
    let aborted = workers.shutdown().await;
    tracing::info!(aborted, "shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to listen for shutdown signal");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutdown signal received");
}
