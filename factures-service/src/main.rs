use factures_service::config::FacturesConfig;
use factures_service::services::init_metrics;
use factures_service::startup::Application;
use service_core::observability::init_tracing;

#[tokio::main]
async fn main() -> std::io::Result<()> {
    // Register collectors before anything records
    init_metrics();

    let config = FacturesConfig::load()
        .map_err(|e| std::io::Error::other(format!("Configuration error: {}", e)))?;

    init_tracing(
        &config.service_name,
        &config.log_level,
        config.otlp_endpoint.as_deref(),
    );

    tracing::info!(
        environment = %config.common.environment,
        store = ?config.store.backend,
        queue = ?config.queue.backend,
        "Starting factures-service"
    );

    let application = Application::build(config).await.map_err(|e| {
        tracing::error!("Failed to start: {}", e);
        std::io::Error::other(format!("Startup error: {}", e))
    })?;

    application.run_until_stopped().await?;

    tracing::info!("Server shutdown complete");
    Ok(())
}
