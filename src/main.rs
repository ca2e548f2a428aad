use std::sync::Arc;

use pipeline_board::api::pipeline_routes;
use pipeline_board::config::ServerConfig;
use pipeline_board::store::{LibSqlBackend, PipelineStore};
use tower_http::cors::CorsLayer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ServerConfig::from_env();

    eprintln!("📋 Pipeline Board v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   Pipeline API: http://0.0.0.0:{}/api/pipeline", config.port);
    eprintln!("   Pipeline WS: ws://0.0.0.0:{}/ws", config.port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn PipelineStore> = Arc::new(
        LibSqlBackend::new_local(&config.db_path)
            .await
            .unwrap_or_else(|e| {
                eprintln!(
                    "Error: Failed to open database at {}: {}",
                    config.db_path.display(),
                    e
                );
                std::process::exit(1);
            }),
    );

    eprintln!("   Database: {}", config.db_path.display());

    let records = store.get_all().await?;
    eprintln!("   Tracked threads: {}\n", records.len());

    // ── HTTP / WS server ─────────────────────────────────────────────────
    let app = pipeline_routes(store).layer(CorsLayer::permissive());

    let listener = tokio::net::TcpListener::bind(format!("0.0.0.0:{}", config.port)).await?;
    tracing::info!(port = config.port, "Pipeline server started");
    axum::serve(listener, app).await?;

    Ok(())
}
