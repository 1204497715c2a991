mod api;
mod config;
mod error;
mod models;
mod services;

use std::sync::Arc;
use std::time::Duration;

use axum::{Router, response::Html, routing::get};
use clap::Parser;
use tokio::net::TcpListener;
use tokio::signal;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing_subscriber::{EnvFilter, fmt};

use api::AppState;
use config::{AppConfig, CliArgs};
use services::llm::{LLMClient, SampleGenerator, TextGenerationPort};
use services::registry::JobRegistry;
use services::scheduler::BatchScheduler;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let _ = dotenvy::dotenv();
    let config = AppConfig::try_from(CliArgs::parse())?;

    fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")))
        .init();

    let generator: Arc<dyn TextGenerationPort> = match config.llm.api_key.clone() {
        Some(key) => Arc::new(LLMClient::new(&config.llm, key)?),
        None => {
            tracing::warn!("LLM_API_KEY not set, chapters will be filled with sample content");
            Arc::new(SampleGenerator::new(Duration::from_millis(20)))
        }
    };
    let offline = config.llm.api_key.is_none();

    let registry = Arc::new(JobRegistry::new(config.tombstone_retention));
    let scheduler = BatchScheduler::new(
        registry.clone(),
        generator.clone(),
        config.batch_size,
        config.chapter_timeout,
    );
    let state = AppState {
        registry,
        scheduler,
        generator: generator.clone(),
        channel: config.channel.clone(),
        job_retention: config.job_retention,
        offline,
    };

    let app = Router::new()
        .route("/", get(index))
        .route("/health", get(health_check))
        .merge(api::router(state))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .layer(TraceLayer::new_for_http());

    let listener = TcpListener::bind(&config.server_addr).await?;
    tracing::info!(
        addr = %listener.local_addr()?,
        provider = generator.provider_name(),
        batch_size = config.batch_size,
        "book generation service listening"
    );
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    tracing::info!("server shut down");
    Ok(())
}

async fn index() -> Html<&'static str> {
    Html(
        r#"<!DOCTYPE html>
<html>
<head>
    <title>Book Generation Service</title>
    <meta charset="utf-8">
    <style>
        body { font-family: Arial, sans-serif; margin: 40px; }
        .info-box { background-color: #f0f8ff; padding: 20px; border-radius: 8px; margin: 20px 0; }
        .endpoint { background-color: #f5f5f5; padding: 10px; margin: 10px 0; border-radius: 4px; font-family: monospace; }
    </style>
</head>
<body>
    <h1>Book Generation Service</h1>

    <div class="info-box">
        <h2>Service Information</h2>
        <p>Generates every chapter of a book in batches and reports progress while it runs.</p>
    </div>

    <h2>Available Endpoints:</h2>
    <div class="endpoint">GET / - This information page</div>
    <div class="endpoint">GET /health - Health check</div>
    <div class="endpoint">POST /api/generate-book - Generate all chapters of a book</div>
    <div class="endpoint">GET /api/generation-progress/:book_id - Progress as server-sent events (?stream=false to poll)</div>
    <div class="endpoint">POST /api/generation-progress/:book_id/chapters/:index/retry - Retry a failed chapter</div>
    <div class="endpoint">POST /api/generate-chapter - Stream a single chapter as plain text</div>
    <div class="endpoint">POST /api/generate-outline - Generate a book outline</div>
</body>
</html>
"#,
    )
}

async fn health_check() -> &'static str {
    "OK"
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            tracing::error!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    tracing::info!("shutdown signal received");
}
