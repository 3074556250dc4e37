mod config;
mod db;
mod errors;
mod llm_client;
mod models;
mod routes;
mod screening;
mod state;

use anyhow::Result;
use std::net::SocketAddr;
use std::sync::Arc;
use tower_http::{cors::CorsLayer, trace::TraceLayer};
use tracing::info;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;
use crate::db::{create_pool, run_migrations};
use crate::llm_client::LlmClient;
use crate::routes::build_router;
use crate::screening::audit::AuditRecorder;
use crate::screening::matching::{BackendConfig, DefaultPipelineFactory, MatchingService};
use crate::screening::pg_store::{PgProfileRepository, PgScreeningStore};
use crate::screening::service::ScreeningService;
use crate::state::AppState;

#[tokio::main]
async fn main() -> Result<()> {
    // Load configuration first (fails on missing required env vars)
    let config = Config::from_env()?;

    // Initialize structured logging
    tracing_subscriber::registry()
        .with(EnvFilter::try_from_default_env().unwrap_or_else(|_| {
            EnvFilter::new(format!("{}={}", env!("CARGO_PKG_NAME"), &config.rust_log))
        }))
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting screener v{}", env!("CARGO_PKG_VERSION"));

    // Initialize PostgreSQL
    let db = create_pool(&config.database_url, config.max_concurrency).await?;
    run_migrations(&db).await?;

    let store = Arc::new(PgScreeningStore::new(db.clone()));
    let profiles = Arc::new(PgProfileRepository::new(db));

    // Initialize LLM client (optional; only the llm backend needs it)
    let llm = match &config.anthropic_api_key {
        Some(key) => {
            let client = LlmClient::new(key.clone())?;
            info!("LLM client initialized");
            Some(client)
        }
        None => {
            info!("ANTHROPIC_API_KEY not set; llm scorer backend unavailable");
            None
        }
    };

    // Scoring pipeline
    let default_backend =
        BackendConfig::from_settings(&config.scorer_backend, config.scorer_model.as_deref())?;
    info!(
        backend = %default_backend.cache_key(),
        version = %config.scorer_version,
        "Default scorer backend"
    );
    let matcher = Arc::new(MatchingService::new(
        Arc::new(DefaultPipelineFactory::new(llm)),
        default_backend,
        config.scorer_version.clone(),
    ));

    // Audit writer and orchestrator
    let (audit, _audit_writer) = AuditRecorder::spawn(store.clone());
    let screening = ScreeningService::new(
        store,
        profiles,
        matcher,
        audit.clone(),
        config.max_concurrency,
    );

    // Build app state
    let state = AppState {
        screening: screening.clone(),
    };

    // Build router
    let app = build_router(state)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive()); // TODO: tighten CORS in production

    let addr: SocketAddr = format!("0.0.0.0:{}", config.port).parse()?;
    info!("Listening on {addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    // Let live runs settle as cancelled, then persist queued node runs
    screening.shutdown().await;
    audit.flush().await;
    info!("Shutdown complete");

    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {e}");
    }
    info!("Shutdown signal received");
}
