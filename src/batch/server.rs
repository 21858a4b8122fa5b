use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, http::StatusCode, response::IntoResponse};
use tower_http::cors::CorsLayer;
use tracing::{info, warn};

use super::BatchSettings;
use super::adapter::{CallAdapter, HttpCallAdapter};
use super::api::{self, AppState};
use super::classify::{InterestClassifier, KeywordClassifier};
use super::controller::BatchController;
use super::db::{DbHandle, OutreachDb};
use super::emitter::EventEmitter;
use crate::outreach_config::OutreachConfig;

/// Configuration for the orchestrator server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: std::path::PathBuf,
    pub adapter_url: String,
    pub adapter_timeout: Duration,
    pub classifier: KeywordClassifier,
    pub settings: BatchSettings,
    pub event_capacity: usize,
    /// Permissive CORS for a locally served dashboard
    pub cors: bool,
}

impl From<&OutreachConfig> for ServerConfig {
    fn from(config: &OutreachConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.server.db_path.clone(),
            adapter_url: config.adapter.base_url.clone(),
            adapter_timeout: Duration::from_secs(config.adapter.request_timeout_secs),
            classifier: config.classifier.clone(),
            settings: config.batch.to_settings(),
            event_capacity: config.batch.event_capacity,
            cors: config.server.cors,
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from(&OutreachConfig::default())
    }
}

/// Build the full application router with API and event stream.
pub fn build_router(state: Arc<AppState>, cors: bool) -> Router {
    let mut app = api::api_router().fallback(not_found).with_state(state);
    if cors {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

async fn not_found() -> impl IntoResponse {
    (
        StatusCode::NOT_FOUND,
        axum::Json(serde_json::json!({"error": "Not found", "code": "NOT_FOUND"})),
    )
}

/// Open (and migrate) the database at `path`, creating its directory.
pub fn open_db(path: &std::path::Path) -> Result<DbHandle> {
    if let Some(parent) = path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = OutreachDb::new(path).context("Failed to initialize outreach database")?;
    Ok(DbHandle::new(db))
}

/// Start the orchestrator server and run until Ctrl+C.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = open_db(&config.db_path)?;
    let adapter: Arc<dyn CallAdapter> =
        Arc::new(HttpCallAdapter::new(&config.adapter_url, config.adapter_timeout)?);
    let classifier: Arc<dyn InterestClassifier> = Arc::new(config.classifier);
    let controller = BatchController::new(
        db,
        EventEmitter::new(config.event_capacity),
        adapter,
        classifier,
        config.settings,
    );

    let recovered = controller
        .recover()
        .await
        .context("Failed to recover running batch jobs")?;
    if recovered > 0 {
        warn!(recovered, "resumed driving batch jobs left running by a previous process");
    }

    let app = build_router(Arc::new(AppState { controller }), config.cors);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(addr = %local_addr, adapter = %config.adapter_url, "outreach orchestrator listening");
    println!("Outreach orchestrator running at http://{}", local_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    println!("Server shut down gracefully.");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    println!("\nShutting down...");
}
