use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::Router;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::{info, warn};

use super::api::{self, AppState};
use super::pipeline::{PipelineExecutor, PipelineSettings};
use super::planner::PolicyTable;
use super::runtime::DockerRuntime;
use super::store::{DbHandle, DeploymentStore};
use super::vcs::GitCliFetcher;
use super::webhook::WebhookRouter;
use crate::config::{DockhandConfig, ProxySection};

/// Configuration for the deploy server.
pub struct ServerConfig {
    pub host: String,
    pub port: u16,
    pub db_path: PathBuf,
    pub dev_mode: bool,
    pub webhook_secret: Option<String>,
    pub proxy: ProxySection,
    pub pipeline: PipelineSettings,
}

impl ServerConfig {
    pub fn from_config(config: &DockhandConfig) -> Self {
        Self {
            host: config.server.host.clone(),
            port: config.server.port,
            db_path: config.store.db_path.clone(),
            dev_mode: config.server.dev_mode,
            webhook_secret: config.webhook.secret.clone(),
            proxy: config.proxy.clone(),
            pipeline: PipelineSettings::from_config(config),
        }
    }
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self::from_config(&DockhandConfig::default())
    }
}

/// Build the full application router with request tracing.
pub fn build_router(state: Arc<AppState>, dev_mode: bool) -> Router {
    let mut app = api::api_router()
        .with_state(state)
        .layer(TraceLayer::new_for_http());

    if dev_mode {
        app = app.layer(CorsLayer::permissive());
    }
    app
}

/// Start the deploy server.
pub async fn start_server(config: ServerConfig) -> Result<()> {
    let db = DbHandle::open(&config.db_path).context("Failed to initialize deployment database")?;
    let store: Arc<dyn DeploymentStore> = Arc::new(db);

    let runtime = Arc::new(
        DockerRuntime::connect()
            .await
            .context("Container runtime unavailable")?,
    );

    tokio::fs::create_dir_all(&config.pipeline.projects_dir)
        .await
        .with_context(|| {
            format!(
                "Failed to create projects directory {}",
                config.pipeline.projects_dir.display()
            )
        })?;

    let base_domain = config.proxy.base_domain.clone();
    let executor = Arc::new(PipelineExecutor::new(
        Arc::new(GitCliFetcher::default()),
        runtime,
        store.clone(),
        config.proxy,
        config.pipeline,
        PolicyTable::standard(),
    ));

    if config.webhook_secret.is_none() {
        warn!("no webhook secret configured: webhook signatures are not verified");
    }

    let state = Arc::new(AppState {
        store: store.clone(),
        router: WebhookRouter::new(store, executor, base_domain),
        webhook_secret: config.webhook_secret,
    });

    let app = build_router(state, config.dev_mode);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    info!(address = %local_addr, "dockhand listening");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("shutting down"),
        Err(e) => {
            warn!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    }
}
