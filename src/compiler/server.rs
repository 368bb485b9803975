use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum::{Router, routing::get};
use tokio::task::JoinHandle;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use super::api::{self, AppState, SharedState};
use super::db::{DbHandle, LessonDb};
use super::generator::CommandGenerator;
use super::graph::InMemoryGraph;
use super::orchestrator::Orchestrator;
use super::session::{SessionManager, SystemClock};
use super::ws;
use crate::config::LessonConfig;

/// Wire the orchestrator and its collaborators from configuration.
pub fn build_orchestrator(config: &LessonConfig) -> Result<Arc<Orchestrator>> {
    if let Some(parent) = config.server.db_path.parent()
        && !parent.as_os_str().is_empty()
    {
        std::fs::create_dir_all(parent).context("Failed to create database directory")?;
    }
    let db = LessonDb::new(&config.server.db_path).context("Failed to initialize lesson database")?;

    let graph = match &config.graph.seed_path {
        Some(path) => InMemoryGraph::load(path)
            .with_context(|| format!("Failed to load graph seed {}", path.display()))?,
        None => {
            tracing::warn!("no graph seed configured, every objective will be unknown");
            InMemoryGraph::new()
        }
    };

    let generator = CommandGenerator::new(&config.generation.command, config.generation.timeout());
    let sessions = SessionManager::new(
        Arc::new(SystemClock),
        config.session.ttl(),
        config.session.plan_cache_ttl(),
        config.session.plan_cache_capacity,
    );

    Ok(Arc::new(Orchestrator::new(
        Arc::new(generator),
        Arc::new(graph),
        DbHandle::new(db),
        Arc::new(sessions),
        config.orchestrator_config(),
    )))
}

pub fn build_state(config: &LessonConfig) -> Result<SharedState> {
    Ok(Arc::new(AppState {
        orchestrator: build_orchestrator(config)?,
        stream_buffer: config.stream.buffer,
        keepalive: config.stream.keepalive(),
    }))
}

/// Build the full application router: HTTP API plus the compile stream.
pub fn build_router(state: SharedState) -> Router {
    api::api_router()
        .route("/api/compile/ws", get(ws::compile_ws))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/// Periodically drop expired sessions.
pub fn spawn_session_sweeper(sessions: Arc<SessionManager>, every: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(every);
        loop {
            interval.tick().await;
            let removed = sessions.sweep_expired();
            if removed > 0 {
                tracing::debug!(removed, remaining = sessions.len(), "swept expired sessions");
            }
        }
    })
}

/// Start the lesson compiler server.
pub async fn start_server(config: LessonConfig) -> Result<()> {
    let state = build_state(&config)?;
    let sweeper = spawn_session_sweeper(
        state.orchestrator.sessions().clone(),
        config.session.sweep_interval(),
    );

    let mut app = build_router(state);
    if config.server.dev_mode {
        app = app.layer(CorsLayer::permissive());
    }

    let host = if config.server.dev_mode { "0.0.0.0" } else { "127.0.0.1" };
    let addr = format!("{}:{}", host, config.server.port);
    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind to {}", addr))?;

    let local_addr = listener.local_addr()?;
    tracing::info!(%local_addr, "lesson compiler listening");

    let served = axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error");

    sweeper.abort();
    served?;
    tracing::info!("server shut down gracefully");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!(error = %e, "failed to install Ctrl+C handler");
        std::future::pending::<()>().await;
    }
    tracing::info!("shutting down");
}
