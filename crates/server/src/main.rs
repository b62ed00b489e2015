//! AgentRelay server
//!
//! Session coordination and streaming relay for AI command-execution
//! backends: HTTP in, NDJSON out, WebSocket fan-out to viewers.

mod auth;
mod blobs;
mod bridge;
mod clock;
mod config;
mod coordinator;
mod error;
mod gateway;
mod jobs;
mod logging;
mod migration_runner;
mod paths;
mod permissions;
mod persistence;
mod sanitize;
mod state;

use std::sync::Arc;
use std::time::Duration;

use axum::middleware;
use axum::routing::{get, post};
use axum::Router;
use clap::Parser;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::blobs::BlobStore;
use crate::bridge::{BridgeConfig, ExecutionBridge};
use crate::config::ServerConfig;
use crate::coordinator::CoordinatorRegistry;
use crate::jobs::JobWorker;
use crate::permissions::PermissionResolver;
use crate::persistence::PersistenceWriter;
use crate::state::AppContext;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = ServerConfig::parse();

    let data_dir = paths::init_data_dir(config.data_dir.as_deref());
    paths::ensure_dirs()?;
    let _logging_guard = logging::init_logging()?;

    info!(
        component = "main",
        event = "server.starting",
        data_dir = %data_dir.display(),
        bind = %config.bind,
        "Starting relayd"
    );

    let db_path = paths::db_path();
    {
        let mut conn = rusqlite::Connection::open(&db_path)?;
        migration_runner::run_migrations(&mut conn)?;
    }

    let (job_tx, job_rx) = jobs::create_job_channel();
    tokio::spawn(
        JobWorker::new(
            job_rx,
            db_path.clone(),
            paths::index_dir(),
            paths::uploads_dir(),
        )
        .run(),
    );

    let (persist_tx, persist_rx) = persistence::create_persistence_channel();
    tokio::spawn(
        PersistenceWriter::new(persist_rx, db_path.clone(), Some(job_tx.clone())).run(),
    );

    let bridge = Arc::new(ExecutionBridge::new(
        BridgeConfig {
            agent_bin: config.agent_bin.clone(),
            one_shot_commands: config.one_shot_commands.clone(),
            max_processes: config.max_processes,
            session_timeout: Duration::from_secs(config.session_timeout_secs),
            sweep_interval: Duration::from_secs(config.sweep_interval_secs),
            request_timeout: Duration::from_secs(config.request_timeout_secs),
        },
        Some(persist_tx.clone()),
    ));
    bridge.spawn_reaper();

    let coordinators = Arc::new(CoordinatorRegistry::new(
        persist_tx.clone(),
        db_path.clone(),
        Duration::from_secs(config.heartbeat_secs),
    ));

    let resolver = Arc::new(PermissionResolver::new(Duration::from_secs(
        config.role_cache_ttl_secs,
    )));
    let blobs = BlobStore::new(paths::uploads_dir());

    let auth_token = config.auth_token.clone();
    let bind = config.bind.clone();

    let ctx = Arc::new(AppContext {
        config,
        db_path,
        bridge: bridge.clone(),
        coordinators,
        resolver,
        persist_tx,
        job_tx,
        blobs,
    });

    let mut app = Router::new()
        .route("/api/chat", post(gateway::chat))
        .route(
            "/api/sessions",
            post(gateway::create_session).get(gateway::list_sessions),
        )
        .route(
            "/api/sessions/{id}",
            get(gateway::get_session).delete(gateway::delete_session),
        )
        .route(
            "/api/sessions/{id}/interrupt",
            post(gateway::interrupt_session),
        )
        .route("/api/upload", post(gateway::upload))
        .route("/api/files/{*key}", get(gateway::get_file))
        .route("/health", get(gateway::health))
        .route("/ws/{session_id}", get(gateway::ws_handler))
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(ctx);

    if let Some(token) = auth_token {
        app = app.layer(middleware::from_fn_with_state(token, auth::auth_middleware));
    }

    let listener = tokio::net::TcpListener::bind(&bind).await?;
    info!(
        component = "main",
        event = "server.listening",
        bind = %bind,
        "relayd listening"
    );

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!(
        component = "main",
        event = "server.stopping",
        "Shutting down, terminating agent subprocesses"
    );
    bridge.shutdown().await;

    Ok(())
}

async fn shutdown_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
