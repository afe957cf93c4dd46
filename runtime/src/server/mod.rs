//! HTTP server for the sandbox API

pub mod bridge;
pub mod execute;

use std::net::SocketAddr;
use std::sync::Arc;

use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, Extension},
    routing::get,
    Json, Router,
};
use capsules_code_exec::{ExecLimits, Executor, InterpreterSpec};
use capsules_lsp_bridge::{Bridge, CompanionLauncher, CompanionSpec};
use confinement::{build_confiner, ConfinementMode, Confiner};
use serde::Serialize;
use serde_json::{json, Value};
use session_registry::{SessionKind, SessionRegistry};
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::Config;

/// Bytes of request body allowed per byte of code: JSON may escape each
/// character as `\u00XX`.
const JSON_ESCAPE_FACTOR: usize = 6;
const BODY_OVERHEAD: usize = 1024;

/// Shared state handed to every handler
#[derive(Debug, Clone)]
pub struct AppState {
    pub executor: Executor,
    pub bridge: Option<Bridge>,
    pub registry: SessionRegistry,
    pub mode: ConfinementMode,
}

/// Error body shared by every API route
#[derive(Debug, Serialize)]
pub struct ErrorResponse {
    pub error: String,
    pub code: String,
}

impl ErrorResponse {
    pub fn new(error: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            error: error.into(),
            code: code.into(),
        }
    }
}

impl AppState {
    pub fn new(
        confiner: Arc<dyn Confiner>,
        registry: SessionRegistry,
        interpreter: InterpreterSpec,
        limits: ExecLimits,
        companion: Option<CompanionSpec>,
    ) -> Self {
        let mode = confiner.mode();
        let executor = Executor::new(confiner.clone(), registry.clone(), interpreter, limits);
        let bridge = companion
            .map(|spec| Bridge::new(CompanionLauncher::new(confiner, registry.clone(), spec)));
        Self {
            executor,
            bridge,
            registry,
            mode,
        }
    }

    /// Build the service from configuration. Fails when secure mode is on
    /// and confinement cannot actually be established on this host.
    pub async fn from_config(config: &Config) -> Result<Self> {
        config.validate()?;

        let confiner = build_confiner(&config.sandbox_config())
            .context("confinement is unavailable; refusing to start")?;
        confiner
            .check_host()
            .await
            .context("confinement check failed; refusing to start")?;

        let registry = SessionRegistry::new(config.scratch_root())
            .context("failed to prepare scratch root")?;

        let state = Self::new(
            confiner,
            registry,
            config.interpreter_spec(),
            config.exec_limits(),
            config.companion_spec(),
        );
        info!(
            mode = state.mode.as_str(),
            bridge = state.bridge.is_some(),
            scratch_root = %state.registry.scratch_root().display(),
            "Sandbox ready"
        );
        Ok(state)
    }
}

/// Create the API router
pub fn create_app(state: AppState) -> Router {
    let body_limit = state
        .executor
        .limits()
        .max_code_bytes
        .saturating_mul(JSON_ESCAPE_FACTOR)
        .saturating_add(BODY_OVERHEAD);

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness))
        .nest("/api", execute::routes().merge(bridge::routes()))
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(Extension(state))
        .layer(TraceLayer::new_for_http())
}

async fn health_check() -> &'static str {
    "OK"
}

async fn readiness(Extension(state): Extension<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ready",
        "confinement": state.mode,
        "bridgeEnabled": state.bridge.is_some(),
        "activeSessions": {
            "execution": state.registry.active_by_kind(SessionKind::Execution),
            "bridge": state.registry.active_by_kind(SessionKind::Bridge),
        },
    }))
}

/// Serve until ctrl-c or SIGTERM, then release every open session.
pub async fn serve(addr: SocketAddr, state: AppState) -> Result<()> {
    let registry = state.registry.clone();
    let app = create_app(state);

    info!("Starting sandbox API server on {}", addr);

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind {}", addr))?;
    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    let released = registry.close_all_async().await;
    info!(released, "Server stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(err) = tokio::signal::ctrl_c().await {
            tracing::warn!(error = %err, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(err) => {
                tracing::warn!(error = %err, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            }
        }
    };

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
    info!("Shutdown signal received");
}
