//! WebSocket session layer: one client connection maps to one session with
//! a bound workspace. Sessions get their own MCP client, planner, and
//! permission audit view; the credit tracker is shared process-wide.

mod approval;
mod session;
mod ws;

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use async_trait::async_trait;
use axum::extract::State;
use axum::routing::get;
use axum::{Json, Router};
use serde_json::{json, Value};
use tower_http::cors::{Any, CorsLayer};

use ensemble_core::{CreditTracker, EngineConfig, PermissionsManager};
use ensemble_mcp::McpClient;
use ensemble_orchestrator::{ExecutorRegistry, WorkflowPlanner};
use ensemble_types::ServerFrame;

pub use approval::{ApprovalBroker, WsApprovalChannel};
pub use session::Session;
pub use ws::ws_handler;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

/// What a session needs to execute workflows, built per workspace.
pub struct SessionRuntime {
    pub planner: Arc<dyn WorkflowPlanner>,
    pub executors: ExecutorRegistry,
    pub permissions: Arc<PermissionsManager>,
    /// Retained so the session can tear the subprocesses down on close.
    pub mcp: Option<Arc<McpClient>>,
}

/// Builds per-session runtimes. The engine binary wires a real MCP-backed
/// implementation; tests substitute stubs.
#[async_trait]
pub trait SessionBackend: Send + Sync {
    async fn start(&self, workspace_path: &Path) -> ensemble_core::Result<SessionRuntime>;
}

#[derive(Clone)]
pub struct AppState {
    pub config: EngineConfig,
    pub credit: Arc<CreditTracker>,
    pub backend: Arc<dyn SessionBackend>,
}

/// Messages flowing from a session (and its execution task) to the socket.
pub enum SessionOutput {
    Frame(ServerFrame),
    ExecutionFinished,
}

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/healthz", get(healthz))
        .route("/ws/chat", get(ws_handler))
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state)
}

pub async fn serve(addr: SocketAddr, state: AppState) -> anyhow::Result<()> {
    let app = router(state);
    let listener = tokio::net::TcpListener::bind(addr).await?;
    tracing::info!(%addr, "ensemble engine listening");
    axum::serve(listener, app).await?;
    Ok(())
}

async fn healthz(State(_state): State<AppState>) -> Json<Value> {
    Json(json!({"status": "ok", "version": SERVER_VERSION}))
}
