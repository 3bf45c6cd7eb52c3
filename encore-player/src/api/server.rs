//! HTTP server setup and routing
//!
//! Three routes: `/ws` is the observer channel, `/state` a one-shot
//! snapshot for tools that do not want a socket, `/health` for probes.

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde_json::json;
use tokio::sync::{mpsc, RwLock};
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;
use tracing::info;

use encore_common::Session;

use crate::coordinator::CoordinatorMsg;
use crate::error::{Error, Result};
use crate::hub::StateBroadcaster;

/// Shared application context passed to all handlers.
#[derive(Clone)]
pub struct AppContext {
    pub command_tx: mpsc::Sender<CoordinatorMsg>,
    pub hub: StateBroadcaster,
    /// Latest published session, read by `/state` and new observers
    pub snapshot: Arc<RwLock<Session>>,
    /// Bearer token required from observers; None disables authentication
    pub token: Option<String>,
}

pub fn router(ctx: AppContext) -> Router {
    Router::new()
        .route("/ws", get(super::ws::upgrade))
        .route("/state", get(get_state))
        .route("/health", get(health))
        .with_state(ctx)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

/// Bind and serve until `shutdown` resolves.
pub async fn run(
    port: u16,
    ctx: AppContext,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let app = router(ctx);
    let addr = SocketAddr::from(([0, 0, 0, 0], port));

    let listener = tokio::net::TcpListener::bind(addr)
        .await
        .map_err(|e| Error::Http(format!("failed to bind to {addr}: {e}")))?;
    info!("command channel listening on {addr}");

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown)
        .await
        .map_err(|e| Error::Http(format!("server error: {e}")))
}

async fn health(State(ctx): State<AppContext>) -> Json<serde_json::Value> {
    Json(json!({
        "service": "encore",
        "version": env!("CARGO_PKG_VERSION"),
        "status": "running",
        "observers": ctx.hub.observer_count(),
    }))
}

async fn get_state(State(ctx): State<AppContext>) -> (StatusCode, Json<Session>) {
    let session = ctx.snapshot.read().await.clone();
    (StatusCode::OK, Json(session))
}
