//! docsync server
//!
//! A real-time collaborative document server speaking the y-sync protocol
//! over WebSockets, built on [`docsync_core`].
//!
//! ## Endpoints
//!
//! - `GET /`: banner
//! - `GET /health`: liveness and connection counts
//! - `GET /sync?doc=<name>&token=<token>`: y-sync WebSocket
//! - `GET /cluster`: relay hub WebSocket (when `CLUSTER_HUB` is set)
//!
//! ## Environment Variables
//!
//! - `HOST`: Server host (default: 0.0.0.0)
//! - `PORT`: Server port (default: 3030)
//! - `DATABASE_PATH`: SQLite database (default: in-memory storage)
//! - `AUTO_CREATE`: Create documents on first access (default: true)
//! - `AUTH_TOKEN`: Shared client token (default: open)
//! - `CACHE_DURATION_SECS`, `STORE_DELAY_MS`, `STORE_MAX_DELAY_MS`,
//!   `MAX_PARALLEL_WRITES`, `PRESENCE_TIMEOUT_SECS`, `CLEANUP_INTERVAL_SECS`
//! - `CLUSTER_RELAY_URL`: Relay hub to join (default: standalone)
//! - `CLUSTER_HUB`: Serve the relay hub (default: false)
//! - `CLUSTER_BATCH_SIZE`, `CLUSTER_BATCH_DELAY_MS`, `CLUSTER_BATCH_MAX_DELAY_MS`

use std::sync::Arc;

use axum::{
    Json, Router,
    extract::State,
    http::{Method, header},
    routing::get,
};
use docsync_core::DocumentManager;
use serde_json::{Value, json};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};

pub mod auth;
pub mod config;
pub mod handlers;
pub mod sync;

pub use config::Config;

use auth::Authenticator;
use handlers::{RelayHub, cluster_handler, ws_handler};
use sync::ConnectionRegistry;

/// Shared state for all routes
#[derive(Clone)]
pub struct AppState {
    pub manager: Arc<DocumentManager>,
    pub registry: Arc<ConnectionRegistry>,
    pub authenticator: Arc<dyn Authenticator>,
    /// Present when this process serves the cluster relay hub
    pub relay_hub: Option<Arc<RelayHub>>,
}

pub fn build_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_methods([Method::GET, Method::OPTIONS])
        .allow_headers([header::AUTHORIZATION, header::CONTENT_TYPE])
        .allow_origin(Any);

    Router::new()
        .route("/", get(|| async { "docsync server" }))
        .route("/health", get(health))
        .route("/sync", get(ws_handler))
        .route("/cluster", get(cluster_handler))
        .with_state(state)
        .layer(cors)
        .layer(TraceLayer::new_for_http())
}

async fn health(State(state): State<AppState>) -> Json<Value> {
    Json(json!({
        "status": "ok",
        "documents": state.manager.cache().len(),
        "connections": state.registry.connection_count(),
    }))
}
