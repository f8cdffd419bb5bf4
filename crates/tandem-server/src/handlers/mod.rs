//! HTTP and WebSocket handlers for the Tandem server.
//!
//! Routes:
//!
//! | method | path                     | handler                |
//! |--------|--------------------------|------------------------|
//! | GET    | `{signaling}`            | signaling WebSocket    |
//! | GET    | `{collab}/:doc_name`     | live sync WebSocket    |
//! | POST   | `{poll}`                 | poll reconciliation    |
//! | POST   | `{reset}`                | live session reset     |
//! | GET    | `/health`                | health and counters    |

mod live;
mod poll;
mod signaling;

use crate::config::Config;
use crate::metrics;
use anyhow::{Context, Result};
use axum::{
    extract::{DefaultBodyLimit, State},
    http::HeaderMap,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use std::sync::Arc;
use tandem_core::{AccessPolicy, DocumentStore, HeaderAccessPolicy, Relay};
use tokio::net::TcpListener;
use tracing::{error, info};

/// Shared server state.
pub struct AppState {
    /// The signaling relay.
    pub relay: Arc<Relay>,
    /// Live documents.
    pub store: DocumentStore,
    /// Source of per-request access grants.
    pub policy: Arc<dyn AccessPolicy>,
    /// Server configuration.
    pub config: Config,
}

impl AppState {
    /// Create new app state trusting the upstream permission headers.
    #[must_use]
    pub fn new(config: Config) -> Self {
        Self::with_policy(config, Arc::new(HeaderAccessPolicy))
    }

    /// Create new app state with a custom access policy.
    #[must_use]
    pub fn with_policy(config: Config, policy: Arc<dyn AccessPolicy>) -> Self {
        Self {
            relay: Arc::new(Relay::with_config(config.relay())),
            store: DocumentStore::with_config(config.store()),
            policy,
            config,
        }
    }
}

/// Build the application router.
pub fn router(state: Arc<AppState>) -> Router {
    let paths = &state.config.paths;
    let collab = format!("{}/:doc_name", paths.collab.trim_end_matches('/'));
    let poll_limit = DefaultBodyLimit::max(state.config.limits.max_poll_body());

    Router::new()
        .route(&paths.signaling, get(signaling::ws_handler))
        .route(&collab, get(live::ws_handler))
        .route(&paths.poll, post(poll::poll_handler).layer(poll_limit))
        .route(&paths.reset, post(poll::reset_handler))
        .route("/health", get(health_handler))
        .with_state(state)
}

/// Serve the application on an already bound listener.
///
/// # Errors
///
/// Returns an error if the server stops abnormally.
pub async fn serve(listener: TcpListener, state: Arc<AppState>) -> Result<()> {
    axum::serve(listener, router(state))
        .await
        .context("Server error")
}

/// Run the HTTP/WebSocket server.
///
/// # Errors
///
/// Returns an error if the server fails to start.
pub async fn run_server(config: Config) -> Result<()> {
    if config.metrics.enabled {
        if let Err(e) = metrics::start_metrics_server(config.metrics.port) {
            error!("Failed to start metrics server: {}", e);
        }
    }

    let addr = config.bind_addr()?;
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;

    info!("Tandem server listening on {}", addr);
    info!("Signaling endpoint: ws://{}{}", addr, config.paths.signaling);
    info!("Collaboration endpoint: ws://{}{}/<doc>", addr, config.paths.collab);
    info!("Poll endpoint: http://{}{}", addr, config.paths.poll);

    let state = Arc::new(AppState::new(config));
    serve(listener, state).await
}

/// Health check handler.
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let relay = state.relay.stats();
    let store = state.store.stats();
    Json(serde_json::json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "topics": relay.broker.topic_count,
        "connections": relay.connections,
        "documents": store.document_count,
        "sessions": store.session_count,
    }))
}

/// Read a header as a string, ignoring values that are not visible ASCII.
fn header<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers.get(name).and_then(|v| v.to_str().ok())
}
