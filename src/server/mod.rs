//! HTTP API.
//!
//! Routes (all below `api.prefix`):
//!
//! - `GET  /health`
//! - `POST /tools/run`            any executable in the approved directory
//! - `POST /tools/hci/filter`     the configured HCI trace filter
//! - `POST /jira/issues/update`   field update and/or comment on an issue
//!
//! Every error is a JSON body `{"error": {"code", "message", "details"?}}`.

pub mod error;
pub mod handlers;
pub mod state;

use std::future::Future;
use std::sync::Arc;

use anyhow::Context;
use axum::routing::{get, post};
use axum::Router;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::config::ApiConfig;

pub use error::{ApiError, ApiResult};
pub use state::AppState;

pub fn create_router(state: Arc<AppState>) -> Router {
    let api = Router::new()
        .route("/health", get(handlers::health))
        .route("/tools/run", post(handlers::run_tool))
        .route("/tools/hci/filter", post(handlers::hci_filter))
        .route("/jira/issues/update", post(handlers::update_issue));

    let router = if state.api_prefix.is_empty() {
        api
    } else {
        Router::new().nest(&state.api_prefix, api)
    };

    let log_access = state.log_access;
    let router = router.fallback(handlers::not_found).with_state(state);
    if log_access {
        router.layer(TraceLayer::new_for_http())
    } else {
        router
    }
}

/// Binds the listener and serves until `shutdown` resolves.
pub async fn serve(
    api: &ApiConfig,
    state: Arc<AppState>,
    shutdown: impl Future<Output = ()> + Send + 'static,
) -> anyhow::Result<()> {
    let addr = format!("{}:{}", api.host, api.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {addr}"))?;
    info!("Listening on http://{}{}", listener.local_addr()?, api.prefix);

    axum::serve(listener, create_router(state))
        .with_graceful_shutdown(shutdown)
        .await?;
    Ok(())
}
