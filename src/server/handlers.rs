use std::sync::Arc;

use axum::extract::rejection::JsonRejection;
use axum::extract::State;
use axum::http::Uri;
use axum::Json;
use serde::Serialize;
use tracing::{error, info};

use crate::sandbox::{
    GenericRunOutput, GenericRunRequest, HciFilterOutput, HciFilterRequest, InvocationProfile,
};
use crate::tracker::{IssueUpdate, IssueUpdateOutcome};

use super::error::{ApiError, ApiResult};
use super::state::AppState;

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub app: String,
    pub env: String,
    pub version: &'static str,
    pub started_at: String,
}

pub async fn health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    Json(HealthResponse {
        status: "ok",
        app: state.app_name.clone(),
        env: state.env.clone(),
        version: env!("CARGO_PKG_VERSION"),
        started_at: state.started_at.to_rfc3339(),
    })
}

pub async fn run_tool(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<GenericRunRequest>, JsonRejection>,
) -> ApiResult<Json<GenericRunOutput>> {
    let Json(request) = payload?;
    info!(
        "run_tool request executable={} args={}",
        request.executable,
        request.args.len()
    );
    let output = execute(&state, state.generic.clone(), request).await?;
    info!(
        "run_tool done exit_code={} duration_ms={}",
        output.exit_code, output.duration_ms
    );
    Ok(Json(output))
}

pub async fn hci_filter(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<HciFilterRequest>, JsonRejection>,
) -> ApiResult<Json<HciFilterOutput>> {
    let Json(request) = payload?;
    info!("hci_filter request input_path={}", request.input_path);
    let output = execute(&state, state.hci_filter.clone(), request).await?;
    info!("hci_filter success duration_ms={}", output.duration_ms);
    Ok(Json(output))
}

pub async fn update_issue(
    State(state): State<Arc<AppState>>,
    payload: Result<Json<IssueUpdate>, JsonRejection>,
) -> ApiResult<Json<IssueUpdateOutcome>> {
    let Json(update) = payload?;
    update.validate().map_err(ApiError::Validation)?;
    info!("jira_update request issue_key={}", update.issue_key);

    let outcome = state.tracker.update_issue(&update).await.map_err(|e| {
        error!("jira_update failed issue_key={}: {e}", update.issue_key);
        e
    })?;
    Ok(Json(outcome))
}

pub async fn not_found(uri: Uri) -> ApiError {
    ApiError::NotFound(uri.path().to_string())
}

/// Runs one invocation. Unless disconnects should cancel it, the execution
/// gets its own task and finishes even if the client goes away.
async fn execute<P>(state: &AppState, profile: Arc<P>, request: P::Request) -> ApiResult<P::Output>
where
    P: InvocationProfile + 'static,
    P::Request: 'static,
    P::Output: 'static,
{
    let engine = state.engine.clone();
    if state.cancel_on_disconnect {
        return Ok(engine.invoke(profile.as_ref(), request).await?);
    }
    let task = tokio::spawn(async move { engine.invoke(profile.as_ref(), request).await });
    Ok(task.await??)
}
