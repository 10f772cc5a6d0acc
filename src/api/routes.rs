//! API route definitions.

use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::{json, Value};

use crate::api::state::AppState;
use crate::trigger::TriggerOutcome;

type ApiResult = Result<Json<Value>, (StatusCode, Json<Value>)>;

pub fn api_routes() -> Router<AppState> {
    Router::new()
        .route("/health", get(health))
        .route("/status", get(status))
        .route("/threshold", get(get_threshold).put(set_threshold))
        .route("/trigger", post(manual_trigger))
        .route("/triggers", get(list_triggers))
}

fn error(status: StatusCode, message: impl Into<String>) -> (StatusCode, Json<Value>) {
    (status, Json(json!({ "error": { "message": message.into() } })))
}

async fn health() -> Json<Value> {
    Json(json!({
        "data": {
            "status": "ok",
            "version": env!("CARGO_PKG_VERSION")
        },
        "meta": {
            "timestamp": chrono::Utc::now().to_rfc3339(),
            "version": env!("CARGO_PKG_VERSION")
        }
    }))
}

async fn status(State(state): State<AppState>) -> Json<Value> {
    let monitor = &state.monitor;
    let recorder = monitor.controller().snapshot().await;
    Json(json!({
        "data": {
            "detection_enabled": monitor.detection_enabled(),
            "trigger_in_flight": monitor.trigger_in_flight(),
            "detector": monitor.metrics(),
            "recorder": recorder,
        },
        "meta": { "timestamp": chrono::Utc::now().to_rfc3339() }
    }))
}

async fn get_threshold(State(state): State<AppState>) -> ApiResult {
    let handle = state
        .monitor
        .threshold()
        .ok_or_else(|| error(StatusCode::CONFLICT, "threshold scorer is not active"))?;
    Ok(Json(json!({ "data": { "threshold": handle.get() } })))
}

#[derive(Debug, Deserialize)]
struct ThresholdUpdate {
    threshold: f32,
}

async fn set_threshold(
    State(state): State<AppState>,
    Json(update): Json<ThresholdUpdate>,
) -> ApiResult {
    let handle = state
        .monitor
        .threshold()
        .ok_or_else(|| error(StatusCode::CONFLICT, "threshold scorer is not active"))?;
    if !update.threshold.is_finite() || update.threshold <= 0.0 {
        return Err(error(StatusCode::BAD_REQUEST, "threshold must be a positive number"));
    }

    let previous = handle.get();
    handle.set(update.threshold);
    tracing::info!(previous, threshold = update.threshold, "threshold updated");
    Ok(Json(json!({ "data": { "threshold": update.threshold, "previous": previous } })))
}

async fn manual_trigger(State(state): State<AppState>) -> ApiResult {
    match state.monitor.manual_trigger().await {
        TriggerOutcome::Completed(report) => Ok(Json(json!({
            "data": report,
            "meta": { "exported": report.exported(), "failed": report.failed() }
        }))),
        TriggerOutcome::Dropped => {
            Err(error(StatusCode::CONFLICT, "a trigger is already in progress"))
        }
        TriggerOutcome::ExportFailed(reason) => {
            Err(error(StatusCode::INTERNAL_SERVER_ERROR, reason))
        }
    }
}

#[derive(Debug, Deserialize)]
struct ListParams {
    #[serde(default = "default_limit")]
    limit: usize,
}

fn default_limit() -> usize {
    50
}

async fn list_triggers(
    State(state): State<AppState>,
    Query(params): Query<ListParams>,
) -> ApiResult {
    let Some(log) = state.trigger_log.clone() else {
        return Ok(Json(json!({ "data": [], "meta": { "total": 0 } })));
    };
    let limit = params.limit.min(500);
    let records = tokio::task::spawn_blocking(move || log.list_recent(limit))
        .await
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?
        .map_err(|e| error(StatusCode::INTERNAL_SERVER_ERROR, e.to_string()))?;

    Ok(Json(json!({ "data": records, "meta": { "total": records.len() } })))
}
