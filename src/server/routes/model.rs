//! Model management endpoints

use axum::{
    extract::State,
    routing::{get, post},
    Json, Router,
};
use serde::Deserialize;
use tracing::info;

use crate::error::Error;
use crate::evaluation::{evaluate, EvaluationReport};
use crate::server::{error::ApiError, state::ServerState};

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/model", get(model_info))
        .route("/model/rollback", post(rollback))
        .route("/evaluate", post(evaluate_current))
}

/// Current snapshot, fine-tune activity and request counters
async fn model_info(State(state): State<ServerState>) -> Json<serde_json::Value> {
    let snapshot = state.manager.current_snapshot();
    Json(serde_json::json!({
        "version": snapshot.version(),
        "created_at": snapshot.created_at(),
        "previous_version": state.manager.previous_version(),
        "classes": snapshot.classes(),
        "network": snapshot.config(),
        "fine_tune_active": state.manager.is_fine_tune_active(),
        "fine_tune": state.fine_tune.stats(),
        "metrics": state.metrics.get_metrics(),
    }))
}

/// Republish the previous snapshot's parameters as a new version
async fn rollback(State(state): State<ServerState>) -> Result<Json<serde_json::Value>, ApiError> {
    let manager = state.manager.clone();
    let snapshot = tokio::task::spawn_blocking(move || manager.rollback()).await??;
    info!("Rollback via API published v{}", snapshot.version());
    Ok(Json(serde_json::json!({
        "version": snapshot.version(),
        "previous_version": state.manager.previous_version(),
    })))
}

#[derive(Debug, Default, Deserialize)]
pub struct EvaluateRequest {
    #[serde(default)]
    pub batch_size: Option<usize>,
}

/// Score the current snapshot on the configured dataset
async fn evaluate_current(
    State(state): State<ServerState>,
    request: Option<Json<EvaluateRequest>>,
) -> Result<Json<EvaluationReport>, ApiError> {
    let dataset = state
        .eval_dataset
        .clone()
        .ok_or_else(|| Error::invalid_input("no evaluation dataset configured"))?;
    let batch_size = request
        .and_then(|Json(r)| r.batch_size)
        .unwrap_or(state.eval_batch_size);

    let snapshot = state.manager.current_snapshot();
    let report =
        tokio::task::spawn_blocking(move || evaluate(&snapshot, dataset.as_ref(), batch_size))
            .await??;
    Ok(Json(report))
}
