//! Prediction endpoint

use std::sync::atomic::Ordering;

use axum::{extract::State, routing::post, Json, Router};
use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::Deserialize;
use tracing::debug;

use crate::error::Error;
use crate::inference::{predict, PredictionRecord};
use crate::server::{error::ApiError, state::ServerState};

pub fn create_router() -> Router<ServerState> {
    Router::new().route("/predict", post(predict_image))
}

#[derive(Debug, Deserialize)]
pub struct PredictRequest {
    /// Base64-encoded image file
    pub image: String,
    #[serde(default)]
    pub filename: Option<String>,
    #[serde(default)]
    pub user_id: Option<String>,
}

pub(crate) fn decode_image(encoded: &str) -> Result<Vec<u8>, Error> {
    let bytes = STANDARD
        .decode(encoded.trim())
        .map_err(|e| Error::InvalidImage(format!("image is not valid base64: {}", e)))?;
    if bytes.is_empty() {
        return Err(Error::InvalidImage("image is empty".into()));
    }
    Ok(bytes)
}

/// Classify an uploaded image against the current snapshot
async fn predict_image(
    State(state): State<ServerState>,
    Json(request): Json<PredictRequest>,
) -> Result<Json<PredictionRecord>, ApiError> {
    let result = run_prediction(&state, request).await;
    if result.is_err() {
        state.metrics.failed_predictions.fetch_add(1, Ordering::Relaxed);
    }
    result.map(Json)
}

async fn run_prediction(
    state: &ServerState,
    request: PredictRequest,
) -> Result<PredictionRecord, ApiError> {
    let bytes = decode_image(&request.image)?;

    let snapshot = state.manager.current_snapshot();
    let classes = snapshot.shared_classes();
    let preprocessor = state.preprocessor.clone();
    let (prediction, bytes) = tokio::task::spawn_blocking(move || {
        let input = preprocessor.decode(&bytes)?;
        predict(&snapshot, &input).map(|p| (p, bytes))
    })
    .await??;

    let record = PredictionRecord::from_prediction(&prediction, &classes)
        .with_user(request.user_id)
        .with_filename(request.filename);
    state.archive.store(&record, Some(&bytes)).await?;
    state.metrics.record_prediction(record.latency_seconds);

    debug!(
        "Prediction {}: {} ({:.3}) from v{}",
        record.id, record.predicted_class, record.confidence, record.snapshot_version
    );
    Ok(record)
}
