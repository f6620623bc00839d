//! Feedback endpoints: correct a past prediction and follow the fine-tune
//! it triggers

use std::sync::atomic::Ordering;
use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};
use uuid::Uuid;

use super::predict::decode_image;
use crate::server::{error::ApiError, state::ServerState};
use crate::storage::FeedbackUpdate;
use crate::training::{FeedbackEvent, FineTuneStatus};

pub fn create_router() -> Router<ServerState> {
    Router::new()
        .route("/feedback", post(submit_feedback))
        .route("/feedback/:prediction_id", get(feedback_status))
}

#[derive(Debug, Deserialize)]
pub struct FeedbackRequest {
    pub prediction_id: Uuid,
    pub correct_label: String,
    /// Base64-encoded image the prediction was made on
    pub image: String,
}

#[derive(Debug, Serialize)]
pub struct FeedbackAccepted {
    pub prediction_id: Uuid,
    pub archive: FeedbackUpdate,
    pub status_url: String,
}

/// Record a correction and queue a single-sample fine-tune.
///
/// The label and image are checked before the archive is touched. Returns
/// once the event is queued; the model update itself completes in the
/// background.
async fn submit_feedback(
    State(state): State<ServerState>,
    Json(request): Json<FeedbackRequest>,
) -> Result<(StatusCode, Json<FeedbackAccepted>), ApiError> {
    state.fine_tune.pipeline().validate_label(&request.correct_label)?;
    let image_bytes = decode_image(&request.image)?;
    let preprocessor = Arc::clone(&state.preprocessor);
    let image_bytes = tokio::task::spawn_blocking(move || {
        preprocessor.decode(&image_bytes).map(|_| image_bytes)
    })
    .await??;

    let archive = state
        .archive
        .apply_feedback(request.prediction_id, &request.correct_label)
        .await?;
    if archive == FeedbackUpdate::NotFound {
        return Err(ApiError::not_found(format!(
            "prediction {} not found",
            request.prediction_id
        )));
    }
    state.metrics.feedback_received.fetch_add(1, Ordering::Relaxed);

    let event = FeedbackEvent {
        prediction_id: request.prediction_id,
        correct_label: request.correct_label,
        image_bytes,
    };
    let handle = state.fine_tune.submit(event)?;
    let prediction_id = request.prediction_id;
    tokio::spawn(async move {
        match handle.await {
            Ok(Ok(outcome)) => info!(
                "Feedback for {} produced snapshot v{}",
                prediction_id, outcome.new_version
            ),
            Ok(Err(e)) => warn!("Feedback for {} not applied: {}", prediction_id, e),
            Err(e) => warn!("Fine-tune task for {} did not complete: {}", prediction_id, e),
        }
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(FeedbackAccepted {
            prediction_id,
            archive,
            status_url: format!("/feedback/{}", prediction_id),
        }),
    ))
}

async fn feedback_status(
    State(state): State<ServerState>,
    Path(prediction_id): Path<Uuid>,
) -> Result<Json<FineTuneStatus>, ApiError> {
    state
        .fine_tune
        .status(&prediction_id)
        .map(Json)
        .ok_or_else(|| ApiError::not_found(format!("no fine-tune recorded for {}", prediction_id)))
}
