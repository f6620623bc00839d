//! Mapping of service errors onto HTTP responses

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use tracing::error;

use crate::error::Error;

/// Error returned by route handlers
#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    Service(Error),
}

impl ApiError {
    pub fn not_found(msg: impl Into<String>) -> Self {
        ApiError::NotFound(msg.into())
    }

    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::NotFound(_) => StatusCode::NOT_FOUND,
            ApiError::Service(Error::Busy { .. }) => StatusCode::CONFLICT,
            ApiError::Service(Error::EmptyDataset) => StatusCode::UNPROCESSABLE_ENTITY,
            ApiError::Service(Error::NoPreviousSnapshot) => StatusCode::CONFLICT,
            ApiError::Service(e) if e.is_client_error() => StatusCode::BAD_REQUEST,
            ApiError::Service(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }
}

impl From<Error> for ApiError {
    fn from(err: Error) -> Self {
        ApiError::Service(err)
    }
}

impl From<tokio::task::JoinError> for ApiError {
    fn from(err: tokio::task::JoinError) -> Self {
        ApiError::Service(Error::internal(format!("worker task failed: {}", err)))
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = self.status();
        let message = match &self {
            ApiError::NotFound(msg) => msg.clone(),
            ApiError::Service(e) => e.to_string(),
        };
        if status.is_server_error() {
            error!("Request failed: {}", message);
        }

        let mut body = serde_json::json!({ "error": message });
        if let ApiError::Service(Error::InvalidLabel { expected, .. }) = &self {
            body["valid_labels"] = serde_json::json!(expected);
        }
        (status, Json(body)).into_response()
    }
}
