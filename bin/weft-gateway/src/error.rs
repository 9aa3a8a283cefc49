//! Unified gateway error type.
//!
//! Every handler returns `Result<T, ApiError>`, which implements
//! [`axum::response::IntoResponse`] so errors are automatically converted
//! to a JSON-body HTTP response with an appropriate status code.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::Json;
use serde_json::json;
use thiserror::Error;

/// All errors that can occur in the gateway request lifecycle.
#[derive(Debug, Error)]
pub enum ApiError {
    /// The request body is not decodable JSON for the expected uplet shape.
    #[error("Error decoding body to JSON: {0}")]
    Decode(String),

    /// The uplet decoded but violates a data-model invariant.
    #[error("Invalid {kind}-uplet: {reason}")]
    InvalidUplet { kind: &'static str, reason: String },

    /// The broker refused the publish.
    #[error("Failed to push task into broker: {0}")]
    Broker(String),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self {
            ApiError::Decode(_) | ApiError::InvalidUplet { .. } => StatusCode::BAD_REQUEST,
            ApiError::Broker(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (status, Json(json!({ "error": self.to_string() }))).into_response()
    }
}
