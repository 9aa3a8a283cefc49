//! Ingestion routes: validate uplets and enqueue them on the broker.

use std::sync::Arc;

use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use axum::{Json, Router};
use bytes::Bytes;
use serde_json::{json, Value};
use tracing::info;

use weft_broker::{Producer, Topic};
use weft_types::{LearnUplet, PredUplet};

use crate::error::ApiError;

/// State shared across all HTTP handlers.
pub struct AppState {
    pub producer: Arc<dyn Producer>,
}

const ROUTES: [&str; 4] = ["/", "/health", "/learn", "/pred"];

/// Build the complete gateway [`Router`].
pub fn build(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/learn", post(post_learnuplet))
        .route("/pred", post(post_preduplet))
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .with_state(state)
}

/// Route listing, so the API is discoverable with a bare GET.
async fn index() -> Json<Value> {
    Json(json!(ROUTES))
}

/// Heartbeat endpoint for load balancers and monitoring.
async fn health() -> Json<Value> {
    Json(json!({ "status": "ok" }))
}

/// Validate a learn-uplet and enqueue it on the `train` topic.
async fn post_learnuplet(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let uplet: LearnUplet =
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
    uplet.validate().map_err(|e| ApiError::InvalidUplet {
        kind: "learn",
        reason: e.to_string(),
    })?;

    // Re-serialise so the broker carries the canonical form, not the raw
    // request body.
    let message = serde_json::to_vec(&uplet).map_err(|e| ApiError::Decode(e.to_string()))?;
    state
        .producer
        .publish(Topic::Train, message)
        .await
        .map_err(|e| ApiError::Broker(e.to_string()))?;

    info!(key = %uplet.key, "learn-uplet enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Learn-uplet ingested accordingly" })),
    ))
}

/// Validate a pred-uplet and enqueue it on the `predict` topic.
async fn post_preduplet(
    State(state): State<Arc<AppState>>,
    body: Bytes,
) -> Result<(StatusCode, Json<Value>), ApiError> {
    let uplet: PredUplet =
        serde_json::from_slice(&body).map_err(|e| ApiError::Decode(e.to_string()))?;
    uplet.validate().map_err(|e| ApiError::InvalidUplet {
        kind: "pred",
        reason: e.to_string(),
    })?;

    let message = serde_json::to_vec(&uplet).map_err(|e| ApiError::Decode(e.to_string()))?;
    state
        .producer
        .publish(Topic::Predict, message)
        .await
        .map_err(|e| ApiError::Broker(e.to_string()))?;

    info!(key = %uplet.key, "pred-uplet enqueued");
    Ok((
        StatusCode::ACCEPTED,
        Json(json!({ "message": "Pred-uplet ingested" })),
    ))
}

// ── Tests ─────────────────────────────────────────────────────────────────────
