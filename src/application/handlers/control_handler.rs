use axum::{
    extract::State,
    http::StatusCode,
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use std::sync::Arc;

use crate::application::session_controller::{ControlError, SessionController, SessionStatus};

/// Body of `POST /bot/start`
#[derive(Debug, Default, Serialize, Deserialize)]
pub struct StartRequest {
    /// Trade this market first instead of the scheduled window
    pub market_id: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct ControlResponse {
    pub status: String,
    pub message: String,
}

/// Error response
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

type ApiError = (StatusCode, Json<ErrorResponse>);

fn conflict(error: ControlError) -> ApiError {
    (
        StatusCode::CONFLICT,
        Json(ErrorResponse {
            error: error.to_string(),
        }),
    )
}

pub fn router(controller: Arc<SessionController>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/bot/status", get(bot_status))
        .route("/bot/start", post(start_bot))
        .route("/bot/stop", post(stop_bot))
        .with_state(controller)
}

pub async fn health() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "status": "ok" }))
}

pub async fn bot_status(State(controller): State<Arc<SessionController>>) -> Json<SessionStatus> {
    Json(controller.status().await)
}

pub async fn start_bot(
    State(controller): State<Arc<SessionController>>,
    body: Option<Json<StartRequest>>,
) -> Result<Json<ControlResponse>, ApiError> {
    let market_id = body
        .and_then(|Json(request)| request.market_id)
        .filter(|id| !id.trim().is_empty());

    controller
        .start(market_id.clone())
        .await
        .map_err(conflict)?;

    Ok(Json(ControlResponse {
        status: "started".to_string(),
        message: match market_id {
            Some(id) => format!("Trading market {}", id),
            None => "Trading the current window".to_string(),
        },
    }))
}

pub async fn stop_bot(
    State(controller): State<Arc<SessionController>>,
) -> Result<Json<ControlResponse>, ApiError> {
    controller.stop().await.map_err(conflict)?;
    Ok(Json(ControlResponse {
        status: "stopped".to_string(),
        message: "Orders cancelled and state saved".to_string(),
    }))
}
