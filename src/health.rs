use axum::{extract::State, http::StatusCode, Json};
use serde::Serialize;
use std::sync::Arc;

use crate::envelope::now_timestamp;
use crate::types::RelayError;
use crate::AppState;

#[derive(Serialize)]
pub struct LivenessResponse {
    pub status: &'static str,
    pub timestamp: String,
}

#[derive(Serialize)]
pub struct ReadinessResponse {
    pub status: &'static str,
    pub provider: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub need: Vec<&'static str>,
}

pub async fn liveness() -> Json<LivenessResponse> {
    Json(LivenessResponse {
        status: "ok",
        timestamp: now_timestamp(),
    })
}

/// Ready once the provider settings resolve.
pub async fn readiness(
    State(state): State<Arc<AppState>>,
) -> (StatusCode, Json<ReadinessResponse>) {
    match state.provider.resolve(None) {
        Ok(provider) => (
            StatusCode::OK,
            Json(ReadinessResponse {
                status: "ready",
                provider: provider.name,
                need: Vec::new(),
            }),
        ),
        Err(e) => {
            tracing::error!("Readiness check: {}", e.inner);
            let need = match e.inner {
                RelayError::MissingConfig(need) => need,
                _ => Vec::new(),
            };
            (
                StatusCode::SERVICE_UNAVAILABLE,
                Json(ReadinessResponse {
                    status: "unready",
                    provider: state.provider.name.clone(),
                    need,
                }),
            )
        }
    }
}
