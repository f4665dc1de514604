//! Heartbeat Resource

use axum::Json;
use axum::extract::State;
use chrono::{DateTime, Utc};
use mnemos_core::HeartbeatStatus;
use mnemos_core::model::HeartbeatChallenge;
use serde::{Deserialize, Serialize};

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

/// POST /api/heartbeat/challenge
pub async fn challenge(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<HeartbeatChallenge>> {
    Ok(Json(state.heartbeat.issue_challenge(Utc::now())?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinRequest {
    pub challenge: String,
    pub response_hmac: String,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CheckinResponse {
    pub ok: bool,
    pub next_due: DateTime<Utc>,
}

/// POST /api/heartbeat/checkin
pub async fn checkin(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<CheckinRequest>,
) -> ApiResult<Json<CheckinResponse>> {
    let next_due = state
        .heartbeat
        .checkin(&request.challenge, &request.response_hmac, Utc::now())?;
    Ok(Json(CheckinResponse { ok: true, next_due }))
}

/// GET /api/heartbeat/status
pub async fn status(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<HeartbeatStatus>> {
    Ok(Json(state.heartbeat.status(Utc::now())?))
}
