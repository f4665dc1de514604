//! Health Resource
//!
//! Surfaces the last vault audit, loop states, and session posture.

use axum::Json;
use axum::extract::State;

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/health
pub async fn health(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<serde_json::Value>> {
    let audit = state.last_audit.read().await.clone();
    let loops = state.storage.loop_states()?;
    Ok(Json(serde_json::json!({
        "version": mnemos_core::VERSION,
        "sessionUnlocked": state.session.is_unlocked(),
        "heirMode": state.storage.testament_config()?.heir_mode_active,
        "lastAudit": audit,
        "loops": loops,
    })))
}

/// GET /healthz: unauthenticated liveness probe, no state exposed
pub async fn healthz() -> Json<serde_json::Value> {
    Json(serde_json::json!({ "ok": true }))
}
