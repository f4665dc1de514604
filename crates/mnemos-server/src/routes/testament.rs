//! Testament Resource

use axum::Json;
use axum::extract::{Path, State};
use mnemos_core::model::{AuditLogEntry, Heir, TestamentConfig};
use mnemos_core::testament::{ShareBundle, new_heir};
use serde::Deserialize;

use crate::auth::{self, Authed, TokenPair};
use crate::error::ApiResult;
use crate::state::AppState;

/// GET /api/testament/config
pub async fn get_config(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<TestamentConfig>> {
    Ok(Json(state.testament.config()?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfigRequest {
    pub k: u8,
    pub n: u8,
}

/// PUT /api/testament/config: changing the scheme invalidates old shares
pub async fn put_config(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<ConfigRequest>,
) -> ApiResult<Json<TestamentConfig>> {
    Ok(Json(state.testament.put_config(request.k, request.n)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SplitRequest {
    /// The master is re-uploaded transiently; it is verified, split, wiped
    pub master_key_b64: String,
    pub passphrase: Option<String>,
}

/// POST /api/testament/shares/split
pub async fn split_shares(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<SplitRequest>,
) -> ApiResult<Json<ShareBundle>> {
    let bundle = state
        .testament
        .split_shares(&request.master_key_b64, request.passphrase.as_deref())?;
    Ok(Json(bundle))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeirUnlockRequest {
    pub shares: Vec<String>,
    pub passphrase: Option<String>,
}

/// POST /api/testament/unlock: heir-mode session from combined shares.
/// Unauthenticated: the shares themselves are the credential.
pub async fn heir_unlock(
    State(state): State<AppState>,
    Json(request): Json<HeirUnlockRequest>,
) -> ApiResult<Json<TokenPair>> {
    state
        .testament
        .unlock_with_shares(&request.shares, request.passphrase.as_deref())?;
    let pair = auth::issue_pair(&state.storage, &state.config)?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct HeirRequest {
    pub name: String,
    pub email: String,
    pub phone: Option<String>,
}

/// GET /api/testament/heirs
pub async fn list_heirs(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<Vec<Heir>>> {
    Ok(Json(state.testament.list_heirs()?))
}

/// POST /api/testament/heirs
pub async fn create_heir(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<HeirRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Heir>)> {
    let heir = new_heir(&request.name, &request.email, request.phone);
    state.testament.upsert_heir(&heir)?;
    Ok((axum::http::StatusCode::CREATED, Json(heir)))
}

/// DELETE /api/testament/heirs/{id}
pub async fn delete_heir(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.testament.delete_heir(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// GET /api/testament/audit: append-only proof of activity
pub async fn audit_log(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<Vec<AuditLogEntry>>> {
    Ok(Json(state.storage.audit_log(200, 0)?))
}
