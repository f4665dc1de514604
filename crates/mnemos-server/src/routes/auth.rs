//! Auth Resource
//!
//! Bootstrapping: the client fetches salt and KDF parameters, derives the
//! master client-side, and exchanges {verifier, master-key} for tokens. The
//! server stretches the master into sub-keys and discards it; no key material
//! is ever persisted. Owner login deactivates heir mode.

use axum::Json;
use axum::extract::State;
use mnemos_core::shield::primitives;
use mnemos_core::storage::KdfConfig;
use mnemos_core::{CoreError, KdfParams, MasterKey, SessionMode};
use serde::{Deserialize, Serialize};

use crate::auth::{self, Bearer, TokenPair};
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ParamsResponse {
    pub salt: Option<String>,
    pub kdf_params: Option<KdfParams>,
    pub setup_required: bool,
}

/// GET /api/auth/params
pub async fn params(State(state): State<AppState>) -> ApiResult<Json<ParamsResponse>> {
    let config = state.storage.kdf_config()?;
    Ok(Json(ParamsResponse {
        salt: config.as_ref().map(|c| hex::encode(&c.salt)),
        kdf_params: config.as_ref().map(|c| c.params.clone()),
        setup_required: config.is_none(),
    }))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SetupRequest {
    pub salt: String,
    pub kdf_params: KdfParams,
    pub verifier: String,
    pub master_key_b64: String,
}

/// POST /api/auth/setup: once per installation
pub async fn setup(
    State(state): State<AppState>,
    Json(request): Json<SetupRequest>,
) -> ApiResult<Json<TokenPair>> {
    if request.kdf_params.memory_kib > state.config.kdf_memory_kib {
        return Err(CoreError::PreconditionFailed(format!(
            "kdf memory above the configured ceiling of {} KiB",
            state.config.kdf_memory_kib
        ))
        .into());
    }
    let salt = hex::decode(&request.salt).map_err(|_| CoreError::BadPassphrase)?;
    let verifier = hex::decode(&request.verifier).map_err(|_| CoreError::BadPassphrase)?;
    let master = MasterKey::from_b64(&request.master_key_b64)?;

    // The uploaded master must actually hash to the claimed verifier
    if !primitives::ct_eq(&master.verifier(), &verifier) {
        return Err(CoreError::BadPassphrase.into());
    }

    state.storage.save_kdf_config(&KdfConfig {
        salt,
        params: request.kdf_params,
        verifier: verifier.clone(),
    })?;
    state.session.unlock(master, &verifier, SessionMode::Owner)?;
    state.storage.append_audit("setup_completed", None)?;

    let pair = auth::issue_pair(&state.storage, &state.config)?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LoginRequest {
    pub verifier: String,
    pub master_key_b64: String,
}

/// POST /api/auth/login
pub async fn login(
    State(state): State<AppState>,
    Json(request): Json<LoginRequest>,
) -> ApiResult<Json<TokenPair>> {
    let stored = state
        .storage
        .kdf_config()?
        .ok_or_else(|| CoreError::PreconditionFailed("setup not completed".to_string()))?;
    let claimed = hex::decode(&request.verifier).map_err(|_| CoreError::BadPassphrase)?;
    if !primitives::ct_eq(&claimed, &stored.verifier) {
        return Err(CoreError::BadPassphrase.into());
    }

    let master = MasterKey::from_b64(&request.master_key_b64)?;
    state
        .session
        .unlock(master, &stored.verifier, SessionMode::Owner)?;

    // Owner re-unlock is the only path out of heir mode
    if state.storage.testament_config()?.heir_mode_active {
        state.storage.set_heir_mode(false)?;
        state.storage.append_audit("heir_mode_deactivated", None)?;
    }

    let pair = auth::issue_pair(&state.storage, &state.config)?;
    Ok(Json(pair))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RefreshRequest {
    pub refresh_token: String,
}

/// POST /api/auth/refresh: rotation, the presented token is burned
pub async fn refresh(
    State(state): State<AppState>,
    Json(request): Json<RefreshRequest>,
) -> ApiResult<Json<TokenPair>> {
    let pair = auth::rotate_refresh(&state.storage, &state.config, &request.refresh_token)?;
    Ok(Json(pair))
}

/// POST /api/auth/logout: revokes the caller's token and locks the session
pub async fn logout(
    State(state): State<AppState>,
    bearer: Bearer,
) -> ApiResult<Json<serde_json::Value>> {
    state.storage.revoke_auth_token(&auth::hash_token(&bearer.0))?;
    state.session.lock();
    Ok(Json(serde_json::json!({ "ok": true })))
}

/// POST /api/auth/lock: wipe keys without revoking tokens
pub async fn lock(
    State(state): State<AppState>,
    _authed: crate::auth::Authed,
) -> ApiResult<Json<serde_json::Value>> {
    state.session.lock();
    Ok(Json(serde_json::json!({ "locked": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RekeyRequest {
    pub old_master_key_b64: String,
    pub new_passphrase: String,
}

/// POST /api/auth/rekey: passphrase rotation over every stored envelope
pub async fn rekey(
    State(state): State<AppState>,
    _authed: crate::auth::Authed,
    Json(request): Json<RekeyRequest>,
) -> ApiResult<Json<mnemos_core::RekeySummary>> {
    let summary = state
        .rekey
        .rekey(&request.old_master_key_b64, &request.new_passphrase)
        .await?;
    // Old bearer tokens die with the old passphrase
    state.storage.revoke_all_tokens()?;
    Ok(Json(summary))
}
