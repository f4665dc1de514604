//! Bearer Token Auth
//!
//! Login issues a short-lived access token and a rotation refresh token.
//! Tokens are random 256-bit values handed to the client once; the database
//! stores only their blake3 hashes. Refresh rotates: the presented refresh
//! token is revoked and a fresh pair is issued.

use axum::extract::FromRequestParts;
use axum::http::request::Parts;
use chrono::{Duration, Utc};
use mnemos_core::{Config, CoreError, Storage};
use rand::RngCore;
use serde::Serialize;

use crate::error::ApiError;

pub const ACCESS_KIND: &str = "access";
pub const REFRESH_KIND: &str = "refresh";

/// Access + refresh pair returned to the client
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TokenPair {
    pub access_token: String,
    pub refresh_token: String,
    /// Access token lifetime in seconds
    pub expires_in: i64,
}

fn new_token() -> String {
    let mut bytes = [0u8; 32];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    format!("mn_{}", hex::encode(bytes))
}

/// Only hashes touch the database
pub fn hash_token(token: &str) -> String {
    blake3::hash(token.as_bytes()).to_hex().to_string()
}

/// Issue a fresh access/refresh pair
pub fn issue_pair(storage: &Storage, config: &Config) -> Result<TokenPair, CoreError> {
    let access = new_token();
    let refresh = new_token();
    let now = Utc::now();
    storage.insert_auth_token(
        &hash_token(&access),
        ACCESS_KIND,
        now + Duration::minutes(config.access_token_minutes),
    )?;
    storage.insert_auth_token(
        &hash_token(&refresh),
        REFRESH_KIND,
        now + Duration::days(config.refresh_token_days),
    )?;
    Ok(TokenPair {
        access_token: access,
        refresh_token: refresh,
        expires_in: config.access_token_minutes * 60,
    })
}

/// Verify an access token string (HTTP header or chat auth frame)
pub fn verify_access(storage: &Storage, token: &str) -> Result<(), CoreError> {
    storage.verify_auth_token(&hash_token(token), ACCESS_KIND)
}

/// Rotate a refresh token: revoke the old one, issue a new pair
pub fn rotate_refresh(
    storage: &Storage,
    config: &Config,
    refresh_token: &str,
) -> Result<TokenPair, CoreError> {
    let hash = hash_token(refresh_token);
    storage.verify_auth_token(&hash, REFRESH_KIND)?;
    storage.revoke_auth_token(&hash)?;
    issue_pair(storage, config)
}

// ============================================================================
// EXTRACTOR
// ============================================================================

/// The raw bearer credential from the Authorization header
pub struct Bearer(pub String);

impl<S: Send + Sync> FromRequestParts<S> for Bearer {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, Self::Rejection> {
        let header = parts
            .headers
            .get(axum::http::header::AUTHORIZATION)
            .and_then(|v| v.to_str().ok())
            .ok_or(ApiError(CoreError::AuthRequired))?;
        let token = header
            .strip_prefix("Bearer ")
            .ok_or(ApiError(CoreError::AuthRequired))?;
        Ok(Bearer(token.to_string()))
    }
}

/// Authenticated-route guard: resolves only for a live access token
pub struct Authed;

impl FromRequestParts<crate::state::AppState> for Authed {
    type Rejection = ApiError;

    async fn from_request_parts(
        parts: &mut Parts,
        state: &crate::state::AppState,
    ) -> Result<Self, Self::Rejection> {
        let Bearer(token) = Bearer::from_request_parts(parts, state).await?;
        verify_access(&state.storage, &token)?;
        Ok(Authed)
    }
}
