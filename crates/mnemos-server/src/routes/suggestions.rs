//! Suggestions Resource
//!
//! Pending AI-proposed actions. Accepting a tag suggestion applies it;
//! terminal transitions are irreversible and a second transition conflicts.

use axum::Json;
use axum::extract::{Path, Query, State};
use mnemos_core::{Suggestion, SuggestionStatus};
use serde::Deserialize;

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct ListParams {
    pub status: Option<String>,
}

/// GET /api/suggestions
pub async fn list(
    State(state): State<AppState>,
    _authed: Authed,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<Vec<Suggestion>>> {
    let status = params.status.as_deref().map(SuggestionStatus::parse_name);
    Ok(Json(state.storage.list_suggestions(status)?))
}

/// POST /api/suggestions/{id}/accept
pub async fn accept(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<i64>,
) -> ApiResult<Json<Suggestion>> {
    state.session.require_writable()?;
    let suggestion = state.storage.resolve_suggestion(id, SuggestionStatus::Accepted)?;

    // Tag suggestions apply on acceptance
    if suggestion.kind == "tag" {
        if let Some(memory_id) = &suggestion.memory_id {
            let payload = state
                .session
                .with_keys(|keys| suggestion.payload_envelope.decrypt(keys.kek()))?;
            let tags: Vec<String> = serde_json::from_slice(&payload).unwrap_or_default();
            for name in tags {
                let tag = state.storage.ensure_tag(&name, None)?;
                state.storage.tag_memory(memory_id, tag.id)?;
            }
        }
    }
    Ok(Json(suggestion))
}

/// POST /api/suggestions/{id}/dismiss
pub async fn dismiss(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<i64>,
) -> ApiResult<Json<Suggestion>> {
    state.session.require_writable()?;
    Ok(Json(
        state.storage.resolve_suggestion(id, SuggestionStatus::Dismissed)?,
    ))
}
