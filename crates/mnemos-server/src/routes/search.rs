//! Search Resource

use axum::Json;
use axum::extract::{Query, State};
use mnemos_core::cortex::{SearchFilters, SearchMode, SearchResponse};
use mnemos_core::ContentType;
use serde::Deserialize;

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "snake_case")]
pub struct SearchParams {
    pub q: String,
    pub mode: Option<String>,
    pub top_k: Option<usize>,
    pub content_type: Option<String>,
    /// Comma-separated tag ids
    pub tag_ids: Option<String>,
    /// Comma-separated person ids
    pub person_ids: Option<String>,
}

/// GET /api/search
pub async fn search(
    State(state): State<AppState>,
    _authed: Authed,
    Query(params): Query<SearchParams>,
) -> ApiResult<Json<SearchResponse>> {
    let filters = SearchFilters {
        content_type: params.content_type.as_deref().map(ContentType::parse_name),
        tag_ids: params
            .tag_ids
            .as_deref()
            .map(|s| s.split(',').filter_map(|p| p.trim().parse().ok()).collect())
            .unwrap_or_default(),
        person_ids: params
            .person_ids
            .as_deref()
            .map(|s| {
                s.split(',')
                    .map(|p| p.trim().to_string())
                    .filter(|p| !p.is_empty())
                    .collect()
            })
            .unwrap_or_default(),
    };

    let response = state
        .searcher
        .search(
            &params.q,
            params.mode.as_deref().map(SearchMode::parse_name).unwrap_or_default(),
            params.top_k.unwrap_or(20),
            &filters,
        )
        .await?;
    Ok(Json(response))
}
