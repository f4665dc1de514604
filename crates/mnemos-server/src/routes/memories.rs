//! Memories Resource
//!
//! CRUD plus the filtered list. Responses carry transiently-decrypted
//! plaintext (the session keys live only in memory); geo filters decrypt the
//! candidate metadata in-process because coordinates are never persisted in
//! the clear. `has_location=false` is a no-op and returns all memories.

use axum::Json;
use axum::extract::{Path, Query, State};
use chrono::{DateTime, Utc};
use mnemos_core::ingest::MemoryPatch;
use mnemos_core::model::{LinkProvenance, MemoryPerson};
use mnemos_core::storage::{MemoryListFilter, VisibilityFilter};
use mnemos_core::{
    Connection, ContentType, CoreError, Memory, MemoryMetadata, SourceClass, TextCapture,
    Visibility,
};
use serde::{Deserialize, Serialize};

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

// ============================================================================
// VIEWS
// ============================================================================

/// A memory with its envelopes opened for the response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct MemoryView {
    pub id: String,
    pub captured_at: DateTime<Utc>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub content_type: ContentType,
    pub source_class: SourceClass,
    pub visibility: Visibility,
    pub title: Option<String>,
    pub content: Option<String>,
    pub metadata: Option<MemoryMetadata>,
    pub integrity_hash: String,
    pub parent_id: Option<String>,
    pub source_id: Option<String>,
    pub has_location: bool,
}

fn decrypt_view(state: &AppState, memory: &Memory) -> Result<MemoryView, CoreError> {
    state.session.with_keys(|keys| {
        let title = memory
            .title_envelope
            .as_ref()
            .map(|e| e.decrypt(keys.kek()))
            .transpose()?
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let content = memory
            .content_envelope
            .as_ref()
            .map(|e| e.decrypt(keys.kek()))
            .transpose()?
            .map(|b| String::from_utf8_lossy(&b).into_owned());
        let metadata: Option<MemoryMetadata> = memory
            .metadata_envelope
            .as_ref()
            .map(|e| e.decrypt(keys.kek()))
            .transpose()?
            .and_then(|b| serde_json::from_slice(&b).ok());

        // Text captures hash their content; file memories hash the original
        // file bytes and are re-verified on vault retrieval instead
        if memory.source_id.is_none() {
            if let Some(content) = &content {
                let digest = blake3::hash(content.as_bytes()).to_hex().to_string();
                if digest != memory.integrity_hash {
                    return Err(CoreError::TamperDetected);
                }
            }
        }

        Ok(MemoryView {
            id: memory.id.clone(),
            captured_at: memory.captured_at,
            created_at: memory.created_at,
            updated_at: memory.updated_at,
            content_type: memory.content_type,
            source_class: memory.source_class,
            visibility: memory.visibility,
            title,
            content,
            metadata,
            integrity_hash: memory.integrity_hash.clone(),
            parent_id: memory.parent_id.clone(),
            source_id: memory.source_id.clone(),
            has_location: memory.has_location,
        })
    })
}

// ============================================================================
// LIST
// ============================================================================

#[derive(Debug, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub struct ListParams {
    pub skip: Option<i64>,
    pub limit: Option<i64>,
    pub content_type: Option<String>,
    /// Comma-separated tag ids
    pub tag_ids: Option<String>,
    /// Comma-separated person ids
    pub person_ids: Option<String>,
    pub year: Option<i32>,
    pub visibility: Option<String>,
    pub date_from: Option<DateTime<Utc>>,
    pub date_to: Option<DateTime<Utc>>,
    /// "lat,lng,radius_km"
    pub near: Option<String>,
    pub has_location: Option<bool>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ListResponse {
    pub memories: Vec<MemoryView>,
    pub total: usize,
}

struct GeoFilter {
    lat: f64,
    lng: f64,
    radius_km: f64,
}

fn parse_near(raw: &str) -> Result<GeoFilter, CoreError> {
    let parts: Vec<&str> = raw.split(',').collect();
    if parts.len() != 3 {
        return Err(CoreError::PreconditionFailed(
            "near expects lat,lng,radius_km".to_string(),
        ));
    }
    let parse = |s: &str| {
        s.trim()
            .parse::<f64>()
            .map_err(|_| CoreError::PreconditionFailed("near expects numbers".to_string()))
    };
    Ok(GeoFilter {
        lat: parse(parts[0])?,
        lng: parse(parts[1])?,
        radius_km: parse(parts[2])?,
    })
}

/// Great-circle distance in kilometers
fn haversine_km(lat1: f64, lng1: f64, lat2: f64, lng2: f64) -> f64 {
    const EARTH_RADIUS_KM: f64 = 6371.0;
    let d_lat = (lat2 - lat1).to_radians();
    let d_lng = (lng2 - lng1).to_radians();
    let a = (d_lat / 2.0).sin().powi(2)
        + lat1.to_radians().cos() * lat2.to_radians().cos() * (d_lng / 2.0).sin().powi(2);
    2.0 * EARTH_RADIUS_KM * a.sqrt().atan2((1.0 - a).sqrt())
}

fn parse_id_list(raw: &Option<String>) -> Vec<String> {
    raw.as_deref()
        .map(|s| {
            s.split(',')
                .map(|p| p.trim().to_string())
                .filter(|p| !p.is_empty())
                .collect()
        })
        .unwrap_or_default()
}

/// GET /api/memories
pub async fn list(
    State(state): State<AppState>,
    _authed: Authed,
    Query(params): Query<ListParams>,
) -> ApiResult<Json<ListResponse>> {
    let geo = params.near.as_deref().map(parse_near).transpose()?;
    let tag_ids: Vec<i64> = parse_id_list(&params.tag_ids)
        .iter()
        .filter_map(|s| s.parse().ok())
        .collect();

    let filter = MemoryListFilter {
        skip: params.skip.unwrap_or(0),
        limit: params.limit.unwrap_or(50).clamp(1, 500),
        content_type: params.content_type.as_deref().map(ContentType::parse_name),
        tag_ids,
        person_ids: parse_id_list(&params.person_ids),
        year: params.year,
        visibility: params
            .visibility
            .as_deref()
            .map(VisibilityFilter::parse_name)
            .unwrap_or_default(),
        date_from: params.date_from,
        date_to: params.date_to,
        // A geo query only makes sense over located memories
        has_location: if geo.is_some() {
            Some(true)
        } else {
            params.has_location
        },
        include_deleted: false,
    };

    let rows = state.storage.list_memories(&filter)?;
    let mut memories = Vec::with_capacity(rows.len());
    for row in &rows {
        let view = decrypt_view(&state, row)?;
        if let Some(geo) = &geo {
            let Some(metadata) = &view.metadata else { continue };
            let (Some(lat), Some(lng)) = (metadata.latitude, metadata.longitude) else {
                continue;
            };
            if haversine_km(geo.lat, geo.lng, lat, lng) > geo.radius_km {
                continue;
            }
        }
        memories.push(view);
    }

    Ok(Json(ListResponse {
        total: memories.len(),
        memories,
    }))
}

// ============================================================================
// CRUD
// ============================================================================

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateRequest {
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: MemoryMetadata,
    pub captured_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub visibility: Option<String>,
}

/// POST /api/memories: manual text capture
pub async fn create(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<CreateRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<mnemos_core::IngestOutcome>)> {
    let outcome = state
        .orchestrator
        .ingest_text(TextCapture {
            title: request.title,
            content: request.content,
            metadata: request.metadata,
            captured_at: request.captured_at,
            parent_id: request.parent_id,
            source_class: SourceClass::Manual,
            visibility: request
                .visibility
                .as_deref()
                .map(Visibility::parse_name)
                .unwrap_or_default(),
        })
        .await?;
    // Dedup short-circuit reports the existing memory, not a creation
    let status = if outcome.created {
        axum::http::StatusCode::CREATED
    } else {
        axum::http::StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

/// GET /api/memories/{id}
pub async fn get(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
) -> ApiResult<Json<MemoryView>> {
    let memory = state.storage.require_memory(&id)?;
    Ok(Json(decrypt_view(&state, &memory)?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UpdateRequest {
    /// Double option: absent leaves the title, null clears it
    #[serde(default, with = "double_option")]
    pub title: Option<Option<String>>,
    pub content: Option<String>,
    pub metadata: Option<MemoryMetadata>,
    pub visibility: Option<String>,
    pub captured_at: Option<DateTime<Utc>>,
}

mod double_option {
    use serde::{Deserialize, Deserializer};

    pub fn deserialize<'de, D: Deserializer<'de>>(
        de: D,
    ) -> Result<Option<Option<String>>, D::Error> {
        Option::<String>::deserialize(de).map(Some)
    }
}

/// PATCH /api/memories/{id}: all-or-nothing per field envelope triple
pub async fn update(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
    Json(request): Json<UpdateRequest>,
) -> ApiResult<Json<MemoryView>> {
    let patch = MemoryPatch {
        title: request.title,
        content: request.content,
        metadata: request.metadata,
        visibility: request.visibility.as_deref().map(Visibility::parse_name),
        captured_at: request.captured_at,
    };
    let updated = state.orchestrator.update_memory_fields(&id, patch).await?;
    Ok(Json(decrypt_view(&state, &updated)?))
}

/// DELETE /api/memories/{id}: soft delete
pub async fn soft_delete(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.session.require_writable()?;
    state.storage.soft_delete_memory(&id)?;
    Ok(Json(serde_json::json!({ "deleted": true })))
}

/// POST /api/memories/{id}/purge: hard delete, unlinking vault and vectors
pub async fn purge(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    state.orchestrator.purge(&id, state.vectors.as_ref()).await?;
    Ok(Json(serde_json::json!({ "purged": true })))
}

// ============================================================================
// GRAPH
// ============================================================================

/// GET /api/memories/{id}/connections
pub async fn connections(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
) -> ApiResult<Json<Vec<Connection>>> {
    state.storage.require_memory(&id)?;
    Ok(Json(state.storage.connections_for_memory(&id)?))
}

/// POST /api/connections/{id}/promote: user takes ownership of an edge
pub async fn promote_connection(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<i64>,
) -> ApiResult<Json<serde_json::Value>> {
    state.session.require_writable()?;
    state.storage.promote_connection(id)?;
    Ok(Json(serde_json::json!({ "promoted": true })))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkPersonRequest {
    pub person_id: String,
    pub provenance: Option<String>,
    pub confidence: Option<f64>,
}

/// POST /api/memories/{id}/persons: linking twice reports the existing link
pub async fn link_person(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
    Json(request): Json<LinkPersonRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<serde_json::Value>)> {
    state.session.require_writable()?;
    state.storage.require_memory(&id)?;
    state
        .storage
        .person(&request.person_id)?
        .ok_or_else(|| CoreError::NotFound(format!("person {}", request.person_id)))?;

    let created = state.storage.link_person(&MemoryPerson {
        memory_id: id,
        person_id: request.person_id,
        provenance: request
            .provenance
            .as_deref()
            .map(LinkProvenance::parse_name)
            .unwrap_or_default(),
        confidence: request.confidence,
    })?;
    let status = if created {
        axum::http::StatusCode::CREATED
    } else {
        axum::http::StatusCode::OK
    };
    Ok((status, Json(serde_json::json!({ "linked": true, "created": created }))))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct LinkTagRequest {
    pub name: String,
    pub color: Option<String>,
}

/// POST /api/memories/{id}/tags: get-or-create the tag, then link
pub async fn link_tag(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
    Json(request): Json<LinkTagRequest>,
) -> ApiResult<Json<serde_json::Value>> {
    state.session.require_writable()?;
    state.storage.require_memory(&id)?;
    let tag = state.storage.ensure_tag(&request.name, request.color.as_deref())?;
    let created = state.storage.tag_memory(&id, tag.id)?;
    Ok(Json(serde_json::json!({ "tag": tag, "created": created })))
}

/// GET /api/tags
pub async fn list_tags(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<Vec<mnemos_core::Tag>>> {
    Ok(Json(state.storage.list_tags()?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn near_parses_three_floats() {
        let geo = parse_near("48.8566, 2.3522, 10").unwrap();
        assert_eq!(geo.lat, 48.8566);
        assert_eq!(geo.radius_km, 10.0);
        assert!(parse_near("48.8566,2.3522").is_err());
        assert!(parse_near("a,b,c").is_err());
    }

    #[test]
    fn haversine_paris_to_lyon() {
        // Paris → Lyon is roughly 392 km
        let d = haversine_km(48.8566, 2.3522, 45.7640, 4.8357);
        assert!((d - 392.0).abs() < 10.0, "got {d}");
        assert!(haversine_km(48.0, 2.0, 48.0, 2.0) < 1e-9);
    }

    #[test]
    fn id_list_parsing() {
        assert_eq!(
            parse_id_list(&Some("a, b,,c".to_string())),
            vec!["a", "b", "c"]
        );
        assert!(parse_id_list(&None).is_empty());
    }
}
