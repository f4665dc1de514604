//! Ingest Resource
//!
//! File ingest is multipart (the file part plus optional captured_at and
//! parent_id fields); text ingest is JSON. URL capture is declared but not
//! implemented and says so specifically.

use axum::Json;
use axum::extract::{Multipart, State};
use axum::http::StatusCode;
use chrono::{DateTime, Utc};
use mnemos_core::{CoreError, FileIngest, IngestOutcome, MemoryMetadata, SourceClass, TextCapture};
use serde::Deserialize;

use crate::auth::Authed;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// POST /api/ingest/file
pub async fn file(
    State(state): State<AppState>,
    _authed: Authed,
    mut multipart: Multipart,
) -> ApiResult<(StatusCode, Json<IngestOutcome>)> {
    let mut bytes: Option<Vec<u8>> = None;
    let mut declared_mime: Option<String> = None;
    let mut filename: Option<String> = None;
    let mut captured_at: Option<DateTime<Utc>> = None;
    let mut parent_id: Option<String> = None;

    while let Some(field) = multipart.next_field().await.map_err(|e| {
        ApiError(CoreError::PreconditionFailed(format!("multipart: {e}")))
    })? {
        match field.name().unwrap_or_default() {
            "file" => {
                declared_mime = field.content_type().map(|m| m.to_string());
                filename = field.file_name().map(|n| n.to_string());
                let data = field.bytes().await.map_err(|e| {
                    ApiError(CoreError::QuotaExceeded(format!("upload: {e}")))
                })?;
                bytes = Some(data.to_vec());
            }
            "captured_at" => {
                let text = field.text().await.unwrap_or_default();
                captured_at = text.parse().ok();
            }
            "parent_id" => {
                let text = field.text().await.unwrap_or_default();
                if !text.is_empty() {
                    parent_id = Some(text);
                }
            }
            _ => {}
        }
    }

    let bytes = bytes.ok_or_else(|| {
        ApiError(CoreError::PreconditionFailed("missing file part".to_string()))
    })?;
    // Fall back to extension sniffing when the client sent no content type
    let declared_mime = declared_mime
        .filter(|m| !m.is_empty() && m != "application/octet-stream")
        .or_else(|| {
            filename.as_deref().map(|name| {
                mime_guess::from_path(name).first_or_octet_stream().to_string()
            })
        })
        .unwrap_or_else(|| "application/octet-stream".to_string());

    let outcome = state
        .orchestrator
        .ingest_file(FileIngest {
            bytes,
            declared_mime,
            filename,
            captured_at,
            parent_id,
            metadata: MemoryMetadata::default(),
            keep_original: true,
        })
        .await?;

    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TextRequest {
    pub title: Option<String>,
    pub content: String,
    #[serde(default)]
    pub metadata: MemoryMetadata,
    pub captured_at: Option<DateTime<Utc>>,
    pub parent_id: Option<String>,
    pub source_class: Option<String>,
}

/// POST /api/ingest/text
pub async fn text(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<TextRequest>,
) -> ApiResult<(StatusCode, Json<IngestOutcome>)> {
    let outcome = state
        .orchestrator
        .ingest_text(TextCapture {
            title: request.title,
            content: request.content,
            metadata: request.metadata,
            captured_at: request.captured_at,
            parent_id: request.parent_id,
            source_class: request
                .source_class
                .as_deref()
                .map(SourceClass::parse_name)
                .unwrap_or(SourceClass::Api),
            visibility: Default::default(),
        })
        .await?;
    let status = if outcome.created {
        StatusCode::CREATED
    } else {
        StatusCode::OK
    };
    Ok((status, Json(outcome)))
}

/// POST /api/ingest/url: declared but not implemented
pub async fn url(
    State(_state): State<AppState>,
    _authed: Authed,
) -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_IMPLEMENTED,
        Json(serde_json::json!({
            "error": "url ingest is not implemented; fetch the page and use /api/ingest/file"
        })),
    )
}
