//! Vault Resource
//!
//! Serves decrypted file bytes. The default endpoint returns whichever
//! rendition the manifest marks served; `/preserved` always returns the
//! archival rendition. Retrieval re-verifies the stored plaintext digest for
//! byte-identical renditions.

use axum::Json;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, HeaderValue, header};
use mnemos_core::{CoreError, Source};

use crate::auth::Authed;
use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn serve_bytes(mime: &str, bytes: Vec<u8>) -> (HeaderMap, Vec<u8>) {
    let mut headers = HeaderMap::new();
    headers.insert(
        header::CONTENT_TYPE,
        HeaderValue::from_str(mime)
            .unwrap_or(HeaderValue::from_static("application/octet-stream")),
    );
    (headers, bytes)
}

fn retrieve(state: &AppState, source: &Source, archival: bool) -> Result<Vec<u8>, CoreError> {
    let dek = state
        .session
        .with_keys(|keys| source.dek_envelope.unwrap_dek(keys.file()))?;
    let path = if archival {
        &source.vault_path
    } else {
        source
            .original_vault_path
            .as_ref()
            .unwrap_or(&source.vault_path)
    };
    let bytes = state.vault.retrieve(&dek, path)?;

    // The integrity hash is of the pre-conversion original; it re-verifies
    // whenever we serve bytes the conversion left untouched
    let is_original_rendition = !archival || source.original_vault_path.is_none();
    if is_original_rendition {
        let digest = blake3::hash(&bytes).to_hex().to_string();
        if digest != source.integrity_hash {
            return Err(CoreError::TamperDetected);
        }
    }
    Ok(bytes)
}

/// GET /api/vault/{source_id}: the rendition the manifest marks served
pub async fn get(
    State(state): State<AppState>,
    _authed: Authed,
    Path(source_id): Path<String>,
) -> ApiResult<(HeaderMap, Vec<u8>)> {
    let source = state.storage.require_source(&source_id)?;
    let archival = source.serve_archival;
    let bytes = retrieve(&state, &source, archival).map_err(ApiError)?;
    let mime = if archival {
        mnemos_core::vault::plan(&source.mime).target_mime.to_string()
    } else {
        source.mime.clone()
    };
    Ok(serve_bytes(&mime, bytes))
}

/// GET /api/vault/{source_id}/preserved: always the archival rendition
pub async fn get_preserved(
    State(state): State<AppState>,
    _authed: Authed,
    Path(source_id): Path<String>,
) -> ApiResult<(HeaderMap, Vec<u8>)> {
    let source = state.storage.require_source(&source_id)?;
    let bytes = retrieve(&state, &source, true).map_err(ApiError)?;
    let mime = mnemos_core::vault::plan(&source.mime).target_mime.to_string();
    Ok(serve_bytes(&mime, bytes))
}

/// GET /api/vault/{source_id}/meta: manifest row with the filename opened
pub async fn meta(
    State(state): State<AppState>,
    _authed: Authed,
    Path(source_id): Path<String>,
) -> ApiResult<Json<serde_json::Value>> {
    let source = state.storage.require_source(&source_id)?;
    let filename = source
        .filename_envelope
        .as_ref()
        .map(|envelope| {
            state
                .session
                .with_keys(|keys| envelope.decrypt(keys.kek()))
                .map(|b| String::from_utf8_lossy(&b).into_owned())
        })
        .transpose()?;

    Ok(Json(serde_json::json!({
        "id": source.id,
        "memoryId": source.memory_id,
        "filename": filename,
        "mime": source.mime,
        "preservationFormat": source.preservation_format,
        "originalSize": source.original_size,
        "encryptedSize": source.encrypted_size,
        "integrityHash": source.integrity_hash,
        "servesArchival": source.serve_archival,
        "hasOriginalRendition": source.original_vault_path.is_some(),
        "createdAt": source.created_at,
    })))
}
