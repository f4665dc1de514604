//! Persons and Owner Profile Resources
//!
//! Persons are shared entities memories link to; unlinking never deletes
//! them. The owner profile is a singleton, and linking its self-person is
//! the only path that stamps the "self" relationship.

use axum::Json;
use axum::extract::{Path, State};
use chrono::NaiveDate;
use mnemos_core::model::{OwnerRelationship, Person};
use mnemos_core::{CoreError, OwnerProfile};
use serde::Deserialize;

use crate::auth::Authed;
use crate::error::ApiResult;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PersonRequest {
    pub display_name: String,
    pub external_id: Option<String>,
    pub relationship: Option<String>,
    pub deceased: Option<bool>,
}

/// GET /api/persons
pub async fn list(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<Vec<Person>>> {
    Ok(Json(state.storage.list_persons()?))
}

/// POST /api/persons
pub async fn create(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<PersonRequest>,
) -> ApiResult<(axum::http::StatusCode, Json<Person>)> {
    state.session.require_writable()?;
    let mut person = Person::new(request.display_name.trim());
    person.external_id = request.external_id;
    person.relationship = request
        .relationship
        .as_deref()
        .and_then(OwnerRelationship::parse_name)
        // The self relationship only ever comes from the owner profile link
        .filter(|r| *r != OwnerRelationship::SelfOwner);
    person.deceased = request.deceased.unwrap_or(false);
    // The display name is also kept as an envelope so re-key covers it
    person.name_envelope = Some(
        state
            .session
            .with_keys(|keys| {
                mnemos_core::Envelope::encrypt(keys.kek(), person.display_name.as_bytes())
            })?,
    );
    state.storage.insert_person(&person)?;
    Ok((axum::http::StatusCode::CREATED, Json(person)))
}

/// PATCH /api/persons/{id}
pub async fn update(
    State(state): State<AppState>,
    _authed: Authed,
    Path(id): Path<String>,
    Json(request): Json<PersonRequest>,
) -> ApiResult<Json<Person>> {
    state.session.require_writable()?;
    let mut person = state
        .storage
        .person(&id)?
        .ok_or_else(|| CoreError::NotFound(format!("person {id}")))?;
    person.display_name = request.display_name.trim().to_string();
    person.external_id = request.external_id;
    if let Some(relationship) = request.relationship.as_deref() {
        person.relationship = OwnerRelationship::parse_name(relationship)
            .filter(|r| *r != OwnerRelationship::SelfOwner)
            .or(person.relationship);
    }
    if let Some(deceased) = request.deceased {
        person.deceased = deceased;
    }
    state.storage.update_person(&person)?;
    Ok(Json(person))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProfileRequest {
    pub display_name: String,
    pub birthdate: Option<NaiveDate>,
    pub bio: Option<String>,
    pub self_person_id: Option<String>,
}

/// GET /api/profile
pub async fn get_profile(
    State(state): State<AppState>,
    _authed: Authed,
) -> ApiResult<Json<Option<OwnerProfile>>> {
    Ok(Json(state.storage.owner_profile()?))
}

/// PUT /api/profile
pub async fn put_profile(
    State(state): State<AppState>,
    _authed: Authed,
    Json(request): Json<ProfileRequest>,
) -> ApiResult<Json<OwnerProfile>> {
    state.session.require_writable()?;
    let profile = OwnerProfile {
        display_name: request.display_name,
        birthdate: request.birthdate,
        bio: request.bio,
        self_person_id: request.self_person_id,
    };
    state.storage.set_owner_profile(&profile)?;
    Ok(Json(profile))
}
