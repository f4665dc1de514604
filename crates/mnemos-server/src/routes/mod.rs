//! HTTP Routes
//!
//! Exact URL shapes are a UI concern; the contracts behind them are
//! bit-stable. Everything except auth bootstrap, heir unlock, and the
//! liveness probe requires a bearer access token.

pub mod auth;
pub mod chat;
pub mod health;
pub mod heartbeat;
pub mod ingest;
pub mod memories;
pub mod persons;
pub mod search;
pub mod suggestions;
pub mod testament;
pub mod vault;

use axum::Router;
use axum::routing::{delete, get, post};

use crate::state::AppState;

/// The full API router
pub fn router(state: AppState) -> Router {
    Router::new()
        // Auth
        .route("/api/auth/params", get(auth::params))
        .route("/api/auth/setup", post(auth::setup))
        .route("/api/auth/login", post(auth::login))
        .route("/api/auth/refresh", post(auth::refresh))
        .route("/api/auth/logout", post(auth::logout))
        .route("/api/auth/lock", post(auth::lock))
        .route("/api/auth/rekey", post(auth::rekey))
        // Memories
        .route("/api/memories", get(memories::list).post(memories::create))
        .route(
            "/api/memories/{id}",
            get(memories::get).patch(memories::update).delete(memories::soft_delete),
        )
        .route("/api/memories/{id}/purge", post(memories::purge))
        .route("/api/memories/{id}/connections", get(memories::connections))
        .route("/api/memories/{id}/persons", post(memories::link_person))
        .route("/api/memories/{id}/tags", post(memories::link_tag))
        .route(
            "/api/connections/{id}/promote",
            post(memories::promote_connection),
        )
        // Ingest
        .route("/api/ingest/file", post(ingest::file))
        .route("/api/ingest/text", post(ingest::text))
        .route("/api/ingest/url", post(ingest::url))
        // Tags
        .route("/api/tags", get(memories::list_tags))
        // Persons + profile
        .route("/api/persons", get(persons::list).post(persons::create))
        .route("/api/persons/{id}", axum::routing::patch(persons::update))
        .route(
            "/api/profile",
            get(persons::get_profile).put(persons::put_profile),
        )
        // Search
        .route("/api/search", get(search::search))
        // Chat
        .route("/api/chat/ws", get(chat::ws_handler))
        // Suggestions
        .route("/api/suggestions", get(suggestions::list))
        .route("/api/suggestions/{id}/accept", post(suggestions::accept))
        .route("/api/suggestions/{id}/dismiss", post(suggestions::dismiss))
        // Heartbeat
        .route("/api/heartbeat/challenge", post(heartbeat::challenge))
        .route("/api/heartbeat/checkin", post(heartbeat::checkin))
        .route("/api/heartbeat/status", get(heartbeat::status))
        // Testament
        .route(
            "/api/testament/config",
            get(testament::get_config).put(testament::put_config),
        )
        .route("/api/testament/shares/split", post(testament::split_shares))
        .route("/api/testament/unlock", post(testament::heir_unlock))
        .route(
            "/api/testament/heirs",
            get(testament::list_heirs).post(testament::create_heir),
        )
        .route("/api/testament/heirs/{id}", delete(testament::delete_heir))
        .route("/api/testament/audit", get(testament::audit_log))
        // Vault
        .route("/api/vault/{source_id}", get(vault::get))
        .route("/api/vault/{source_id}/preserved", get(vault::get_preserved))
        .route("/api/vault/{source_id}/meta", get(vault::meta))
        // Health
        .route("/api/health", get(health::health))
        .route("/healthz", get(health::healthz))
        .with_state(state)
}
