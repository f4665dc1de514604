//! Shared Application State

use std::sync::Arc;

use mnemos_core::cortex::{ChatEngine, HybridSearcher, VectorStore};
use mnemos_core::testament::{HeartbeatService, TestamentService};
use mnemos_core::vault::AuditReport;
use mnemos_core::{
    Config, JobQueue, Orchestrator, RekeyService, Session, Storage, Vault,
};
use tokio::sync::RwLock;

/// Everything a handler can reach. Cloning is cheap; all members are shared.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub storage: Arc<Storage>,
    pub session: Arc<Session>,
    pub vault: Arc<Vault>,
    pub vectors: Arc<dyn VectorStore>,
    pub orchestrator: Arc<Orchestrator>,
    pub searcher: Arc<HybridSearcher>,
    pub chat: Arc<ChatEngine>,
    pub heartbeat: Arc<HeartbeatService>,
    pub testament: Arc<TestamentService>,
    pub rekey: Arc<RekeyService>,
    pub jobs: JobQueue,
    /// Last vault audit, surfaced on the health channel
    pub last_audit: Arc<RwLock<Option<AuditReport>>>,
}
