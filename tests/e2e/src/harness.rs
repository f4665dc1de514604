//! Test Harness
//!
//! A full engine wired against the deterministic mocks and a temp-dir
//! database + vault. Jobs run only when a test drains them, so every test
//! controls exactly when derivations happen.

use std::sync::Arc;

use mnemos_core::cortex::{
    ChatEngine, ConnectionSynthesizer, HybridSearcher, MemoryVectorStore, VectorStore,
};
use mnemos_core::testament::{HeartbeatService, TestamentService};
use mnemos_core::vault::Converter;
use mnemos_core::{
    Config, JobQueue, JobWorker, MasterKey, Orchestrator, Session, SessionMode, Storage, Vault,
};
use mnemos_core::shield::KdfParams;
use mnemos_core::storage::KdfConfig;
use tokio::sync::mpsc;

use crate::mocks::{FakeTransducer, MOCK_DIM, MockEmbedder, MockLlm};

/// Fixed master key bytes for the test owner
pub const MASTER_BYTES: [u8; 32] = [0x5Au8; 32];

/// A fully wired engine over temp storage
pub struct TestEnv {
    pub dir: tempfile::TempDir,
    pub storage: Arc<Storage>,
    pub session: Arc<Session>,
    pub vault: Arc<Vault>,
    pub vectors: Arc<dyn VectorStore>,
    pub llm: Arc<MockLlm>,
    pub orchestrator: Arc<Orchestrator>,
    pub searcher: Arc<HybridSearcher>,
    pub chat: Arc<ChatEngine>,
    pub heartbeat: Arc<HeartbeatService>,
    pub testament: Arc<TestamentService>,
    pub jobs: JobQueue,
    worker: JobWorker,
    job_rx: mpsc::Receiver<mnemos_core::jobs::Job>,
    pub db_path: std::path::PathBuf,
}

impl TestEnv {
    /// Engine with the default fake transducer and mock models, owner
    /// session unlocked.
    pub fn new() -> Self {
        Self::with_llm(MockLlm::new("You met Anna in Lyon in 2021."))
    }

    pub fn with_llm(llm: MockLlm) -> Self {
        let dir = tempfile::tempdir().unwrap();
        let db_path = dir.path().join("mnemos.db");
        let storage = Arc::new(Storage::new(Some(db_path.clone())).unwrap());
        let session = Arc::new(Session::new(15));
        let vault = Arc::new(Vault::new(dir.path().join("vault")).unwrap());

        // Setup + unlock the owner with a fixed master
        let master = MasterKey::from_bytes(MASTER_BYTES);
        let verifier = master.verifier();
        storage
            .save_kdf_config(&KdfConfig {
                salt: vec![3u8; 32],
                params: KdfParams::default(),
                verifier: verifier.to_vec(),
            })
            .unwrap();
        session.unlock(master, &verifier, SessionMode::Owner).unwrap();

        let embedder: Arc<dyn mnemos_core::EmbeddingProvider> = Arc::new(MockEmbedder::new());
        let vectors: Arc<dyn VectorStore> = Arc::new(MemoryVectorStore::new(MOCK_DIM));
        let llm = Arc::new(llm);
        let config = Config::default();

        let (jobs, job_rx) = JobQueue::new(config.max_pending_jobs);
        let orchestrator = Arc::new(Orchestrator::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&vault),
            Converter::new(Arc::new(FakeTransducer)),
            jobs.clone(),
            config.max_payload_bytes,
        ));
        let searcher = Arc::new(HybridSearcher::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&embedder),
            Arc::clone(&vectors),
        ));
        let synthesizer = Arc::new(ConnectionSynthesizer::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            llm.clone() as Arc<dyn mnemos_core::LlmProvider>,
        ));
        let chat = Arc::new(ChatEngine::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&searcher),
            llm.clone() as Arc<dyn mnemos_core::LlmProvider>,
        ));
        let heartbeat = Arc::new(HeartbeatService::new(
            Arc::clone(&storage),
            config.heartbeat.clone(),
        ));
        let testament = Arc::new(TestamentService::new(
            Arc::clone(&storage),
            Arc::clone(&session),
        ));
        let worker = JobWorker::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            Arc::clone(&synthesizer),
            llm.clone() as Arc<dyn mnemos_core::LlmProvider>,
        );

        Self {
            dir,
            storage,
            session,
            vault,
            vectors,
            llm,
            orchestrator,
            searcher,
            chat,
            heartbeat,
            testament,
            jobs,
            worker,
            job_rx,
            db_path,
        }
    }

    /// Run every queued background job to completion
    pub async fn drain_jobs(&mut self) {
        while let Ok(job) = self.job_rx.try_recv() {
            self.worker.handle(&job).await;
        }
    }

    /// Raw database bytes (main file plus WAL), for encryption-at-rest scans
    pub fn db_bytes(&self) -> Vec<u8> {
        let mut bytes = std::fs::read(&self.db_path).unwrap();
        let wal = self.db_path.with_extension("db-wal");
        if let Ok(mut wal_bytes) = std::fs::read(wal) {
            bytes.append(&mut wal_bytes);
        }
        bytes
    }

    /// Base64 of the owner master key, for testament operations
    pub fn master_b64(&self) -> String {
        use base64::Engine;
        base64::engine::general_purpose::STANDARD.encode(MASTER_BYTES)
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}
