//! Mnemos Server
//!
//! Single-owner encrypted second brain behind an authenticated HTTP/WebSocket
//! boundary: envelope-encrypted memories, blind-index search, an archival
//! vault with integrity auditing, hybrid RAG retrieval with streaming chat,
//! and a dead-man's-switch testament. Plaintext exists only transiently in
//! process memory; the session auto-locks when idle.

mod auth;
mod error;
mod routes;
mod state;

use std::sync::Arc;
use std::time::Duration;

use clap::Parser;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use mnemos_core::cortex::{
    ChatEngine, ConnectionSynthesizer, EmbeddingProvider, FallbackEmbedder, HttpEmbedder,
    HttpLlm, HttpVectorStore, HybridSearcher, MemoryVectorStore, VectorStore,
};
use mnemos_core::testament::{HeartbeatService, TestamentService};
use mnemos_core::vault::{Converter, SubprocessTransducer, run_audit};
use mnemos_core::{
    Config, JobQueue, JobWorker, Orchestrator, RekeyService, Scheduler, Session, Storage, Vault,
};

use crate::state::AppState;

#[derive(Debug, Parser)]
#[command(name = "mnemos-server", version, about = "Encrypted second-brain server")]
struct Args {
    /// Bind address (overrides MNEMOS_BIND)
    #[arg(long)]
    bind: Option<String>,

    /// Database file (overrides MNEMOS_DB_PATH)
    #[arg(long)]
    db_path: Option<std::path::PathBuf>,

    /// Vault root directory (overrides MNEMOS_VAULT_ROOT)
    #[arg(long)]
    vault_root: Option<std::path::PathBuf>,
}

fn build_embedder(config: &Config) -> anyhow::Result<Arc<dyn EmbeddingProvider>> {
    let primary = Arc::new(HttpEmbedder::new(
        config.embedding.primary.clone(),
        config.embedding.dimension,
        config.request_budget,
    )?);
    Ok(match &config.embedding.fallback {
        Some(fallback) => {
            let secondary = Arc::new(HttpEmbedder::new(
                fallback.clone(),
                config.embedding.dimension,
                config.request_budget,
            )?);
            Arc::new(FallbackEmbedder::new(primary, secondary)) as Arc<dyn EmbeddingProvider>
        }
        None => primary as Arc<dyn EmbeddingProvider>,
    })
}

async fn build_vectors(config: &Config) -> anyhow::Result<Arc<dyn VectorStore>> {
    Ok(match &config.vector.url {
        Some(url) => {
            let store =
                HttpVectorStore::new(url, &config.vector.collection, config.embedding.dimension)?;
            if let Err(e) = store.ensure_collection().await {
                warn!("vector collection bootstrap failed: {e}");
            }
            Arc::new(store) as Arc<dyn VectorStore>
        }
        None => {
            info!("no vector collection configured, using the in-process store");
            Arc::new(MemoryVectorStore::new(config.embedding.dimension)) as Arc<dyn VectorStore>
        }
    })
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let args = Args::parse();
    let mut config = Config::from_env();
    if let Some(bind) = args.bind {
        config.bind_addr = bind;
    }
    if let Some(path) = args.db_path {
        config.database_path = Some(path);
    }
    if let Some(root) = args.vault_root {
        config.vault_root = root;
    }
    let config = Arc::new(config);

    // Core components
    let storage = Arc::new(Storage::new(config.database_path.clone())?);
    let session = Arc::new(Session::new(config.session_idle_minutes));
    let vault = Arc::new(Vault::new(config.vault_root.clone())?);
    let embedder = build_embedder(&config)?;
    let vectors = build_vectors(&config).await?;
    let llm = Arc::new(HttpLlm::new(config.llm.clone(), config.request_budget)?);

    let converter = Converter::new(Arc::new(SubprocessTransducer::new(
        config.conversion.clone(),
    )));
    let (jobs, job_rx) = JobQueue::new(config.max_pending_jobs);

    let orchestrator = Arc::new(Orchestrator::new(
        Arc::clone(&storage),
        Arc::clone(&session),
        Arc::clone(&vault),
        converter,
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
        llm.clone(),
    ));
    let chat = Arc::new(ChatEngine::new(
        Arc::clone(&storage),
        Arc::clone(&session),
        Arc::clone(&searcher),
        llm.clone(),
    ));
    let heartbeat = Arc::new(HeartbeatService::new(
        Arc::clone(&storage),
        config.heartbeat.clone(),
    ));
    let testament = Arc::new(TestamentService::new(
        Arc::clone(&storage),
        Arc::clone(&session),
    ));
    let rekey = Arc::new(RekeyService::new(
        Arc::clone(&storage),
        Arc::clone(&session),
    ));

    // Worker pool for post-commit derivations
    let worker = JobWorker::new(
        Arc::clone(&storage),
        Arc::clone(&session),
        Arc::clone(&embedder),
        Arc::clone(&vectors),
        Arc::clone(&synthesizer),
        llm.clone(),
    );
    tokio::spawn(worker.run(job_rx));

    let last_audit = Arc::new(tokio::sync::RwLock::new(None));

    // Background loops
    let mut scheduler = Scheduler::new(Arc::clone(&storage), config.loop_failure_limit);
    {
        let heartbeat = Arc::clone(&heartbeat);
        scheduler.register("heartbeat-escalation", chrono::Duration::days(1), move || {
            let heartbeat = Arc::clone(&heartbeat);
            async move {
                heartbeat.tick(chrono::Utc::now())?;
                Ok(())
            }
        })?;
    }
    {
        let storage = Arc::clone(&storage);
        let vault = Arc::clone(&vault);
        let last_audit = Arc::clone(&last_audit);
        scheduler.register("vault-audit", chrono::Duration::hours(6), move || {
            let storage = Arc::clone(&storage);
            let vault = Arc::clone(&vault);
            let last_audit = Arc::clone(&last_audit);
            async move {
                let report = run_audit(&storage, &vault).await?;
                *last_audit.write().await = Some(report);
                Ok(())
            }
        })?;
    }
    {
        let session = Arc::clone(&session);
        scheduler.register("session-idle-lock", chrono::Duration::minutes(1), move || {
            let session = Arc::clone(&session);
            async move {
                if session.lock_if_idle() {
                    info!("session auto-locked after idle window");
                }
                Ok(())
            }
        })?;
    }
    {
        let worker = JobWorker::new(
            Arc::clone(&storage),
            Arc::clone(&session),
            Arc::clone(&embedder),
            Arc::clone(&vectors),
            Arc::clone(&synthesizer),
            llm.clone(),
        );
        let jobs = jobs.clone();
        scheduler.register("retry-drain", chrono::Duration::minutes(10), move || {
            let jobs = jobs.clone();
            // drain_retries only reads cursors and re-enqueues
            let requeued = worker.drain_retries(&jobs);
            async move {
                let n = requeued?;
                if n > 0 {
                    info!(requeued = n, "retry cursors re-enqueued");
                }
                Ok(())
            }
        })?;
    }
    {
        let storage = Arc::clone(&storage);
        scheduler.register("token-sweep", chrono::Duration::hours(12), move || {
            let storage = Arc::clone(&storage);
            async move {
                storage.purge_expired_tokens()?;
                Ok(())
            }
        })?;
    }
    let scheduler = Arc::new(scheduler);
    tokio::spawn(Arc::clone(&scheduler).run(Duration::from_secs(30)));

    let state = AppState {
        config: Arc::clone(&config),
        storage,
        session,
        vault,
        vectors,
        orchestrator,
        searcher,
        chat,
        heartbeat,
        testament,
        rekey,
        jobs,
        last_audit,
    };

    let app = routes::router(state)
        .layer(tower_http::trace::TraceLayer::new_for_http())
        .layer(tower_http::cors::CorsLayer::permissive())
        .layer(axum::extract::DefaultBodyLimit::max(config.max_payload_bytes))
        .layer(tower_http::limit::RequestBodyLimitLayer::new(
            config.max_payload_bytes,
        ));

    let listener = tokio::net::TcpListener::bind(&config.bind_addr).await?;
    info!("mnemos-server v{} listening on {}", mnemos_core::VERSION, config.bind_addr);
    axum::serve(listener, app)
        .with_graceful_shutdown(async {
            let _ = tokio::signal::ctrl_c().await;
            info!("shutting down");
        })
        .await?;
    Ok(())
}
