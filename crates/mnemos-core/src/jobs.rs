//! Background Jobs
//!
//! The ingest orchestrator fans out to a bounded job queue after commit:
//! embedding, connection synthesis, and tag suggestion run on worker tasks.
//! Failures log with the memory id; permanent failures park the memory on a
//! retry cursor instead of hot-looping. A locked session parks too: the jobs
//! need sub-keys and run again after the next unlock.

use std::sync::Arc;

use chrono::{Duration, Utc};
use tokio::sync::mpsc;

use crate::cortex::{
    ChunkPayload, ConnectionSynthesizer, EmbeddingProvider, LlmProvider, VectorPoint,
    VectorStore, chunk_text,
};
use crate::error::{CoreError, Result};
use crate::shield::{Envelope, Session};
use crate::storage::Storage;

/// What a job does to a memory
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobKind {
    Embed,
    Connect,
    TagSuggest,
}

impl JobKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            JobKind::Embed => "embed",
            JobKind::Connect => "connect",
            JobKind::TagSuggest => "tag_suggest",
        }
    }

    pub fn parse_name(s: &str) -> Option<Self> {
        match s {
            "embed" => Some(JobKind::Embed),
            "connect" => Some(JobKind::Connect),
            "tag_suggest" => Some(JobKind::TagSuggest),
            _ => None,
        }
    }
}

/// One queued unit of background work
#[derive(Debug, Clone)]
pub struct Job {
    pub memory_id: String,
    pub kind: JobKind,
}

/// Bounded sender half. A full queue is backpressure, not a crash.
#[derive(Clone)]
pub struct JobQueue {
    tx: mpsc::Sender<Job>,
}

impl JobQueue {
    pub fn new(capacity: usize) -> (Self, mpsc::Receiver<Job>) {
        let (tx, rx) = mpsc::channel(capacity.max(1));
        (Self { tx }, rx)
    }

    pub fn enqueue(&self, memory_id: &str, kind: JobKind) -> Result<()> {
        let job = Job {
            memory_id: memory_id.to_string(),
            kind,
        };
        self.tx.try_send(job).map_err(|e| match e {
            mpsc::error::TrySendError::Full(_) => {
                CoreError::QuotaExceeded("too many pending jobs".to_string())
            }
            mpsc::error::TrySendError::Closed(_) => CoreError::internal("job queue closed"),
        })
    }

    /// The post-ingest fan-out: embedding, connections, tag suggestions
    pub fn enqueue_derivations(&self, memory_id: &str) -> Result<()> {
        self.enqueue(memory_id, JobKind::Embed)?;
        self.enqueue(memory_id, JobKind::Connect)?;
        self.enqueue(memory_id, JobKind::TagSuggest)
    }
}

// ============================================================================
// WORKER
// ============================================================================

const TAG_SYSTEM: &str = "Suggest up to three short lowercase tags for this memory. \
Reply with a JSON array of strings only.";

/// How long a parked job waits before the retry loop re-enqueues it
const RETRY_DELAY_MINUTES: i64 = 30;

/// Processes queued jobs against the derived stores
pub struct JobWorker {
    storage: Arc<Storage>,
    session: Arc<Session>,
    embedder: Arc<dyn EmbeddingProvider>,
    vectors: Arc<dyn VectorStore>,
    synthesizer: Arc<ConnectionSynthesizer>,
    llm: Arc<dyn LlmProvider>,
}

impl JobWorker {
    pub fn new(
        storage: Arc<Storage>,
        session: Arc<Session>,
        embedder: Arc<dyn EmbeddingProvider>,
        vectors: Arc<dyn VectorStore>,
        synthesizer: Arc<ConnectionSynthesizer>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            storage,
            session,
            embedder,
            vectors,
            synthesizer,
            llm,
        }
    }

    /// Drain the queue until every sender is gone
    pub async fn run(self, mut rx: mpsc::Receiver<Job>) {
        while let Some(job) = rx.recv().await {
            self.handle(&job).await;
        }
        tracing::info!("job worker stopped");
    }

    /// Process one job, parking on failure
    pub async fn handle(&self, job: &Job) {
        match self.process(job).await {
            Ok(()) => {
                let _ = self.storage.clear_retry(&job.memory_id, job.kind.as_str());
            }
            Err(e) => {
                tracing::warn!(
                    memory_id = %job.memory_id,
                    kind = job.kind.as_str(),
                    "background job failed: {e:?}"
                );
                let next = Utc::now() + Duration::minutes(RETRY_DELAY_MINUTES);
                if let Err(park_err) = self.storage.park_retry(
                    &job.memory_id,
                    job.kind.as_str(),
                    &format!("{e:?}"),
                    next,
                ) {
                    tracing::warn!("retry cursor write failed: {park_err:?}");
                }
            }
        }
    }

    async fn process(&self, job: &Job) -> Result<()> {
        match job.kind {
            JobKind::Embed => self.embed_memory(&job.memory_id).await,
            JobKind::Connect => self.synthesizer.synthesize(&job.memory_id).await.map(|_| ()),
            JobKind::TagSuggest => self.tag_suggest(&job.memory_id).await,
        }
    }

    fn decrypt_text(&self, memory_id: &str) -> Result<(String, String)> {
        let memory = self.storage.require_memory(memory_id)?;
        let digest = memory.integrity_hash.clone();
        let text = self.session.with_keys(|keys| {
            let mut parts = Vec::new();
            for envelope in [&memory.title_envelope, &memory.content_envelope]
                .into_iter()
                .flatten()
            {
                parts.push(String::from_utf8_lossy(&envelope.decrypt(keys.kek())?).into_owned());
            }
            Ok(parts.join("\n"))
        })?;
        Ok((text, digest))
    }

    /// Chunk, embed, and upsert one memory's vectors. Chunk plaintext never
    /// reaches the vector store; only its envelope does.
    async fn embed_memory(&self, memory_id: &str) -> Result<()> {
        let (text, digest) = self.decrypt_text(memory_id)?;
        if text.trim().is_empty() {
            return Ok(());
        }
        // Re-chunking happens only on content update
        if self.storage.chunk_digest(memory_id)?.as_deref() == Some(digest.as_str()) {
            return Ok(());
        }

        let chunks = chunk_text(&text);
        let texts: Vec<String> = chunks.iter().map(|c| c.text.clone()).collect();
        let vectors = self.embedder.embed(&texts).await?;

        let mut points = Vec::with_capacity(chunks.len());
        for (chunk, vector) in chunks.iter().zip(vectors) {
            let envelope = self
                .session
                .with_keys(|keys| Envelope::encrypt(keys.kek(), chunk.text.as_bytes()))?;
            points.push(VectorPoint {
                memory_id: memory_id.to_string(),
                chunk_index: chunk.index,
                vector,
                payload: ChunkPayload {
                    memory_id: memory_id.to_string(),
                    chunk_index: chunk.index,
                    envelope,
                },
            });
        }

        self.vectors.delete_memory(memory_id).await?;
        let count = points.len() as u32;
        self.vectors.upsert(points).await?;
        self.storage
            .record_chunks(memory_id, self.embedder.model_id(), &digest, count)?;
        Ok(())
    }

    /// Ask the model for tags and land them as pending suggestions
    async fn tag_suggest(&self, memory_id: &str) -> Result<()> {
        let (text, _) = self.decrypt_text(memory_id)?;
        if text.trim().is_empty() {
            return Ok(());
        }
        let reply = self.llm.complete(TAG_SYSTEM, &text).await?;
        let tags: Vec<String> = serde_json::from_str(reply.trim()).unwrap_or_default();
        if tags.is_empty() {
            return Ok(());
        }
        let payload = serde_json::to_vec(&tags)?;
        let envelope = self
            .session
            .with_keys(|keys| Envelope::encrypt(keys.kek(), &payload))?;
        self.storage
            .insert_suggestion("tag", Some(memory_id), &envelope)?;
        Ok(())
    }

    /// Re-enqueue parked work whose cursor is due
    pub fn drain_retries(&self, queue: &JobQueue) -> Result<usize> {
        let due = self.storage.due_retries(Utc::now(), 64)?;
        let mut requeued = 0;
        for cursor in due {
            let Some(kind) = JobKind::parse_name(&cursor.job_kind) else {
                self.storage.clear_retry(&cursor.memory_id, &cursor.job_kind)?;
                continue;
            };
            match queue.enqueue(&cursor.memory_id, kind) {
                Ok(()) => requeued += 1,
                // Queue full: the cursor stays and the next drain retries
                Err(CoreError::QuotaExceeded(_)) => break,
                Err(e) => return Err(e),
            }
        }
        Ok(requeued)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn queue_backpressure_is_quota_exceeded() {
        let (queue, _rx) = JobQueue::new(2);
        queue.enqueue("m1", JobKind::Embed).unwrap();
        queue.enqueue("m1", JobKind::Connect).unwrap();
        assert!(matches!(
            queue.enqueue("m1", JobKind::TagSuggest),
            Err(CoreError::QuotaExceeded(_))
        ));
    }

    #[test]
    fn job_kind_round_trips() {
        for kind in [JobKind::Embed, JobKind::Connect, JobKind::TagSuggest] {
            assert_eq!(JobKind::parse_name(kind.as_str()), Some(kind));
        }
        assert_eq!(JobKind::parse_name("mystery"), None);
    }
}
