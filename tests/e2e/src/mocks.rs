//! Deterministic mocks for the external collaborators: the embedding model,
//! the chat model, and the conversion transducers. No network, no clock, no
//! randomness: every test run sees identical behavior.

use std::sync::Mutex;

use async_trait::async_trait;
use mnemos_core::cortex::{EmbeddingProvider, LlmProvider};
use mnemos_core::vault::{ToolClass, Transducer};
use mnemos_core::{CoreError, Result};
use tokio::sync::mpsc;

/// Mock embedding dimension
pub const MOCK_DIM: usize = 32;

/// Bag-of-words embedder: each word hashes into one of MOCK_DIM buckets.
/// Texts sharing words land near each other under cosine; a pure function of
/// the input text.
pub struct MockEmbedder {
    model: String,
}

impl MockEmbedder {
    pub fn new() -> Self {
        Self {
            model: "mock-embed-v1".to_string(),
        }
    }

    pub fn with_model(model: &str) -> Self {
        Self {
            model: model.to_string(),
        }
    }

    fn vectorize(text: &str) -> Vec<f32> {
        let mut vector = vec![0.0f32; MOCK_DIM];
        for word in text.to_lowercase().split_whitespace() {
            let word: String = word.chars().filter(|c| c.is_alphanumeric()).collect();
            if word.is_empty() {
                continue;
            }
            let digest = blake3::hash(word.as_bytes());
            let bucket = digest.as_bytes()[0] as usize % MOCK_DIM;
            vector[bucket] += 1.0;
        }
        let norm: f32 = vector.iter().map(|x| x * x).sum::<f32>().sqrt();
        if norm > 0.0 {
            for x in &mut vector {
                *x /= norm;
            }
        }
        vector
    }
}

impl Default for MockEmbedder {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl EmbeddingProvider for MockEmbedder {
    fn model_id(&self) -> &str {
        &self.model
    }

    fn dimension(&self) -> usize {
        MOCK_DIM
    }

    async fn embed(&self, texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Ok(texts.iter().map(|t| Self::vectorize(t)).collect())
    }
}

/// An embedder that always fails, for retry-cursor paths
pub struct DownEmbedder;

#[async_trait]
impl EmbeddingProvider for DownEmbedder {
    fn model_id(&self) -> &str {
        "down-embed"
    }
    fn dimension(&self) -> usize {
        MOCK_DIM
    }
    async fn embed(&self, _texts: &[String]) -> Result<Vec<Vec<f32>>> {
        Err(CoreError::ModelUnavailable("endpoint down".to_string()))
    }
}

/// Scripted chat model: `complete` pops queued replies (falling back to a
/// default), `stream` emits the reply word by word.
pub struct MockLlm {
    replies: Mutex<Vec<String>>,
    default_reply: String,
}

impl MockLlm {
    pub fn new(default_reply: &str) -> Self {
        Self {
            replies: Mutex::new(Vec::new()),
            default_reply: default_reply.to_string(),
        }
    }

    /// Queue a one-shot reply consumed before the default
    pub fn push_reply(&self, reply: &str) {
        self.replies.lock().unwrap().insert(0, reply.to_string());
    }

    fn next_reply(&self) -> String {
        self.replies
            .lock()
            .unwrap()
            .pop()
            .unwrap_or_else(|| self.default_reply.clone())
    }
}

#[async_trait]
impl LlmProvider for MockLlm {
    fn model_id(&self) -> &str {
        "mock-llm-v1"
    }

    async fn complete(&self, _system: &str, _user: &str) -> Result<String> {
        Ok(self.next_reply())
    }

    async fn stream(
        &self,
        _system: &str,
        _user: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let reply = self.next_reply();
        for word in reply.split_inclusive(' ') {
            if tx.send(word.to_string()).await.is_err() {
                break;
            }
        }
        Ok(reply)
    }
}

/// PNG magic prefix emitted by the fake image transducer
pub const PNG_MAGIC: [u8; 8] = [0x89, b'P', b'N', b'G', b'\r', b'\n', 0x1a, b'\n'];

/// Stand-in for the external tools: prepends a format marker so tests can
/// tell renditions apart without shelling out.
pub struct FakeTransducer;

#[async_trait]
impl Transducer for FakeTransducer {
    async fn transduce(
        &self,
        class: ToolClass,
        input: &[u8],
        _input_ext: &str,
        _output_ext: &str,
    ) -> Result<Vec<u8>> {
        let mut out = match class {
            ToolClass::Image => PNG_MAGIC.to_vec(),
            ToolClass::Audio => b"fLaC".to_vec(),
            ToolClass::Video => b"\x1aE\xdf\xa3".to_vec(),
            ToolClass::Document => b"%PDF-1.7\n".to_vec(),
        };
        out.extend_from_slice(input);
        Ok(out)
    }

    async fn extract_text(&self, archival: &[u8]) -> Result<Option<String>> {
        Ok(Some(String::from_utf8_lossy(archival).into_owned()))
    }
}

/// A transducer that always fails, for ConversionFailed paths
pub struct BrokenTransducer;

#[async_trait]
impl Transducer for BrokenTransducer {
    async fn transduce(
        &self,
        _class: ToolClass,
        _input: &[u8],
        _input_ext: &str,
        _output_ext: &str,
    ) -> Result<Vec<u8>> {
        Err(CoreError::ConversionFailed("tool exited 1".to_string()))
    }

    async fn extract_text(&self, _archival: &[u8]) -> Result<Option<String>> {
        Err(CoreError::ConversionFailed("tool exited 1".to_string()))
    }
}
