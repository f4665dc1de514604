//! LLM Provider
//!
//! Chat-completion client for connection explanations, tag suggestions,
//! conversation titles, and the RAG answer stream. The HTTP implementation
//! speaks the line-delimited JSON chat shape; every call carries a deadline
//! and transient failures retry with the shared backoff policy.

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::mpsc;

use super::embed::{MAX_ATTEMPTS, backoff_delay};
use crate::config::ModelEndpoint;
use crate::error::{CoreError, Result};

/// An external chat model
#[async_trait]
pub trait LlmProvider: Send + Sync {
    /// Identifier recorded in connection provenance tags
    fn model_id(&self) -> &str;

    /// One-shot completion
    async fn complete(&self, system: &str, user: &str) -> Result<String>;

    /// Stream completion tokens into `tx` in produced order. Returns the
    /// full text. A closed receiver cancels the stream.
    async fn stream(
        &self,
        system: &str,
        user: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<String>;
}

// ============================================================================
// HTTP PROVIDER
// ============================================================================

#[derive(Debug, Deserialize)]
struct ChatChunk {
    #[serde(default)]
    message: Option<ChatMessage>,
    #[serde(default)]
    done: bool,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    #[serde(default)]
    content: String,
}

/// Talks to a chat endpoint (`POST {model, messages, stream}`)
pub struct HttpLlm {
    client: reqwest::Client,
    endpoint: ModelEndpoint,
}

impl HttpLlm {
    pub fn new(endpoint: ModelEndpoint, budget: std::time::Duration) -> Result<Self> {
        Ok(Self {
            client: reqwest::Client::builder()
                .timeout(budget)
                .build()
                .map_err(CoreError::internal)?,
            endpoint,
        })
    }

    fn body(&self, system: &str, user: &str, stream: bool) -> serde_json::Value {
        serde_json::json!({
            "model": self.endpoint.model,
            "stream": stream,
            "messages": [
                { "role": "system", "content": system },
                { "role": "user", "content": user },
            ],
        })
    }

    async fn request_once(&self, system: &str, user: &str) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint.url)
            .json(&self.body(system, user, false))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("llm: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "llm endpoint returned {}",
                response.status()
            )));
        }
        let chunk: ChatChunk = response
            .json()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("llm body: {e}")))?;
        Ok(chunk.message.map(|m| m.content).unwrap_or_default())
    }
}

#[async_trait]
impl LlmProvider for HttpLlm {
    fn model_id(&self) -> &str {
        &self.endpoint.model
    }

    async fn complete(&self, system: &str, user: &str) -> Result<String> {
        let mut last_err = None;
        for attempt in 0..MAX_ATTEMPTS {
            match self.request_once(system, user).await {
                Ok(text) => return Ok(text),
                Err(e) if e.is_transient() => {
                    tracing::warn!(attempt, "llm attempt failed: {e}");
                    last_err = Some(e);
                    if attempt + 1 < MAX_ATTEMPTS {
                        backoff_delay(attempt).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }
        Err(last_err.unwrap_or_else(|| CoreError::ModelUnavailable("llm".to_string())))
    }

    async fn stream(
        &self,
        system: &str,
        user: &str,
        tx: mpsc::Sender<String>,
    ) -> Result<String> {
        let response = self
            .client
            .post(&self.endpoint.url)
            .json(&self.body(system, user, true))
            .send()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("llm: {e}")))?;
        if !response.status().is_success() {
            return Err(CoreError::ModelUnavailable(format!(
                "llm endpoint returned {}",
                response.status()
            )));
        }

        let mut response = response;
        let mut full = String::new();
        let mut buffer = String::new();
        while let Some(bytes) = response
            .chunk()
            .await
            .map_err(|e| CoreError::ModelUnavailable(format!("llm stream: {e}")))?
        {
            buffer.push_str(&String::from_utf8_lossy(&bytes));
            while let Some(newline) = buffer.find('\n') {
                let line = buffer[..newline].trim().to_string();
                buffer.drain(..=newline);
                if line.is_empty() {
                    continue;
                }
                let chunk: ChatChunk = match serde_json::from_str(&line) {
                    Ok(chunk) => chunk,
                    Err(e) => {
                        tracing::warn!("unparseable llm stream line: {e}");
                        continue;
                    }
                };
                if let Some(message) = chunk.message {
                    if !message.content.is_empty() {
                        full.push_str(&message.content);
                        // Receiver gone means the client cancelled
                        if tx.send(message.content).await.is_err() {
                            return Ok(full);
                        }
                    }
                }
                if chunk.done {
                    return Ok(full);
                }
            }
        }
        Ok(full)
    }
}
