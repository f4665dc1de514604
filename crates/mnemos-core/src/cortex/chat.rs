//! RAG Chat
//!
//! A producer task that retrieves, decrypts, prompts, and streams frames into
//! a channel the transport drains. Frame ordering contract: zero or more
//! `token` frames; exactly one `sources`; at most one `title_update`; exactly
//! one terminal `done` or `error`. `sources` may precede or follow the first
//! token but always precedes `done`. Cancellation is a closed channel.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use super::llm::LlmProvider;
use super::search::{HybridSearcher, SearchFilters, SearchMode};
use crate::error::{CoreError, Result};
use crate::model::MessageRole;
use crate::shield::{Envelope, Session, SessionMode};
use crate::storage::Storage;

/// Memories retrieved per question
pub const RETRIEVAL_TOP_K: usize = 6;

const ANSWER_SYSTEM: &str = "You answer questions from the owner's personal memories. \
Use only the provided memories; cite nothing else. Answer directly and briefly.";

const TITLE_SYSTEM: &str = "Produce a title of at most five words for this conversation. \
Reply with the title only.";

/// A frame on the chat stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ChatFrame {
    Token { value: String },
    Sources { ids: Vec<String> },
    TitleUpdate { conversation_id: String, title: String },
    Done,
    Error { message: String },
}

/// The RAG chat engine
pub struct ChatEngine {
    storage: Arc<Storage>,
    session: Arc<Session>,
    searcher: Arc<HybridSearcher>,
    llm: Arc<dyn LlmProvider>,
}

impl ChatEngine {
    pub fn new(
        storage: Arc<Storage>,
        session: Arc<Session>,
        searcher: Arc<HybridSearcher>,
        llm: Arc<dyn LlmProvider>,
    ) -> Self {
        Self {
            storage,
            session,
            searcher,
            llm,
        }
    }

    fn decrypt_context(&self, memory_ids: &[String]) -> Result<String> {
        self.session.with_keys(|keys| {
            let mut blocks = Vec::new();
            for (i, id) in memory_ids.iter().enumerate() {
                let Some(memory) = self.storage.memory(id, false)? else {
                    continue;
                };
                let mut text = String::new();
                if let Some(envelope) = &memory.title_envelope {
                    text.push_str(&String::from_utf8_lossy(&envelope.decrypt(keys.kek())?));
                    text.push('\n');
                }
                if let Some(envelope) = &memory.content_envelope {
                    text.push_str(&String::from_utf8_lossy(&envelope.decrypt(keys.kek())?));
                }
                blocks.push(format!(
                    "[{}] (captured {})\n{}",
                    i + 1,
                    memory.captured_at.format("%Y-%m-%d"),
                    text.trim()
                ));
            }
            Ok(blocks.join("\n\n"))
        })
    }

    fn encrypt_message(&self, text: &str) -> Result<Envelope> {
        self.session
            .with_keys(|keys| Envelope::encrypt(keys.kek(), text.as_bytes()))
    }

    /// Answer one question, streaming frames into `tx`. Returns the
    /// conversation id. Errors are reported on the stream AND returned so
    /// the transport can log them.
    pub async fn answer(
        &self,
        conversation_id: Option<String>,
        question: &str,
        tx: mpsc::Sender<ChatFrame>,
    ) -> Result<String> {
        match self.run(conversation_id, question, &tx).await {
            Ok(id) => {
                let _ = tx.send(ChatFrame::Done).await;
                Ok(id)
            }
            Err(e) => {
                tracing::warn!("chat failed: {e:?}");
                let _ = tx
                    .send(ChatFrame::Error {
                        message: e.to_string(),
                    })
                    .await;
                Err(e)
            }
        }
    }

    async fn run(
        &self,
        conversation_id: Option<String>,
        question: &str,
        tx: &mpsc::Sender<ChatFrame>,
    ) -> Result<String> {
        if question.trim().is_empty() {
            return Err(CoreError::PreconditionFailed("empty question".to_string()));
        }
        // Heir sessions read and chat, but persist nothing
        let persist = matches!(self.session.mode(), Some(SessionMode::Owner));

        let conversation = match &conversation_id {
            Some(id) => self
                .storage
                .conversation(id)?
                .ok_or_else(|| CoreError::NotFound(format!("conversation {id}")))?,
            None if persist => self.storage.create_conversation()?,
            None => crate::model::Conversation {
                id: uuid::Uuid::now_v7().to_string(),
                title: None,
                created_at: chrono::Utc::now(),
                updated_at: chrono::Utc::now(),
            },
        };

        if persist {
            let envelope = self.encrypt_message(question)?;
            self.storage
                .append_message(&conversation.id, MessageRole::User, &envelope, &[])?;
        }

        let retrieved = self
            .searcher
            .search(question, SearchMode::Hybrid, RETRIEVAL_TOP_K, &SearchFilters::default())
            .await?;
        let cited: Vec<String> = retrieved
            .hits
            .iter()
            .map(|hit| hit.memory_id.clone())
            .collect();

        if tx.send(ChatFrame::Sources { ids: cited.clone() }).await.is_err() {
            // Client went away before the first frame
            return Ok(conversation.id);
        }

        let context = self.decrypt_context(&cited)?;
        let prompt = format!("Memories:\n{context}\n\nQuestion: {question}");

        let (token_tx, mut token_rx) = mpsc::channel::<String>(64);
        let llm = Arc::clone(&self.llm);
        let stream_handle = tokio::spawn(async move {
            llm.stream(ANSWER_SYSTEM, &prompt, token_tx).await
        });

        while let Some(token) = token_rx.recv().await {
            if tx.send(ChatFrame::Token { value: token }).await.is_err() {
                // Transport closed: cancel the producer
                stream_handle.abort();
                return Ok(conversation.id);
            }
        }
        let answer = stream_handle
            .await
            .map_err(|e| CoreError::internal(format!("chat stream task: {e}")))??;

        if persist {
            let envelope = self.encrypt_message(&answer)?;
            self.storage.append_message(
                &conversation.id,
                MessageRole::Assistant,
                &envelope,
                &cited,
            )?;

            if conversation.title.is_none() {
                match self
                    .llm
                    .complete(TITLE_SYSTEM, &format!("Q: {question}\nA: {answer}"))
                    .await
                {
                    Ok(raw_title) => {
                        let title = raw_title.trim().trim_matches('"').to_string();
                        if !title.is_empty() {
                            self.storage.set_conversation_title(&conversation.id, &title)?;
                            let _ = tx
                                .send(ChatFrame::TitleUpdate {
                                    conversation_id: conversation.id.clone(),
                                    title,
                                })
                                .await;
                        }
                    }
                    // A missing title never fails the answer
                    Err(e) => tracing::warn!("title generation skipped: {e}"),
                }
            }
        }

        Ok(conversation.id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn frames_serialize_with_type_tags() {
        let frame = ChatFrame::Token {
            value: "Anna".to_string(),
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"token","value":"Anna"}"#
        );

        let frame = ChatFrame::Sources {
            ids: vec!["m1".to_string()],
        };
        assert_eq!(
            serde_json::to_string(&frame).unwrap(),
            r#"{"type":"sources","ids":["m1"]}"#
        );

        assert_eq!(serde_json::to_string(&ChatFrame::Done).unwrap(), r#"{"type":"done"}"#);
    }

    #[test]
    fn frames_parse_back() {
        let parsed: ChatFrame =
            serde_json::from_str(r#"{"type":"error","message":"boom"}"#).unwrap();
        assert_eq!(
            parsed,
            ChatFrame::Error {
                message: "boom".to_string()
            }
        );
    }
}
