//! Scenario: RAG chat. With memories about Anna and Lyon, asking "who did I
//! meet in Lyon?" streams sources (the Anna memory ranked first), answer
//! tokens, and a terminal done in the contracted order.

use mnemos_core::{ChatFrame, TextCapture};
use mnemos_e2e_tests::TestEnv;
use tokio::sync::mpsc;

async fn seed_lyon_memories(env: &mut TestEnv) -> (String, String) {
    let a = env
        .orchestrator
        .ingest_text(TextCapture {
            content: "I met Anna in Lyon in 2021".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    let b = env
        .orchestrator
        .ingest_text(TextCapture {
            content: "Lyon has great food".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();
    env.drain_jobs().await;
    (a.memory_id, b.memory_id)
}

async fn collect_frames(env: &TestEnv, question: &str) -> Vec<ChatFrame> {
    let (tx, mut rx) = mpsc::channel(64);
    env.chat.answer(None, question, tx).await.unwrap();
    let mut frames = Vec::new();
    while let Some(frame) = rx.recv().await {
        frames.push(frame);
    }
    frames
}

#[tokio::test]
async fn frames_arrive_in_contract_order() {
    let mut env = TestEnv::new();
    let (memory_a, memory_b) = seed_lyon_memories(&mut env).await;

    let frames = collect_frames(&env, "who did I meet in Lyon?").await;

    // sources precedes done; here it precedes the first token too
    let sources_pos = frames
        .iter()
        .position(|f| matches!(f, ChatFrame::Sources { .. }))
        .expect("sources frame");
    let first_token = frames
        .iter()
        .position(|f| matches!(f, ChatFrame::Token { .. }))
        .expect("token frames");
    let done_pos = frames
        .iter()
        .position(|f| matches!(f, ChatFrame::Done))
        .expect("done frame");
    assert!(sources_pos < done_pos);
    assert!(first_token < done_pos);
    assert_eq!(done_pos, frames.len() - 1);

    // Exactly one sources, exactly one terminal
    assert_eq!(
        frames.iter().filter(|f| matches!(f, ChatFrame::Sources { .. })).count(),
        1
    );
    assert_eq!(
        frames
            .iter()
            .filter(|f| matches!(f, ChatFrame::Done | ChatFrame::Error { .. }))
            .count(),
        1
    );

    // Both Lyon memories are cited, the Anna memory first
    let ChatFrame::Sources { ids } = &frames[sources_pos] else { unreachable!() };
    assert!(ids.contains(&memory_a));
    assert!(ids.contains(&memory_b));
    assert_eq!(ids[0], memory_a);

    // The streamed answer cites Anna
    let answer: String = frames
        .iter()
        .filter_map(|f| match f {
            ChatFrame::Token { value } => Some(value.as_str()),
            _ => None,
        })
        .collect();
    assert!(answer.contains("Anna"));
}

#[tokio::test]
async fn conversation_is_persisted_with_citations() {
    let mut env = TestEnv::new();
    let (memory_a, _) = seed_lyon_memories(&mut env).await;

    let (tx, mut rx) = mpsc::channel(64);
    let conversation_id = env
        .chat
        .answer(None, "who did I meet in Lyon?", tx)
        .await
        .unwrap();
    while rx.recv().await.is_some() {}

    let messages = env.storage.messages(&conversation_id).unwrap();
    assert_eq!(messages.len(), 2);
    assert!(messages[1].cited_memory_ids.contains(&memory_a));

    // Messages are envelopes; plaintext never lands in the row
    let db = String::from_utf8_lossy(&env.db_bytes()).into_owned();
    assert!(!db.contains("who did I meet in Lyon"));

    // The thread got an AI-generated title
    let conversation = env.storage.conversation(&conversation_id).unwrap().unwrap();
    assert!(conversation.title.is_some());
}

#[tokio::test]
async fn empty_question_streams_error_terminal() {
    let env = TestEnv::new();
    let (tx, mut rx) = mpsc::channel(64);
    let result = env.chat.answer(None, "   ", tx).await;
    assert!(result.is_err());

    let mut saw_error = false;
    while let Some(frame) = rx.recv().await {
        if matches!(frame, ChatFrame::Error { .. }) {
            saw_error = true;
        }
        assert!(!matches!(frame, ChatFrame::Done));
    }
    assert!(saw_error);
}
