//! Scenario: text capture and retrieval. Capture "Paris trip", find it by
//! keyword with case folding, and verify no plaintext reaches the database.

use mnemos_core::cortex::SearchMode;
use mnemos_core::{SearchFilters, TextCapture};
use mnemos_e2e_tests::TestEnv;

fn paris_capture() -> TextCapture {
    TextCapture {
        title: Some("Paris trip".to_string()),
        content: "ate pain au chocolat near the Seine".to_string(),
        ..Default::default()
    }
}

#[tokio::test]
async fn captured_memory_appears_in_list() {
    let env = TestEnv::new();
    let outcome = env.orchestrator.ingest_text(paris_capture()).await.unwrap();
    assert!(outcome.created);

    let listed = env
        .storage
        .list_memories(&mnemos_core::MemoryListFilter {
            limit: 10,
            ..Default::default()
        })
        .unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(listed[0].id, outcome.memory_id);
}

#[tokio::test]
async fn keyword_search_finds_paris_with_case_folding() {
    let mut env = TestEnv::new();
    let outcome = env.orchestrator.ingest_text(paris_capture()).await.unwrap();
    env.drain_jobs().await;

    let lower = env
        .searcher
        .search("paris", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(lower.hits.len(), 1);
    assert_eq!(lower.hits[0].memory_id, outcome.memory_id);
    assert_eq!(lower.hits[0].matched_tokens, Some(1));
    assert!(lower.query_tokens_generated > 0);

    // Case folding: identical result for the uppercase query
    let upper = env
        .searcher
        .search("PARIS", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert_eq!(upper.hits.len(), 1);
    assert_eq!(upper.hits[0].memory_id, outcome.memory_id);
    assert_eq!(upper.hits[0].matched_tokens, lower.hits[0].matched_tokens);
    assert_eq!(upper.hits[0].score, lower.hits[0].score);
}

#[tokio::test]
async fn no_plaintext_at_rest() {
    let env = TestEnv::new();
    env.orchestrator.ingest_text(paris_capture()).await.unwrap();

    let db = env.db_bytes();
    let haystack = String::from_utf8_lossy(&db);
    assert!(!haystack.contains("Paris"), "title plaintext leaked");
    assert!(!haystack.contains("chocolat"), "content plaintext leaked");
    assert!(!haystack.contains("Seine"), "content plaintext leaked");
}

#[tokio::test]
async fn duplicate_digest_short_circuits() {
    let env = TestEnv::new();
    let first = env.orchestrator.ingest_text(paris_capture()).await.unwrap();
    let second = env.orchestrator.ingest_text(paris_capture()).await.unwrap();

    assert!(first.created);
    assert!(!second.created);
    assert_eq!(first.memory_id, second.memory_id);
}

#[tokio::test]
async fn soft_deleted_memories_leave_search() {
    let mut env = TestEnv::new();
    let outcome = env.orchestrator.ingest_text(paris_capture()).await.unwrap();
    env.drain_jobs().await;

    env.storage.soft_delete_memory(&outcome.memory_id).unwrap();
    let hits = env
        .searcher
        .search("paris", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert!(hits.hits.is_empty());
}

#[tokio::test]
async fn locked_session_refuses_capture_and_search() {
    let env = TestEnv::new();
    env.session.lock();

    assert!(matches!(
        env.orchestrator.ingest_text(paris_capture()).await,
        Err(mnemos_core::CoreError::SessionLocked)
    ));
    assert!(matches!(
        env.searcher
            .search("paris", SearchMode::Keyword, 10, &SearchFilters::default())
            .await,
        Err(mnemos_core::CoreError::SessionLocked)
    ));
}
