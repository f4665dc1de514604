//! Hybrid fusion properties over the live engine: mode agreement, RRF
//! monotonicity, explainability fields, and model-mismatch rejection.

use mnemos_core::cortex::SearchMode;
use mnemos_core::{CoreError, SearchFilters, TextCapture};
use mnemos_e2e_tests::{TestEnv, MockEmbedder};

async fn seed(env: &mut TestEnv) {
    for content in [
        "ate pain au chocolat near the Seine",
        "Lyon has great food and rivers",
        "the museum in Paris was closed",
    ] {
        env.orchestrator
            .ingest_text(TextCapture {
                content: content.to_string(),
                ..Default::default()
            })
            .await
            .unwrap();
    }
    env.drain_jobs().await;
}

#[tokio::test]
async fn hybrid_agrees_with_identical_rankings() {
    let mut env = TestEnv::new();
    seed(&mut env).await;

    // "chocolat" is unique to one memory: keyword and semantic agree, and
    // hybrid preserves the common ordering
    let keyword = env
        .searcher
        .search("chocolat Seine", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    let semantic = env
        .searcher
        .search("chocolat Seine", SearchMode::Semantic, 10, &SearchFilters::default())
        .await
        .unwrap();
    let hybrid = env
        .searcher
        .search("chocolat Seine", SearchMode::Hybrid, 10, &SearchFilters::default())
        .await
        .unwrap();

    assert_eq!(keyword.hits[0].memory_id, semantic.hits[0].memory_id);
    assert_eq!(hybrid.hits[0].memory_id, keyword.hits[0].memory_id);
    assert_eq!(hybrid.mode, SearchMode::Hybrid);
}

#[tokio::test]
async fn hybrid_carries_explainability_fields() {
    let mut env = TestEnv::new();
    seed(&mut env).await;

    let response = env
        .searcher
        .search("chocolat", SearchMode::Hybrid, 10, &SearchFilters::default())
        .await
        .unwrap();
    let top = &response.hits[0];
    assert!(top.keyword_score.is_some());
    assert!(top.vector_score.is_some());
    assert_eq!(top.matched_tokens, Some(1));
    assert!(response.query_tokens_generated > 0);

    // Keyword mode omits vector sub-scores, semantic omits matched tokens
    let keyword = env
        .searcher
        .search("chocolat", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert!(keyword.hits[0].vector_score.is_none());
    let semantic = env
        .searcher
        .search("chocolat", SearchMode::Semantic, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert!(semantic.hits[0].matched_tokens.is_none());
}

#[tokio::test]
async fn semantic_scores_are_normalized() {
    let mut env = TestEnv::new();
    seed(&mut env).await;

    let response = env
        .searcher
        .search("great food in Lyon", SearchMode::Semantic, 10, &SearchFilters::default())
        .await
        .unwrap();
    assert!(!response.hits.is_empty());
    for hit in &response.hits {
        let score = hit.vector_score.unwrap();
        assert!((0.0..=1.0).contains(&score), "score {score} out of range");
    }
}

#[tokio::test]
async fn keyword_stuffing_saturates() {
    let mut env = TestEnv::new();
    let stuffed = "paris ".repeat(200);
    env.orchestrator
        .ingest_text(TextCapture {
            content: stuffed,
            ..Default::default()
        })
        .await
        .unwrap();
    env.drain_jobs().await;

    let response = env
        .searcher
        .search("paris", SearchMode::Keyword, 10, &SearchFilters::default())
        .await
        .unwrap();
    // A token indexed two hundred times still matches once and the
    // saturating curve keeps the score under 1
    assert!(response.hits[0].score < 1.0);
    assert_eq!(response.hits[0].matched_tokens, Some(1));
}

#[tokio::test]
async fn mixed_model_queries_are_rejected() {
    let mut env = TestEnv::new();
    seed(&mut env).await;

    // Rebuild the searcher against a different embedding model
    let other = std::sync::Arc::new(MockEmbedder::with_model("mock-embed-v2"));
    let searcher = mnemos_core::HybridSearcher::new(
        std::sync::Arc::clone(&env.storage),
        std::sync::Arc::clone(&env.session),
        other,
        std::sync::Arc::clone(&env.vectors),
    );

    let result = searcher
        .search("chocolat", SearchMode::Semantic, 10, &SearchFilters::default())
        .await;
    assert!(matches!(
        result,
        Err(CoreError::ModelMismatch { indexed, queried })
            if indexed == "mock-embed-v1" && queried == "mock-embed-v2"
    ));
}
