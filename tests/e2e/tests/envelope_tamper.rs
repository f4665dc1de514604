//! Scenario: envelope tamper. One flipped ciphertext byte makes reads fail
//! with TamperDetected, and no surface leaks the plaintext afterwards.

use mnemos_core::storage::MemoryUpdate;
use mnemos_core::{CoreError, TextCapture};
use mnemos_e2e_tests::TestEnv;

#[tokio::test]
async fn flipped_ciphertext_byte_is_tamper_detected() {
    let env = TestEnv::new();
    let outcome = env
        .orchestrator
        .ingest_text(TextCapture {
            title: Some("Paris trip".to_string()),
            content: "ate pain au chocolat near the Seine".to_string(),
            ..Default::default()
        })
        .await
        .unwrap();

    // Flip one byte of the content envelope's ciphertext in place
    let memory = env.storage.require_memory(&outcome.memory_id).unwrap();
    let mut envelope = memory.content_envelope.clone().unwrap();
    let last = envelope.ciphertext.len() - 1;
    envelope.ciphertext[last] ^= 0x01;
    env.storage
        .update_memory(
            &outcome.memory_id,
            &MemoryUpdate {
                content: Some((envelope, memory.integrity_hash.clone())),
                ..Default::default()
            },
        )
        .unwrap();

    // Reading the content now fails with TamperDetected
    let tampered = env.storage.require_memory(&outcome.memory_id).unwrap();
    let result = env
        .session
        .with_keys(|keys| tampered.content_envelope.as_ref().unwrap().decrypt(keys.kek()));
    assert!(matches!(result, Err(CoreError::TamperDetected)));

    // The untouched title still opens; tamper is fatal to the field, not
    // the process
    let title = env
        .session
        .with_keys(|keys| tampered.title_envelope.as_ref().unwrap().decrypt(keys.kek()))
        .unwrap();
    assert_eq!(title, b"Paris trip");
}
