//! Scenario: image archival. A JPEG converts to PNG, lands date-partitioned
//! in the vault, and round-trips with its digest intact. Plus the integrity
//! audit classifications and crash-orphan reclaim.

use chrono::Datelike;
use mnemos_core::vault::{Converter, Discrepancy, reclaim_orphans, run_audit};
use mnemos_core::{CoreError, FileIngest};
use mnemos_e2e_tests::{BrokenTransducer, PNG_MAGIC, TestEnv};

fn jpeg_ingest(bytes: &[u8]) -> FileIngest {
    FileIngest {
        bytes: bytes.to_vec(),
        declared_mime: "image/jpeg".to_string(),
        filename: Some("holiday.jpg".to_string()),
        captured_at: None,
        parent_id: None,
        metadata: Default::default(),
        keep_original: true,
    }
}

// A stand-in for a 1024x768 JPEG body
fn jpeg_bytes() -> Vec<u8> {
    let mut bytes = vec![0xFF, 0xD8, 0xFF, 0xE0];
    bytes.extend_from_slice(&[0x42; 512]);
    bytes
}

#[tokio::test]
async fn jpeg_is_preserved_as_png() {
    let env = TestEnv::new();
    let original = jpeg_bytes();
    let digest = blake3::hash(&original).to_hex().to_string();

    let outcome = env.orchestrator.ingest_file(jpeg_ingest(&original)).await.unwrap();
    assert_eq!(outcome.preservation_format.as_deref(), Some("png"));

    let source = env
        .storage
        .require_source(outcome.source_id.as_deref().unwrap())
        .unwrap();
    assert_eq!(source.preservation_format, "png");
    // Digest of the original plaintext is recoverable from the row
    assert_eq!(source.integrity_hash, digest);

    // Vault path is YYYY/MM/<uuid>.enc
    let now = chrono::Utc::now();
    assert!(source
        .vault_path
        .starts_with(&format!("{:04}/{:02}/", now.year(), now.month())));
    assert!(source.vault_path.ends_with(".enc"));

    // The preserved bytes are a PNG
    let dek = env
        .session
        .with_keys(|keys| source.dek_envelope.unwrap_dek(keys.file()))
        .unwrap();
    let preserved = env.vault.retrieve(&dek, &source.vault_path).unwrap();
    assert_eq!(&preserved[..8], &PNG_MAGIC);

    // The original rendition is kept and matches the digest
    let original_path = source.original_vault_path.as_deref().unwrap();
    let original_bytes = env.vault.retrieve(&dek, original_path).unwrap();
    assert_eq!(blake3::hash(&original_bytes).to_hex().to_string(), digest);
}

#[tokio::test]
async fn conversion_failure_surfaces_and_writes_nothing() {
    let env = TestEnv::new();
    // Swap in a converter whose tool always exits non-zero
    let broken = mnemos_core::Orchestrator::new(
        std::sync::Arc::clone(&env.storage),
        std::sync::Arc::clone(&env.session),
        std::sync::Arc::clone(&env.vault),
        Converter::new(std::sync::Arc::new(BrokenTransducer)),
        env.jobs.clone(),
        64 * 1024 * 1024,
    );

    assert!(matches!(
        broken.ingest_file(jpeg_ingest(&jpeg_bytes())).await,
        Err(CoreError::ConversionFailed(_))
    ));
    assert!(env.vault.walk().unwrap().is_empty());
}

#[tokio::test]
async fn clean_audit_after_ingest() {
    let env = TestEnv::new();
    env.orchestrator.ingest_file(jpeg_ingest(&jpeg_bytes())).await.unwrap();

    let report = run_audit(&env.storage, &env.vault).await.unwrap();
    assert!(report.is_clean(), "{:?}", report.discrepancies);
    assert_eq!(report.manifest_rows, 1);
    assert_eq!(report.files_seen, 2);
}

#[tokio::test]
async fn crash_leftover_classifies_orphan_and_reclaims() {
    let env = TestEnv::new();
    env.orchestrator.ingest_file(jpeg_ingest(&jpeg_bytes())).await.unwrap();

    // A vault file with no manifest row: what a crash between the vault
    // write and the database commit leaves behind
    let dek = mnemos_core::shield::primitives::generate_dek();
    let orphan = env.vault.store(&dek, b"half-finished", chrono::Utc::now()).unwrap();

    let report = run_audit(&env.storage, &env.vault).await.unwrap();
    assert_eq!(report.discrepancies.len(), 1);
    assert!(matches!(
        &report.discrepancies[0],
        Discrepancy::Orphan { path } if *path == orphan.rel_path
    ));

    // No dangling database row accompanies the orphan
    assert_eq!(env.storage.all_sources().unwrap().len(), 1);

    let removed = reclaim_orphans(&env.vault, &report).unwrap();
    assert_eq!(removed, 1);
    assert!(run_audit(&env.storage, &env.vault).await.unwrap().is_clean());
}

#[tokio::test]
async fn missing_file_classified() {
    let env = TestEnv::new();
    let outcome = env.orchestrator.ingest_file(jpeg_ingest(&jpeg_bytes())).await.unwrap();
    let source = env
        .storage
        .require_source(outcome.source_id.as_deref().unwrap())
        .unwrap();

    std::fs::remove_file(env.vault.root().join(&source.vault_path)).unwrap();

    let report = run_audit(&env.storage, &env.vault).await.unwrap();
    assert!(report.discrepancies.iter().any(|d| matches!(
        d,
        Discrepancy::Missing { source_id, .. } if *source_id == source.id
    )));
}

#[tokio::test]
async fn corrupted_ciphertext_classified() {
    let env = TestEnv::new();
    let outcome = env.orchestrator.ingest_file(jpeg_ingest(&jpeg_bytes())).await.unwrap();
    let source = env
        .storage
        .require_source(outcome.source_id.as_deref().unwrap())
        .unwrap();

    let path = env.vault.root().join(&source.vault_path);
    let mut bytes = std::fs::read(&path).unwrap();
    let last = bytes.len() - 1;
    bytes[last] ^= 0x01;
    std::fs::write(&path, &bytes).unwrap();

    let report = run_audit(&env.storage, &env.vault).await.unwrap();
    assert!(report.discrepancies.iter().any(|d| matches!(
        d,
        Discrepancy::Corrupt { source_id, .. } if *source_id == source.id
    )));
}

#[tokio::test]
async fn csv_passthrough_keeps_bytes() {
    let env = TestEnv::new();
    let csv = b"date,place\r\n2021-06-09,Lyon\r\n".to_vec();
    let outcome = env
        .orchestrator
        .ingest_file(FileIngest {
            bytes: csv.clone(),
            declared_mime: "text/csv".to_string(),
            filename: Some("trips.csv".to_string()),
            captured_at: None,
            parent_id: None,
            metadata: Default::default(),
            keep_original: true,
        })
        .await
        .unwrap();

    assert_eq!(outcome.preservation_format.as_deref(), Some("csv"));
    let source = env
        .storage
        .require_source(outcome.source_id.as_deref().unwrap())
        .unwrap();
    // Passthrough: single rendition, byte-identical (CRLF untouched)
    assert!(source.original_vault_path.is_none());
    let dek = env
        .session
        .with_keys(|keys| source.dek_envelope.unwrap_dek(keys.file()))
        .unwrap();
    assert_eq!(env.vault.retrieve(&dek, &source.vault_path).unwrap(), csv);
}
