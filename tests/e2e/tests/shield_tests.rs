//! Shield properties: envelope round-trips, cross-session isolation,
//! blind-index determinism and key isolation, and the Shamir threshold.

use mnemos_core::shield::blind_index::{self, TokenType};
use mnemos_core::shield::{Envelope, MasterKey, SubKeys, sharing};
use mnemos_core::CoreError;

fn subkeys(seed: u8) -> SubKeys {
    SubKeys::derive(&MasterKey::from_bytes([seed; 32]))
}

#[test]
fn envelope_round_trip_for_all_sessions() {
    let keys = subkeys(1);
    for plaintext in [
        b"".as_slice(),
        b"ate pain au chocolat near the Seine".as_slice(),
        &[0u8; 4096],
    ] {
        let envelope = Envelope::encrypt(keys.kek(), plaintext).unwrap();
        assert_eq!(envelope.decrypt(keys.kek()).unwrap(), plaintext);
    }
}

#[test]
fn cross_session_isolation() {
    // Different masters: decryption fails with TamperDetected
    let s1 = subkeys(1);
    let s2 = subkeys(2);
    let envelope = Envelope::encrypt(s1.kek(), b"owner secret").unwrap();
    assert!(matches!(
        envelope.decrypt(s2.kek()),
        Err(CoreError::TamperDetected)
    ));
}

#[test]
fn blind_index_is_a_pure_function_of_the_normalized_term() {
    let keys = subkeys(3);
    let key = keys.search();
    let reference = blind_index::token(key, "paris", TokenType::Body);
    for variant in ["paris", "PARIS", " Paris ", "pari\u{0073}"] {
        assert_eq!(blind_index::token(key, variant, TokenType::Body), reference);
    }
}

#[test]
fn blind_index_key_rotation_invalidates_tokens() {
    let old = subkeys(4);
    let new = subkeys(5);
    // A sample of terms; no collisions beyond chance
    for term in ["paris", "seine", "chocolat", "lyon", "anna"] {
        assert_ne!(
            blind_index::token(old.search(), term, TokenType::Body),
            blind_index::token(new.search(), term, TokenType::Body),
        );
    }
}

#[test]
fn shamir_three_of_five() {
    let master = MasterKey::from_bytes([0xC3u8; 32]);
    let verifier = master.verifier();

    let shares = sharing::split(master.as_bytes(), 3, 5, None).unwrap();
    assert_eq!(shares.len(), 5);

    // Shares {1, 3, 5} recover the master; the verifier is the evidence
    let subset = vec![shares[0].clone(), shares[2].clone(), shares[4].clone()];
    let recovered = sharing::combine(&subset, 3, None).unwrap();
    assert_eq!(
        MasterKey::from_bytes(recovered).verifier(),
        verifier
    );

    // Shares {1, 3} fail with InsufficientShares
    let below = vec![shares[0].clone(), shares[2].clone()];
    assert!(matches!(
        sharing::combine(&below, 3, None),
        Err(CoreError::InsufficientShares { needed: 3, got: 2 })
    ));
}

#[test]
fn shamir_below_threshold_reveals_nothing() {
    // k-1 shares plus a forged one: recovery yields a key whose verifier
    // does not match better than chance
    let master = MasterKey::from_bytes([0x77u8; 32]);
    let verifier = master.verifier();
    let shares = sharing::split(master.as_bytes(), 3, 5, None).unwrap();

    let (index, words) = shares[1].split_once('-').unwrap();
    let forged = format!("{index}-{words}");
    let mixed = vec![shares[0].clone(), forged, shares[4].clone()];
    // Re-using a legitimate share keeps this a valid 3-set; swap one share's
    // body with another x to actually corrupt the polynomial
    let corrupted = vec![
        shares[0].clone(),
        format!("7-{words}"),
        shares[4].clone(),
    ];
    let recovered = sharing::combine(&corrupted, 3, None).unwrap();
    assert_ne!(MasterKey::from_bytes(recovered).verifier(), verifier);

    // Sanity: the uncorrupted set still works
    let recovered = sharing::combine(&mixed, 3, None).unwrap();
    assert_eq!(MasterKey::from_bytes(recovered).verifier(), verifier);
}

#[test]
fn envelope_tags_survive_storage_round_trip() {
    let keys = subkeys(6);
    let envelope = Envelope::encrypt(keys.kek(), b"tagged").unwrap();
    let json = envelope.to_json().unwrap();
    assert!(json.contains("aes256-gcm"));
    let parsed = Envelope::from_json(&json).unwrap();
    assert_eq!(parsed.decrypt(keys.kek()).unwrap(), b"tagged");
}
