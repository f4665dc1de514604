//! Secret Sharing
//!
//! k-of-n Shamir splitting of the 32-byte master key over GF(256), with each
//! share rendered as a human-readable mnemonic: the share's x coordinate as a
//! numeric prefix, then the 32-byte y vector as 24 BIP-39 words. Below the
//! threshold a combination yields bytes indistinguishable from random; the
//! only evidence of a correct recovery is the stored verifier.
//!
//! An optional passphrase pre-whitens the secret with an Argon2id-derived pad
//! before splitting, so shares alone (even k of them) are useless without it.

use bip39::Mnemonic;
use sharks::{Share, Sharks};
use zeroize::Zeroize;

use super::primitives::{KEY_LEN, KdfParams, derive_master_key};
use crate::error::{CoreError, Result};

/// Domain-separation salt for the passphrase pad. The salt is fixed: the pad
/// must be re-derivable from the passphrase alone at combine time.
const PAD_SALT: [u8; 32] = *b"mnemos/testament/share-pad/v1\0\0\0";

fn passphrase_pad(passphrase: &str) -> Result<[u8; KEY_LEN]> {
    let params = KdfParams {
        time_cost: 2,
        memory_kib: 16 * 1024,
        parallelism: 1,
        output_len: KEY_LEN,
    };
    derive_master_key(passphrase, &PAD_SALT, &params)
}

fn whiten(secret: &[u8; KEY_LEN], passphrase: Option<&str>) -> Result<[u8; KEY_LEN]> {
    let mut out = *secret;
    if let Some(p) = passphrase {
        let mut pad = passphrase_pad(p)?;
        for (byte, pad_byte) in out.iter_mut().zip(pad.iter()) {
            *byte ^= pad_byte;
        }
        pad.zeroize();
    }
    Ok(out)
}

// ============================================================================
// SPLIT / COMBINE
// ============================================================================

/// Split a 32-byte secret into `n` mnemonic shares, any `k` of which recover it
pub fn split(
    secret: &[u8; KEY_LEN],
    k: u8,
    n: u8,
    passphrase: Option<&str>,
) -> Result<Vec<String>> {
    if k == 0 || n == 0 || k > n {
        return Err(CoreError::PreconditionFailed(format!(
            "invalid share scheme {k}-of-{n}"
        )));
    }

    let mut whitened = whiten(secret, passphrase)?;
    let sharks = Sharks(k);
    let dealer = sharks.dealer(&whitened);
    let shares: Vec<Share> = dealer.take(n as usize).collect();
    whitened.zeroize();

    shares.iter().map(encode_share).collect()
}

/// Recover the secret from `k` or more mnemonic shares.
/// Fewer than `k` (or duplicated) shares fail with `InsufficientShares`.
pub fn combine(
    shares: &[String],
    k: u8,
    passphrase: Option<&str>,
) -> Result<[u8; KEY_LEN]> {
    let parsed: Vec<Share> = shares
        .iter()
        .map(|s| decode_share(s))
        .collect::<Result<_>>()?;

    let sharks = Sharks(k);
    let recovered = sharks.recover(parsed.iter()).map_err(|_| {
        CoreError::InsufficientShares {
            needed: k,
            got: shares.len(),
        }
    })?;

    let mut whitened: [u8; KEY_LEN] =
        recovered.try_into().map_err(|_| CoreError::internal("share length"))?;
    let secret = whiten(&whitened, passphrase)?;
    whitened.zeroize();
    Ok(secret)
}

// ============================================================================
// MNEMONIC ENCODING
// ============================================================================

fn encode_share(share: &Share) -> Result<String> {
    let bytes = Vec::from(share);
    // x coordinate, then the 32 y bytes
    let (x, y) = bytes.split_first().ok_or_else(|| CoreError::internal("empty share"))?;
    let mnemonic = Mnemonic::from_entropy(y).map_err(CoreError::internal)?;
    Ok(format!("{x}-{mnemonic}"))
}

fn decode_share(encoded: &str) -> Result<Share> {
    let (x_str, words) = encoded
        .split_once('-')
        .ok_or_else(|| CoreError::PreconditionFailed("malformed share".to_string()))?;
    let x: u8 = x_str
        .trim()
        .parse()
        .map_err(|_| CoreError::PreconditionFailed("malformed share index".to_string()))?;
    let mnemonic: Mnemonic = words
        .trim()
        .parse()
        .map_err(|_| CoreError::PreconditionFailed("malformed share words".to_string()))?;

    let mut bytes = vec![x];
    bytes.extend_from_slice(&mnemonic.to_entropy());
    Share::try_from(bytes.as_slice())
        .map_err(|_| CoreError::PreconditionFailed("malformed share".to_string()))
}
