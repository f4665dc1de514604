//! The Shield
//!
//! Cryptographic substrate: primitives, the passphrase → master → sub-key
//! hierarchy, the session unlock/lock lifecycle, envelope encryption with
//! crypto-agility tags, blind-index search tokens, and k-of-n secret sharing.

pub mod blind_index;
pub mod envelope;
pub mod keys;
pub mod primitives;
pub mod session;
pub mod sharing;

pub use blind_index::{TokenType, normalize};
pub use envelope::{AlgoTag, ENVELOPE_VERSION, Envelope};
pub use keys::{MasterKey, SubKeys};
pub use primitives::{KEY_LEN, KdfParams, NONCE_LEN, SALT_LEN};
pub use session::{Session, SessionMode};
