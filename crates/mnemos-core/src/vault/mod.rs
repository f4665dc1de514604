//! The Vault
//!
//! Content-addressed encrypted file storage with archival-format
//! preservation, a manifest index in the database, and a periodic integrity
//! audit that reconciles the two.

pub mod audit;
pub mod convert;
pub mod store;

pub use audit::{AuditReport, Discrepancy, reclaim_orphans, run_audit};
pub use convert::{
    ConversionAction, ConversionPlan, Converted, Converter, SubprocessTransducer, ToolClass,
    Transducer, html_to_text, plan,
};
pub use store::{StoredBlob, VAULT_MAGIC, VAULT_VERSION, Vault};
