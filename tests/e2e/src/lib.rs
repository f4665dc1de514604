//! End-to-end test support for the mnemos engine: a temp-backed harness and
//! deterministic mocks for every external collaborator.

pub mod harness;
pub mod mocks;

pub use harness::{MASTER_BYTES, TestEnv};
pub use mocks::{
    BrokenTransducer, DownEmbedder, FakeTransducer, MOCK_DIM, MockEmbedder, MockLlm, PNG_MAGIC,
};
