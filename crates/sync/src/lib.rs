//! Ledger synchronization for the election mirror.
//!
//! - [`ChainSyncEngine`] projects mirror elections onto the ledger,
//!   anchors votes and reconciles counts
//! - [`VoteProofVerifier`] checks voter receipts against ledger hashes
//! - [`RetryPolicy`] bounds every ledger call with deadlines and backoff
//! - [`ElectionService`] is the facade the request layer uses

pub mod engine;
pub mod reconcile;
pub mod retry;
pub mod service;
pub mod verifier;

pub use engine::ChainSyncEngine;
pub use reconcile::{CountDivergence, ReconciliationReport};
pub use retry::RetryPolicy;
pub use service::{ElectionService, VoteStatus};
pub use verifier::VoteProofVerifier;
