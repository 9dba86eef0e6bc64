//! Core functionality for the Votechain election engine.
//!
//! This crate provides the domain types shared by the mirror store, the
//! ledger contract host and the synchronization engine:
//! - Election, candidate and vote record types
//! - The error taxonomy surfaced to the calling layer
//! - Deterministic vote receipt hashing (BLAKE3)
//! - Configuration loading and logging initialization

pub mod clock;
pub mod config;
pub mod error;
pub mod logging;
pub mod receipt;
pub mod types;

pub use config::{Config, ConfigError, VoteRouting};
pub use error::{ElectionError, ErrorKind, Result};
pub use receipt::{compute_receipt_hash, ReceiptHash, ReceiptInput};
pub use types::{
    Candidate, CandidateId, CandidateTally, Election, ElectionId, ElectionState, ResultsSummary,
    SyncState, VoteReceipt, VoteRecord, VoterId,
};
