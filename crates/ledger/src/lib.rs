//! Election ledger.
//!
//! This crate hosts the election contract locally: contract storage and an
//! append-only, hash-chained event log in SQLite, gated by a pluggable admin
//! policy. The [`ChainClient`] trait is the RPC boundary the sync engine
//! talks through; [`LocalChainClient`] drives the local host.

pub mod client;
pub mod contract;
pub mod error;
pub mod events;
pub mod policy;

pub use client::{ChainClient, ChainError, ChainResult, ChainStatus, LocalChainClient};
pub use contract::{CastOutcome, OnChainCandidate, OnChainElection, OnChainVote, TxReceipt, VotingContract};
pub use error::{ContractError, LedgerError, Result};
pub use events::{ContractEvent, LedgerHealth, LoggedEvent};
pub use policy::{AdminAction, AdminPolicy, AdminSet, SingleOwner};
