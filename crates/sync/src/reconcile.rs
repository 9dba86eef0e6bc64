//! Reconciliation reports.

use serde::{Deserialize, Serialize};
use votechain_core::{CandidateId, ElectionId, VoteRouting};

/// A candidate whose mirror count differs from the ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountDivergence {
    pub candidate_id: CandidateId,
    pub name: String,
    pub mirror_votes: u64,
    pub ledger_votes: u64,
}

/// Outcome of comparing one election between mirror and ledger.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReconciliationReport {
    pub election_id: ElectionId,
    pub routing: VoteRouting,
    /// Mirror says Active
    pub mirror_active: bool,
    /// Ledger says active
    pub ledger_active: bool,
    pub divergences: Vec<CountDivergence>,
    /// Mirror counts were overwritten with ledger counts
    pub corrected: bool,
    /// Mirror candidates not yet pushed to the ledger
    pub unsynced_candidates: Vec<CandidateId>,
    pub reconciled_at: u64,
}

impl ReconciliationReport {
    /// Mirror and ledger agree on counts, activation and roster.
    pub fn is_consistent(&self) -> bool {
        self.divergences.is_empty()
            && self.mirror_active == self.ledger_active
            && self.unsynced_candidates.is_empty()
    }
}
