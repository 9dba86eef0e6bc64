//! Election domain types

use crate::receipt::ReceiptHash;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Candidate identifier, unique within its election. Zero means "no candidate".
pub type CandidateId = u32;

/// Globally unique election identifier (UUID v4 string).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ElectionId(String);

impl ElectionId {
    /// Generate a fresh random identifier.
    pub fn generate() -> Self {
        Self(uuid::Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for ElectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ElectionId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for ElectionId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Opaque, stable voter identity (wallet address or equivalent).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct VoterId(String);

impl VoterId {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for VoterId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for VoterId {
    fn from(s: &str) -> Self {
        Self(s.to_string())
    }
}

impl From<String> for VoterId {
    fn from(s: String) -> Self {
        Self(s)
    }
}

/// Election lifecycle state.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ElectionState {
    /// Roster editable, voting closed
    Draft,
    /// Voting open, roster frozen
    Active,
    /// Results final; terminal
    Closed,
}

impl ElectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ElectionState::Draft => "draft",
            ElectionState::Active => "active",
            ElectionState::Closed => "closed",
        }
    }
}

impl fmt::Display for ElectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ElectionState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "draft" => Ok(ElectionState::Draft),
            "active" => Ok(ElectionState::Active),
            "closed" => Ok(ElectionState::Closed),
            other => Err(format!("unknown election state '{}'", other)),
        }
    }
}

/// An election as stored in the mirror.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Election {
    /// Unique election identifier
    pub id: ElectionId,
    /// Human readable title
    pub title: String,
    /// Lifecycle state
    pub state: ElectionState,
    /// Number of candidates currently registered
    pub candidate_count: u32,
    /// Optional start of the voting window (Unix epoch milliseconds)
    pub opens_at: Option<u64>,
    /// Optional end of the voting window (Unix epoch milliseconds)
    pub closes_at: Option<u64>,
    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at: u64,
    /// Last modification timestamp (Unix epoch milliseconds)
    pub updated_at: u64,
}

impl Election {
    pub fn is_active(&self) -> bool {
        self.state == ElectionState::Active
    }

    /// Check whether a vote may be accepted at `now`.
    ///
    /// Returns the reason when it may not.
    pub fn check_accepts_votes(&self, now: u64) -> Result<(), String> {
        if self.state != ElectionState::Active {
            return Err(format!("election {} is not open ({})", self.id, self.state));
        }
        if let Some(opens_at) = self.opens_at {
            if now < opens_at {
                return Err(format!("election {} has not started yet", self.id));
            }
        }
        if let Some(closes_at) = self.closes_at {
            if now > closes_at {
                return Err(format!("election {} has ended", self.id));
            }
        }
        Ok(())
    }
}

/// A candidate standing in an election.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Candidate {
    /// Owning election
    pub election_id: ElectionId,
    /// Identifier within the election (never zero)
    pub id: CandidateId,
    /// Candidate name
    pub name: String,
    /// Party label (empty when independent)
    pub party: String,
    /// Optional biography
    pub bio: Option<String>,
    /// Votes recorded for this candidate
    pub vote_count: u64,
    /// Creation timestamp (Unix epoch milliseconds)
    pub created_at: u64,
}

/// An immutable record of one cast vote.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteRecord {
    pub election_id: ElectionId,
    pub voter: VoterId,
    pub candidate_id: CandidateId,
    /// Receipt handed to the voter
    pub receipt: ReceiptHash,
    /// Uniqueness salt mixed into the receipt
    pub sequence: u64,
    /// Cast timestamp (Unix epoch milliseconds)
    pub cast_at: u64,
    /// Ledger event sequence number, when the vote was anchored on-chain
    pub ledger_tx: Option<u64>,
}

/// Receipt returned to a voter after a successful cast.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteReceipt {
    pub election_id: ElectionId,
    pub candidate_id: CandidateId,
    pub hash: ReceiptHash,
    pub cast_at: u64,
    pub ledger_tx: Option<u64>,
}

impl From<&VoteRecord> for VoteReceipt {
    fn from(record: &VoteRecord) -> Self {
        Self {
            election_id: record.election_id.clone(),
            candidate_id: record.candidate_id,
            hash: record.receipt,
            cast_at: record.cast_at,
            ledger_tx: record.ledger_tx,
        }
    }
}

/// One row of a results summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CandidateTally {
    pub candidate: Candidate,
    pub votes: u64,
    /// Share of total votes, rounded to two decimals
    pub percentage: f64,
}

/// Results of an election with totals and percentages.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ResultsSummary {
    pub election_id: ElectionId,
    pub title: String,
    pub state: ElectionState,
    pub total_votes: u64,
    pub tallies: Vec<CandidateTally>,
}

impl ResultsSummary {
    /// Build a summary from ranked `(candidate, votes)` rows.
    pub fn from_rows(election: &Election, rows: Vec<(Candidate, u64)>) -> Self {
        let total_votes: u64 = rows.iter().map(|(_, votes)| *votes).sum();
        let tallies = rows
            .into_iter()
            .map(|(candidate, votes)| {
                let percentage = if total_votes > 0 {
                    (votes as f64 / total_votes as f64 * 10_000.0).round() / 100.0
                } else {
                    0.0
                };
                CandidateTally {
                    candidate,
                    votes,
                    percentage,
                }
            })
            .collect();

        Self {
            election_id: election.id.clone(),
            title: election.title.clone(),
            state: election.state,
            total_votes,
            tallies,
        }
    }
}

/// Order result rows by descending votes, ties broken by ascending candidate id.
pub fn rank_results(rows: &mut [(Candidate, u64)]) {
    rows.sort_by(|(a, a_votes), (b, b_votes)| b_votes.cmp(a_votes).then(a.id.cmp(&b.id)));
}

/// Per-election synchronization bookkeeping, owned by the sync engine.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SyncState {
    pub election_id: ElectionId,
    /// The create-election transaction is known to be on the ledger
    pub election_on_chain: bool,
    /// Highest candidate id known to be on the ledger (0 = none)
    pub candidates_synced_through: CandidateId,
    /// Every step of the last sync completed
    pub synced: bool,
    /// Last activation flag written to the ledger
    pub on_chain_active: Option<bool>,
    /// When the last reconciliation ran (Unix epoch milliseconds)
    pub last_reconciled_at: Option<u64>,
    /// Ledger vote counts observed by the last reconciliation
    pub last_reconciled_counts: BTreeMap<CandidateId, u64>,
}

impl SyncState {
    /// Fresh state for an election never pushed to the ledger.
    pub fn new(election_id: ElectionId) -> Self {
        Self {
            election_id,
            election_on_chain: false,
            candidates_synced_through: 0,
            synced: false,
            on_chain_active: None,
            last_reconciled_at: None,
            last_reconciled_counts: BTreeMap::new(),
        }
    }
}
