//! Error taxonomy for election operations.
//!
//! Every rejected operation maps to exactly one [`ErrorKind`] so the calling
//! layer can render an accurate message ("you have already voted" versus
//! "election is not open") without parsing strings.

use crate::types::{CandidateId, ElectionId, VoterId};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Errors returned by the election registries, the vote ledger and the
/// synchronization engine.
#[derive(Debug, Error)]
pub enum ElectionError {
    /// Election or candidate absent
    #[error("Not found: {0}")]
    NotFound(String),

    /// Duplicate election or candidate identifier
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// Operation not allowed in the current lifecycle phase
    #[error("Invalid state: {0}")]
    InvalidState(String),

    /// Another election holds the single active slot
    #[error("Election {active} is already active")]
    AlreadyActiveElsewhere {
        /// The election that is currently active
        active: ElectionId,
    },

    /// A vote already exists for this (election, voter) pair
    #[error("Voter {voter} has already voted in election {election_id}")]
    AlreadyVoted {
        /// Election identifier
        election_id: ElectionId,
        /// Voter identity
        voter: VoterId,
    },

    /// Candidate id is zero or unknown for the election
    #[error("Invalid candidate {candidate_id} for election {election_id}")]
    InvalidCandidate {
        /// Election identifier
        election_id: ElectionId,
        /// Rejected candidate id
        candidate_id: CandidateId,
    },

    /// Caller lacks the admin capability for a ledger operation
    #[error("Unauthorized: {0}")]
    Unauthorized(String),

    /// On-chain operation requested before the election was synced
    #[error("Election {0} has not been synced to the ledger")]
    NotSynced(ElectionId),

    /// Mirror and ledger disagree in a way reconciliation cannot resolve
    #[error("Sync conflict for election {election_id}: {detail}")]
    SyncConflict {
        /// Election identifier
        election_id: ElectionId,
        /// Description of the disagreement
        detail: String,
    },

    /// Ledger RPC exhausted its retry budget
    #[error("Ledger unreachable during {operation} after {attempts} attempt(s): {last_error}")]
    LedgerUnreachable {
        /// Name of the ledger operation
        operation: String,
        /// Attempts made before giving up
        attempts: u32,
        /// Last transport error observed
        last_error: String,
    },

    /// Malformed caller input
    #[error("Invalid input: {0}")]
    InvalidInput(String),

    /// Mirror database failure
    #[error("Storage error: {0}")]
    Storage(String),
}

/// Result alias for election operations.
pub type Result<T> = std::result::Result<T, ElectionError>;

/// Flat classification of [`ElectionError`] for callers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    NotFound,
    AlreadyExists,
    InvalidState,
    AlreadyActiveElsewhere,
    AlreadyVoted,
    InvalidCandidate,
    Unauthorized,
    NotSynced,
    SyncConflict,
    LedgerUnreachable,
    InvalidInput,
    Storage,
}

impl ErrorKind {
    /// Message suitable for showing to an end user.
    pub fn user_message(&self) -> &'static str {
        match self {
            ErrorKind::NotFound => "the requested election or candidate does not exist",
            ErrorKind::AlreadyExists => "that election or candidate already exists",
            ErrorKind::InvalidState => "the election is not in a state that allows this action",
            ErrorKind::AlreadyActiveElsewhere => "another election is already open",
            ErrorKind::AlreadyVoted => "you have already voted in this election",
            ErrorKind::InvalidCandidate => "that candidate is not standing in this election",
            ErrorKind::Unauthorized => "you are not allowed to perform this action",
            ErrorKind::NotSynced => "the election has not been published to the ledger yet",
            ErrorKind::SyncConflict => "the ledger and the local records disagree",
            ErrorKind::LedgerUnreachable => "the ledger is currently unreachable, try again later",
            ErrorKind::InvalidInput => "the request contained invalid data",
            ErrorKind::Storage => "an internal storage error occurred",
        }
    }

    /// Whether retrying the same call later may succeed.
    pub fn is_retryable(&self) -> bool {
        matches!(self, ErrorKind::LedgerUnreachable | ErrorKind::Storage)
    }
}

impl ElectionError {
    /// Classify this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            ElectionError::NotFound(_) => ErrorKind::NotFound,
            ElectionError::AlreadyExists(_) => ErrorKind::AlreadyExists,
            ElectionError::InvalidState(_) => ErrorKind::InvalidState,
            ElectionError::AlreadyActiveElsewhere { .. } => ErrorKind::AlreadyActiveElsewhere,
            ElectionError::AlreadyVoted { .. } => ErrorKind::AlreadyVoted,
            ElectionError::InvalidCandidate { .. } => ErrorKind::InvalidCandidate,
            ElectionError::Unauthorized(_) => ErrorKind::Unauthorized,
            ElectionError::NotSynced(_) => ErrorKind::NotSynced,
            ElectionError::SyncConflict { .. } => ErrorKind::SyncConflict,
            ElectionError::LedgerUnreachable { .. } => ErrorKind::LedgerUnreachable,
            ElectionError::InvalidInput(_) => ErrorKind::InvalidInput,
            ElectionError::Storage(_) => ErrorKind::Storage,
        }
    }

    /// Shorthand for a missing election.
    pub fn election_not_found(id: &ElectionId) -> Self {
        ElectionError::NotFound(format!("election {}", id))
    }
}

impl From<serde_json::Error> for ElectionError {
    fn from(e: serde_json::Error) -> Self {
        ElectionError::Storage(format!("serialization: {}", e))
    }
}

#[cfg(feature = "sqlite")]
impl From<rusqlite::Error> for ElectionError {
    fn from(e: rusqlite::Error) -> Self {
        ElectionError::Storage(e.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_classification() {
        let err = ElectionError::AlreadyVoted {
            election_id: ElectionId::from("e1"),
            voter: VoterId::from("v1"),
        };
        assert_eq!(err.kind(), ErrorKind::AlreadyVoted);
        assert_eq!(
            err.kind().user_message(),
            "you have already voted in this election"
        );
        assert!(!err.kind().is_retryable());

        let err = ElectionError::LedgerUnreachable {
            operation: "createElection".to_string(),
            attempts: 3,
            last_error: "timeout".to_string(),
        };
        assert!(err.kind().is_retryable());
        assert!(err.to_string().contains("3 attempt(s)"));
    }

    #[test]
    fn test_not_found_message() {
        let err = ElectionError::election_not_found(&ElectionId::from("abc"));
        assert_eq!(err.to_string(), "Not found: election abc");
    }
}
