//! Ledger error types

use crate::policy::AdminAction;
use thiserror::Error;
use votechain_core::{CandidateId, ElectionError, ElectionId, VoterId};

/// A transaction the contract refused. Rejections are final; resubmitting
/// the same call yields the same answer.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ContractError {
    #[error("{sender} is not allowed to {action}")]
    Unauthorized { sender: String, action: AdminAction },

    #[error("Election {0} already exists")]
    ElectionExists(String),

    #[error("Election {0} does not exist")]
    ElectionNotFound(String),

    #[error("Election {0} is active")]
    ElectionActive(String),

    #[error("Election {0} is not active")]
    ElectionNotActive(String),

    #[error("Election {active} is already active")]
    AnotherElectionActive { active: String },

    #[error("Candidate {candidate_id} already exists in election {election_id}")]
    CandidateExists {
        election_id: String,
        candidate_id: CandidateId,
    },

    #[error("Invalid candidate {candidate_id} for election {election_id}")]
    InvalidCandidate {
        election_id: String,
        candidate_id: CandidateId,
    },

    #[error("{voter} already voted in election {election_id}")]
    AlreadyVoted { election_id: String, voter: String },

    #[error("Invalid input: {0}")]
    InvalidInput(String),
}

/// Errors that can occur in contract host operations
#[derive(Debug, Error)]
pub enum LedgerError {
    #[error("Database error: {0}")]
    DatabaseError(#[from] rusqlite::Error),

    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    IoError(#[from] std::io::Error),

    #[error("Ledger corrupted: {0}")]
    CorruptionDetected(String),

    #[error("Contract owned by {stored}, configured owner is {configured}")]
    OwnerMismatch { stored: String, configured: String },

    #[error("Transaction rejected: {0}")]
    Rejected(#[from] ContractError),
}

pub type Result<T> = std::result::Result<T, LedgerError>;

impl From<ContractError> for ElectionError {
    fn from(e: ContractError) -> Self {
        match e {
            ContractError::Unauthorized { .. } => ElectionError::Unauthorized(e.to_string()),
            ContractError::ElectionExists(_) | ContractError::CandidateExists { .. } => {
                ElectionError::AlreadyExists(e.to_string())
            }
            ContractError::ElectionNotFound(_) => ElectionError::NotFound(e.to_string()),
            ContractError::ElectionActive(_) | ContractError::ElectionNotActive(_) => {
                ElectionError::InvalidState(e.to_string())
            }
            ContractError::AnotherElectionActive { active } => ElectionError::AlreadyActiveElsewhere {
                active: ElectionId::from(active),
            },
            ContractError::InvalidCandidate {
                election_id,
                candidate_id,
            } => ElectionError::InvalidCandidate {
                election_id: ElectionId::from(election_id),
                candidate_id,
            },
            ContractError::AlreadyVoted { election_id, voter } => ElectionError::AlreadyVoted {
                election_id: ElectionId::from(election_id),
                voter: VoterId::from(voter),
            },
            ContractError::InvalidInput(msg) => ElectionError::InvalidInput(msg),
        }
    }
}
