//! Ledger RPC boundary
//!
//! [`ChainClient`] is the only way the rest of the system reaches the ledger.
//! Implementations:
//! - MUST NOT retry internally; the sync engine owns the retry policy
//! - MUST NOT panic
//! - MUST report contract refusals as [`ChainError::Rejected`] and anything
//!   that might succeed on a later attempt as [`ChainError::Transient`]

use crate::contract::{CastOutcome, OnChainCandidate, OnChainElection, OnChainVote, TxReceipt, VotingContract};
use crate::error::{ContractError, LedgerError};
use crate::events::LoggedEvent;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::{Arc, Mutex};
use thiserror::Error;
use votechain_core::{CandidateId, ElectionId, ReceiptHash, VoterId};

/// Errors from ledger calls.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ChainError {
    /// The contract refused the transaction
    #[error("rejected by contract: {0}")]
    Rejected(ContractError),

    /// Network, node or storage failure; the call may be retried
    #[error("transient ledger failure: {0}")]
    Transient(String),

    /// The ledger cannot serve requests until an operator intervenes
    #[error("ledger unavailable: {0}")]
    Unavailable(String),
}

impl ChainError {
    pub fn is_retryable(&self) -> bool {
        matches!(self, ChainError::Transient(_))
    }
}

impl From<LedgerError> for ChainError {
    fn from(e: LedgerError) -> Self {
        match e {
            LedgerError::Rejected(rejection) => ChainError::Rejected(rejection),
            LedgerError::CorruptionDetected(_) | LedgerError::OwnerMismatch { .. } => {
                ChainError::Unavailable(e.to_string())
            }
            other => ChainError::Transient(other.to_string()),
        }
    }
}

pub type ChainResult<T> = std::result::Result<T, ChainError>;

/// Connection and health summary of the ledger service.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChainStatus {
    pub connected: bool,
    pub chain_id: String,
    pub latest_block: u64,
    /// Identity admin transactions are sent as
    pub account: String,
    /// Contract is deployed and its event log is intact
    pub contract_loaded: bool,
}

/// Async RPC surface of the election contract.
///
/// Admin calls are sent as the client's own account. `cast_vote` is sent as
/// the voter; signing is assumed to happen below this layer.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn create_election(&self, election_id: &ElectionId, title: &str) -> ChainResult<TxReceipt>;

    async fn add_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
        name: &str,
        party: &str,
    ) -> ChainResult<TxReceipt>;

    async fn set_election_status(&self, election_id: &ElectionId, is_active: bool) -> ChainResult<TxReceipt>;

    async fn cast_vote(
        &self,
        voter: &VoterId,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<CastOutcome>;

    async fn get_election(&self, election_id: &ElectionId) -> ChainResult<Option<OnChainElection>>;

    async fn get_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<Option<OnChainCandidate>>;

    async fn check_if_voted(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<bool>;

    async fn get_vote_hash(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<ReceiptHash>>;

    /// The voter's recorded vote, with the transaction that carried it.
    async fn get_vote(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<OnChainVote>>;

    async fn get_owner(&self) -> ChainResult<String>;

    async fn events_since(&self, from_seq_no: u64, limit: usize) -> ChainResult<Vec<LoggedEvent>>;

    async fn status(&self) -> ChainResult<ChainStatus>;
}

/// [`ChainClient`] over an in-process [`VotingContract`].
///
/// Contract calls are synchronous SQLite work and run on tokio's blocking
/// pool, so a caller's deadline can stop waiting on them. A call that was
/// given up on still runs to completion, the same way a transaction already
/// submitted to a remote node does.
#[derive(Clone)]
pub struct LocalChainClient {
    contract: Arc<Mutex<VotingContract>>,
    account: String,
    chain_id: String,
}

impl LocalChainClient {
    pub fn new(contract: VotingContract, account: impl Into<String>) -> Self {
        Self::shared(Arc::new(Mutex::new(contract)), account)
    }

    /// A client over a contract shared with other clients (other accounts).
    pub fn shared(contract: Arc<Mutex<VotingContract>>, account: impl Into<String>) -> Self {
        Self {
            contract,
            account: account.into(),
            chain_id: "votechain-local".to_string(),
        }
    }

    pub fn account(&self) -> &str {
        &self.account
    }

    pub fn contract(&self) -> Arc<Mutex<VotingContract>> {
        Arc::clone(&self.contract)
    }

    async fn call<T, F>(&self, op: F) -> ChainResult<T>
    where
        T: Send + 'static,
        F: FnOnce(&mut VotingContract) -> crate::error::Result<T> + Send + 'static,
    {
        let contract = Arc::clone(&self.contract);
        tokio::task::spawn_blocking(move || -> ChainResult<T> {
            let mut contract = contract
                .lock()
                .map_err(|_| ChainError::Unavailable("contract lock poisoned".to_string()))?;
            Ok(op(&mut *contract)?)
        })
        .await
        .map_err(|e| {
            if e.is_panic() {
                ChainError::Unavailable(format!("contract call panicked: {}", e))
            } else {
                ChainError::Transient(format!("contract call cancelled: {}", e))
            }
        })?
    }
}

#[async_trait]
impl ChainClient for LocalChainClient {
    async fn create_election(&self, election_id: &ElectionId, title: &str) -> ChainResult<TxReceipt> {
        let (account, election_id, title) = (self.account.clone(), election_id.clone(), title.to_string());
        self.call(move |c| c.create_election(&account, election_id.as_str(), &title))
            .await
    }

    async fn add_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
        name: &str,
        party: &str,
    ) -> ChainResult<TxReceipt> {
        let account = self.account.clone();
        let election_id = election_id.clone();
        let (name, party) = (name.to_string(), party.to_string());
        self.call(move |c| c.add_candidate(&account, election_id.as_str(), candidate_id, &name, &party))
            .await
    }

    async fn set_election_status(&self, election_id: &ElectionId, is_active: bool) -> ChainResult<TxReceipt> {
        let (account, election_id) = (self.account.clone(), election_id.clone());
        self.call(move |c| c.set_election_status(&account, election_id.as_str(), is_active))
            .await
    }

    async fn cast_vote(
        &self,
        voter: &VoterId,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<CastOutcome> {
        let (voter, election_id) = (voter.clone(), election_id.clone());
        self.call(move |c| c.cast_vote(voter.as_str(), election_id.as_str(), candidate_id))
            .await
    }

    async fn get_election(&self, election_id: &ElectionId) -> ChainResult<Option<OnChainElection>> {
        let election_id = election_id.clone();
        self.call(move |c| c.get_election(election_id.as_str())).await
    }

    async fn get_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<Option<OnChainCandidate>> {
        let election_id = election_id.clone();
        self.call(move |c| c.get_candidate(election_id.as_str(), candidate_id))
            .await
    }

    async fn check_if_voted(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<bool> {
        let (election_id, voter) = (election_id.clone(), voter.clone());
        self.call(move |c| c.check_if_voted(election_id.as_str(), voter.as_str()))
            .await
    }

    async fn get_vote_hash(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<ReceiptHash>> {
        let (election_id, voter) = (election_id.clone(), voter.clone());
        self.call(move |c| c.get_vote_hash(election_id.as_str(), voter.as_str()))
            .await
    }

    async fn get_vote(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<OnChainVote>> {
        let (election_id, voter) = (election_id.clone(), voter.clone());
        self.call(move |c| c.get_vote(election_id.as_str(), voter.as_str()))
            .await
    }

    async fn get_owner(&self) -> ChainResult<String> {
        self.call(|c| Ok(c.owner().to_string())).await
    }

    async fn events_since(&self, from_seq_no: u64, limit: usize) -> ChainResult<Vec<LoggedEvent>> {
        self.call(move |c| c.events_since(from_seq_no, limit)).await
    }

    async fn status(&self) -> ChainResult<ChainStatus> {
        let (latest_block, contract_loaded) = self
            .call(|c| Ok((c.latest_block()?, c.health().is_ok())))
            .await?;
        Ok(ChainStatus {
            connected: true,
            chain_id: self.chain_id.clone(),
            latest_block,
            account: self.account.clone(),
            contract_loaded,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::SingleOwner;
    use std::time::Duration;

    fn client() -> LocalChainClient {
        let contract = VotingContract::open_in_memory(Arc::new(SingleOwner::new("0xauthority"))).unwrap();
        LocalChainClient::new(contract, "0xauthority")
    }

    #[tokio::test]
    async fn test_admin_flow_through_client() {
        let client = client();
        let id = ElectionId::from("E1");

        client.create_election(&id, "Board Election").await.unwrap();
        client.add_candidate(&id, 1, "Alice", "Green").await.unwrap();
        client.set_election_status(&id, true).await.unwrap();

        let election = client.get_election(&id).await.unwrap().unwrap();
        assert!(election.is_active);
        assert_eq!(election.candidate_count, 1);
        assert_eq!(client.get_owner().await.unwrap(), "0xauthority");

        let status = client.status().await.unwrap();
        assert!(status.connected);
        assert!(status.contract_loaded);
        assert_eq!(status.latest_block, 3);
    }

    #[tokio::test]
    async fn test_rejections_are_not_retryable() {
        let client = client();
        let id = ElectionId::from("E1");
        client.create_election(&id, "Board Election").await.unwrap();

        let err = client.create_election(&id, "Board Election").await.unwrap_err();
        assert_eq!(err, ChainError::Rejected(ContractError::ElectionExists("E1".to_string())));
        assert!(!err.is_retryable());
    }

    #[tokio::test]
    async fn test_votes_sent_as_voter() {
        let client = client();
        let id = ElectionId::from("E1");
        client.create_election(&id, "Board Election").await.unwrap();
        client.add_candidate(&id, 1, "Alice", "Green").await.unwrap();
        client.set_election_status(&id, true).await.unwrap();

        let voter = VoterId::from("V1");
        let outcome = client.cast_vote(&voter, &id, 1).await.unwrap();
        assert!(client.check_if_voted(&id, &voter).await.unwrap());
        assert_eq!(client.get_vote_hash(&id, &voter).await.unwrap(), Some(outcome.hash));

        let vote = client.get_vote(&id, &voter).await.unwrap().unwrap();
        assert_eq!(vote.candidate_id, 1);
        assert_eq!(vote.hash, outcome.hash);
        assert_eq!(vote.tx, outcome.tx);
        assert_eq!(client.get_vote(&id, &VoterId::from("V2")).await.unwrap(), None);

        // A voter account cannot administer
        let voter_client = LocalChainClient::shared(client.contract(), "V1");
        let err = voter_client.set_election_status(&id, false).await.unwrap_err();
        assert!(matches!(err, ChainError::Rejected(ContractError::Unauthorized { .. })));
    }

    #[tokio::test]
    async fn test_deadline_interrupts_busy_contract() {
        let client = client();
        let contract = client.contract();

        // Another holder keeps the contract busy; on a single-threaded
        // runtime the timer must still fire.
        let busy = contract.lock().unwrap();
        let waited = tokio::time::timeout(Duration::from_millis(50), client.get_owner()).await;
        assert!(waited.is_err());
        drop(busy);

        assert_eq!(client.get_owner().await.unwrap(), "0xauthority");
    }

    #[test]
    fn test_error_classification() {
        assert_eq!(
            ChainError::from(LedgerError::CorruptionDetected("x".into())),
            ChainError::Unavailable("Ledger corrupted: x".into())
        );
        assert!(ChainError::Transient("busy".into()).is_retryable());
    }
}
