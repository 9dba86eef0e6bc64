//! Election service facade
//!
//! The surface the request layer calls. Mirror mutations go straight to the
//! registries; everything that touches the ledger goes through the sync
//! engine or the proof verifier.

use crate::engine::ChainSyncEngine;
use crate::reconcile::ReconciliationReport;
use crate::retry::RetryPolicy;
use crate::verifier::VoteProofVerifier;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use votechain_core::types::rank_results;
use votechain_core::{
    Candidate, CandidateId, Config, Election, ElectionId, Result, ResultsSummary, SyncState,
    VoteReceipt, VoteRecord, VoteRouting, VoterId,
};
use votechain_ledger::{ChainClient, ChainStatus};
use votechain_mirror::MirrorStore;

/// A voter's own vote, with its ledger verification.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VoteStatus {
    pub record: VoteRecord,
    /// The ledger holds exactly this receipt
    pub verified_on_chain: bool,
}

#[derive(Clone)]
pub struct ElectionService {
    store: MirrorStore,
    chain: Arc<dyn ChainClient>,
    engine: Arc<ChainSyncEngine>,
    verifier: VoteProofVerifier,
}

impl ElectionService {
    pub fn new(store: MirrorStore, chain: Arc<dyn ChainClient>, config: &Config) -> Self {
        let retry = RetryPolicy::from_config(&config.sync);
        Self::with_policy(store, chain, retry, config.sync.routing)
    }

    pub fn with_policy(
        store: MirrorStore,
        chain: Arc<dyn ChainClient>,
        retry: RetryPolicy,
        routing: VoteRouting,
    ) -> Self {
        let engine = Arc::new(ChainSyncEngine::new(
            store.clone(),
            Arc::clone(&chain),
            retry.clone(),
            routing,
        ));
        let verifier = VoteProofVerifier::new(Arc::clone(&chain), retry);
        Self {
            store,
            chain,
            engine,
            verifier,
        }
    }

    pub fn engine(&self) -> &Arc<ChainSyncEngine> {
        &self.engine
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    pub fn create_election(&self, title: &str) -> Result<Election> {
        self.store.elections().create(title)
    }

    pub fn activate_election(&self, election_id: &ElectionId) -> Result<Election> {
        self.store.elections().activate(election_id)
    }

    pub fn deactivate_election(&self, election_id: &ElectionId) -> Result<Election> {
        self.store.elections().deactivate(election_id)
    }

    pub fn close_election(&self, election_id: &ElectionId) -> Result<Election> {
        self.store.elections().close(election_id)
    }

    /// Set or clear the voting window of a Draft election.
    pub fn schedule_election(
        &self,
        election_id: &ElectionId,
        opens_at: Option<u64>,
        closes_at: Option<u64>,
    ) -> Result<Election> {
        self.store.elections().schedule(election_id, opens_at, closes_at)
    }

    pub fn list_elections(&self) -> Result<Vec<Election>> {
        self.store.elections().list()
    }

    pub fn active_election(&self) -> Result<Option<Election>> {
        self.store.elections().get_active()
    }

    pub fn add_candidate(&self, election_id: &ElectionId, name: &str, party: &str) -> Result<Candidate> {
        self.store.candidates().add_candidate(election_id, name, party)
    }

    pub fn remove_candidate(&self, election_id: &ElectionId, candidate_id: CandidateId) -> Result<()> {
        self.store.candidates().remove_candidate(election_id, candidate_id)
    }

    pub fn list_candidates(&self, election_id: &ElectionId) -> Result<Vec<Candidate>> {
        self.store.candidates().list(election_id)
    }

    /// Cast a vote, routed per configuration.
    pub async fn cast_vote(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
    ) -> Result<VoteReceipt> {
        self.engine.submit_vote(election_id, voter, candidate_id).await
    }

    /// Results as recorded in the mirror.
    pub fn results(&self, election_id: &ElectionId) -> Result<ResultsSummary> {
        self.store.votes().summary(election_id)
    }

    /// Results as recorded on the ledger, for the candidates the mirror knows.
    pub async fn ledger_results(&self, election_id: &ElectionId) -> Result<ResultsSummary> {
        let election = self.store.elections().get(election_id)?;
        let candidates = self.store.candidates().list(election_id)?;
        let retry = self.engine.retry_policy();

        let mut rows = Vec::with_capacity(candidates.len());
        for mut candidate in candidates {
            let on_chain = retry
                .run("getCandidate", || {
                    self.chain.get_candidate(election_id, candidate.id)
                })
                .await?;
            if let Some(on_chain) = on_chain {
                candidate.vote_count = on_chain.vote_count;
                rows.push((candidate, on_chain.vote_count));
            }
        }
        rank_results(&mut rows);
        Ok(ResultsSummary::from_rows(&election, rows))
    }

    /// The voter's own vote, checked against the ledger.
    pub async fn my_vote(&self, election_id: &ElectionId, voter: &VoterId) -> Result<Option<VoteStatus>> {
        let Some(record) = self.store.votes().vote_of(election_id, voter)? else {
            return Ok(None);
        };
        let verified_on_chain = self
            .verifier
            .verify_receipt(election_id, voter, &record.receipt)
            .await?;
        Ok(Some(VoteStatus {
            record,
            verified_on_chain,
        }))
    }

    pub async fn verify_vote(&self, election_id: &ElectionId, voter: &VoterId, claimed_hash: &str) -> Result<bool> {
        self.verifier.verify(election_id, voter, claimed_hash).await
    }

    pub async fn sync_election(&self, election_id: &ElectionId) -> Result<SyncState> {
        self.engine.sync_election(election_id).await
    }

    pub async fn set_on_chain_active(&self, election_id: &ElectionId, active: bool) -> Result<SyncState> {
        self.engine.set_on_chain_active(election_id, active).await
    }

    pub fn sync_state(&self, election_id: &ElectionId) -> Result<SyncState> {
        self.store.sync_states().get(election_id)
    }

    pub async fn reconcile(&self, election_id: &ElectionId) -> Result<ReconciliationReport> {
        self.engine.reconcile(election_id).await
    }

    /// Reconcile every synced election, returning one outcome per election.
    pub async fn reconcile_all(&self) -> Result<Vec<(ElectionId, Result<ReconciliationReport>)>> {
        let mut outcomes = Vec::new();
        for election_id in self.store.sync_states().synced_elections()? {
            let outcome = self.engine.reconcile(&election_id).await;
            outcomes.push((election_id, outcome));
        }
        Ok(outcomes)
    }

    pub async fn chain_status(&self) -> Result<ChainStatus> {
        self.engine.chain_status().await
    }
}
