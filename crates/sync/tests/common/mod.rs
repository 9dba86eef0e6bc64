//! Shared fixtures for the sync integration tests.
//!
//! [`FlakyChainClient`] wraps a [`LocalChainClient`] and injects the failures
//! a real ledger node produces: refused connections, slow responses and
//! writes that commit but whose acknowledgement is lost.

#![allow(dead_code)]

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::Notify;
use votechain_core::{
    Candidate, CandidateId, Election, ElectionId, ReceiptHash, VoteRouting, VoterId,
};
use votechain_ledger::{
    CastOutcome, ChainClient, ChainError, ChainResult, ChainStatus, LocalChainClient,
    LoggedEvent, OnChainCandidate, OnChainElection, OnChainVote, SingleOwner, TxReceipt, VotingContract,
};
use votechain_mirror::MirrorStore;
use votechain_sync::{ElectionService, RetryPolicy};

pub const OWNER: &str = "0xauthority";

/// Signals around a `castVote` whose acknowledgement is held back.
#[derive(Clone, Default)]
pub struct HeldAck {
    /// Notified once the vote has committed on the ledger
    pub committed: Arc<Notify>,
    /// Notify to let the acknowledgement through
    pub release: Arc<Notify>,
}

fn take(counter: &AtomicU32) -> bool {
    counter
        .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
        .is_ok()
}

pub struct FlakyChainClient {
    inner: LocalChainClient,
    /// Fail the next N calls of any kind before they reach the contract
    fail_next: AtomicU32,
    /// Let this many writes through before `write_failures` applies
    writes_before_failure: AtomicU32,
    write_failures: AtomicU32,
    /// Commit the next N writes but report a transient failure
    lose_acks: AtomicU32,
    delay_ms: AtomicU64,
    held_cast_ack: Mutex<Option<HeldAck>>,
    calls: Mutex<HashMap<&'static str, u32>>,
}

impl FlakyChainClient {
    pub fn new(inner: LocalChainClient) -> Self {
        Self {
            inner,
            fail_next: AtomicU32::new(0),
            writes_before_failure: AtomicU32::new(0),
            write_failures: AtomicU32::new(0),
            lose_acks: AtomicU32::new(0),
            delay_ms: AtomicU64::new(0),
            held_cast_ack: Mutex::new(None),
            calls: Mutex::new(HashMap::new()),
        }
    }

    pub fn fail_next(&self, n: u32) {
        self.fail_next.store(n, Ordering::SeqCst);
    }

    pub fn fail_writes(&self, after: u32, times: u32) {
        self.writes_before_failure.store(after, Ordering::SeqCst);
        self.write_failures.store(times, Ordering::SeqCst);
    }

    pub fn lose_acks(&self, n: u32) {
        self.lose_acks.store(n, Ordering::SeqCst);
    }

    /// Hold the next committed `castVote` until `release` is notified.
    pub fn hold_next_cast_ack(&self) -> HeldAck {
        let held = HeldAck::default();
        *self.held_cast_ack.lock().unwrap() = Some(held.clone());
        held
    }

    pub fn set_delay(&self, delay: Duration) {
        self.delay_ms.store(delay.as_millis() as u64, Ordering::SeqCst);
    }

    pub fn heal(&self) {
        self.fail_next.store(0, Ordering::SeqCst);
        self.write_failures.store(0, Ordering::SeqCst);
        self.lose_acks.store(0, Ordering::SeqCst);
        self.delay_ms.store(0, Ordering::SeqCst);
    }

    /// Number of calls made for `operation`, failed ones included.
    pub fn calls(&self, operation: &str) -> u32 {
        self.calls
            .lock()
            .unwrap()
            .get(operation)
            .copied()
            .unwrap_or(0)
    }

    pub fn inner(&self) -> &LocalChainClient {
        &self.inner
    }

    async fn gate(&self, operation: &'static str) -> ChainResult<()> {
        *self.calls.lock().unwrap().entry(operation).or_default() += 1;

        let delay = self.delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }
        if take(&self.fail_next) {
            return Err(ChainError::Transient(format!("{}: connection refused", operation)));
        }
        Ok(())
    }

    async fn write_gate(&self, operation: &'static str) -> ChainResult<()> {
        self.gate(operation).await?;
        if self.write_failures.load(Ordering::SeqCst) > 0
            && !take(&self.writes_before_failure)
            && take(&self.write_failures)
        {
            return Err(ChainError::Transient(format!("{}: node unavailable", operation)));
        }
        Ok(())
    }

    fn ack<T>(&self, result: ChainResult<T>) -> ChainResult<T> {
        if result.is_ok() && take(&self.lose_acks) {
            return Err(ChainError::Transient("response lost after commit".to_string()));
        }
        result
    }
}

#[async_trait]
impl ChainClient for FlakyChainClient {
    async fn create_election(&self, election_id: &ElectionId, title: &str) -> ChainResult<TxReceipt> {
        self.write_gate("createElection").await?;
        let result = self.inner.create_election(election_id, title).await;
        self.ack(result)
    }

    async fn add_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
        name: &str,
        party: &str,
    ) -> ChainResult<TxReceipt> {
        self.write_gate("addCandidate").await?;
        let result = self
            .inner
            .add_candidate(election_id, candidate_id, name, party)
            .await;
        self.ack(result)
    }

    async fn set_election_status(&self, election_id: &ElectionId, is_active: bool) -> ChainResult<TxReceipt> {
        self.write_gate("setElectionStatus").await?;
        let result = self.inner.set_election_status(election_id, is_active).await;
        self.ack(result)
    }

    async fn cast_vote(
        &self,
        voter: &VoterId,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<CastOutcome> {
        self.write_gate("castVote").await?;
        let result = self.inner.cast_vote(voter, election_id, candidate_id).await;
        let held = self.held_cast_ack.lock().unwrap().take();
        if let Some(held) = held {
            held.committed.notify_one();
            held.release.notified().await;
        }
        self.ack(result)
    }

    async fn get_election(&self, election_id: &ElectionId) -> ChainResult<Option<OnChainElection>> {
        self.gate("getElection").await?;
        self.inner.get_election(election_id).await
    }

    async fn get_candidate(
        &self,
        election_id: &ElectionId,
        candidate_id: CandidateId,
    ) -> ChainResult<Option<OnChainCandidate>> {
        self.gate("getCandidate").await?;
        self.inner.get_candidate(election_id, candidate_id).await
    }

    async fn check_if_voted(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<bool> {
        self.gate("checkIfVoted").await?;
        self.inner.check_if_voted(election_id, voter).await
    }

    async fn get_vote_hash(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<ReceiptHash>> {
        self.gate("getVoteHash").await?;
        self.inner.get_vote_hash(election_id, voter).await
    }

    async fn get_vote(&self, election_id: &ElectionId, voter: &VoterId) -> ChainResult<Option<OnChainVote>> {
        self.gate("getVote").await?;
        self.inner.get_vote(election_id, voter).await
    }

    async fn get_owner(&self) -> ChainResult<String> {
        self.gate("getOwner").await?;
        self.inner.get_owner().await
    }

    async fn events_since(&self, from_seq_no: u64, limit: usize) -> ChainResult<Vec<LoggedEvent>> {
        self.gate("eventsSince").await?;
        self.inner.events_since(from_seq_no, limit).await
    }

    async fn status(&self) -> ChainResult<ChainStatus> {
        self.gate("status").await?;
        self.inner.status().await
    }
}

/// Short deadlines and no jitter so failure paths finish quickly.
pub fn fast_retry(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        rpc_timeout: Duration::from_millis(100),
        initial_backoff_ms: 1,
        max_backoff_ms: 5,
        backoff_multiplier: 2.0,
        jitter: false,
    }
}

pub struct Harness {
    pub service: ElectionService,
    pub store: MirrorStore,
    pub chain: Arc<FlakyChainClient>,
    pub contract: Arc<Mutex<VotingContract>>,
}

impl Harness {
    pub fn new(routing: VoteRouting) -> Self {
        Self::with_retry(routing, fast_retry(3))
    }

    pub fn with_retry(routing: VoteRouting, retry: RetryPolicy) -> Self {
        let store = MirrorStore::open_in_memory().unwrap();
        let contract = VotingContract::open_in_memory(Arc::new(SingleOwner::new(OWNER))).unwrap();
        Self::from_parts(store, contract, routing, retry)
    }

    pub fn from_parts(
        store: MirrorStore,
        contract: VotingContract,
        routing: VoteRouting,
        retry: RetryPolicy,
    ) -> Self {
        let inner = LocalChainClient::new(contract, OWNER);
        let contract = inner.contract();
        let chain = Arc::new(FlakyChainClient::new(inner));
        let service = ElectionService::with_policy(
            store.clone(),
            Arc::clone(&chain) as Arc<dyn ChainClient>,
            retry,
            routing,
        );
        Self {
            service,
            store,
            chain,
            contract,
        }
    }

    /// The "Board Election" with Alice (Green) and Bob (Blue), still Draft.
    pub fn board_election(&self) -> (Election, Candidate, Candidate) {
        let election = self.service.create_election("Board Election").unwrap();
        let alice = self.service.add_candidate(&election.id, "Alice", "Green").unwrap();
        let bob = self.service.add_candidate(&election.id, "Bob", "Blue").unwrap();
        (election, alice, bob)
    }

    pub fn ledger_election(&self, election_id: &ElectionId) -> Option<OnChainElection> {
        self.contract
            .lock()
            .unwrap()
            .get_election(election_id.as_str())
            .unwrap()
    }

    pub fn ledger_candidate(&self, election_id: &ElectionId, candidate_id: CandidateId) -> Option<OnChainCandidate> {
        self.contract
            .lock()
            .unwrap()
            .get_candidate(election_id.as_str(), candidate_id)
            .unwrap()
    }

    pub fn ledger_block(&self) -> u64 {
        self.contract.lock().unwrap().latest_block().unwrap()
    }
}
