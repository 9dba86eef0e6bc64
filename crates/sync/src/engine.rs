//! Chain synchronization engine
//!
//! The engine is the only writer to the ledger. It projects elections and
//! their candidate rosters from the mirror onto the ledger, toggles on-chain
//! activation, anchors votes when routing is `ledger_anchored`, and
//! reconciles vote counts.
//!
//! Syncing is resumable: progress is written to the election's `SyncState`
//! after every ledger transaction, and before (re)submitting anything the
//! engine asks the ledger whether it already holds it. A create that timed
//! out but landed is therefore never submitted twice.
//!
//! Operations on different elections run concurrently; operations on the
//! same election are serialized by a per-election async mutex.

use crate::reconcile::{CountDivergence, ReconciliationReport};
use crate::retry::RetryPolicy;
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};
use tokio::sync::OwnedMutexGuard;
use tracing::{debug, info, warn};
use votechain_core::clock::now_millis;
use votechain_core::{
    Candidate, CandidateId, ElectionError, ElectionId, ElectionState, ReceiptHash, Result,
    SyncState, VoteReceipt, VoteRouting, VoterId,
};
use votechain_ledger::{ChainClient, ChainStatus, OnChainCandidate, TxReceipt};
use votechain_mirror::MirrorStore;

pub struct ChainSyncEngine {
    store: MirrorStore,
    chain: Arc<dyn ChainClient>,
    retry: RetryPolicy,
    routing: VoteRouting,
    locks: Mutex<HashMap<ElectionId, Arc<tokio::sync::Mutex<()>>>>,
}

impl ChainSyncEngine {
    pub fn new(
        store: MirrorStore,
        chain: Arc<dyn ChainClient>,
        retry: RetryPolicy,
        routing: VoteRouting,
    ) -> Self {
        Self {
            store,
            chain,
            retry,
            routing,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn routing(&self) -> VoteRouting {
        self.routing
    }

    pub fn retry_policy(&self) -> &RetryPolicy {
        &self.retry
    }

    async fn lock_election(&self, election_id: &ElectionId) -> Result<OwnedMutexGuard<()>> {
        let lock = {
            let mut locks = self
                .locks
                .lock()
                .map_err(|_| ElectionError::Storage("election lock table poisoned".to_string()))?;
            Arc::clone(locks.entry(election_id.clone()).or_default())
        };
        Ok(lock.lock_owned().await)
    }

    /// Push the election and every candidate not yet on the ledger.
    ///
    /// Safe to call any number of times; a call with nothing left to push
    /// makes no ledger writes and returns the stored state unchanged.
    pub async fn sync_election(&self, election_id: &ElectionId) -> Result<SyncState> {
        let _guard = self.lock_election(election_id).await?;

        let election = self.store.elections().get(election_id)?;
        let candidates = self.store.candidates().list(election_id)?;
        let states = self.store.sync_states();
        let mut state = states.get(election_id)?;
        let before = state.clone();

        if !state.election_on_chain {
            let existing = self
                .retry
                .run("getElection", || self.chain.get_election(election_id))
                .await?;

            match existing {
                Some(on_chain) if on_chain.title != election.title => {
                    return Err(ElectionError::SyncConflict {
                        election_id: election_id.clone(),
                        detail: format!(
                            "ledger holds this id with title '{}', mirror has '{}'",
                            on_chain.title, election.title
                        ),
                    });
                }
                Some(_) => {
                    debug!(election_id = %election_id, "Election already on ledger");
                }
                None => {
                    let created = self
                        .retry
                        .run("createElection", || {
                            self.chain.create_election(election_id, &election.title)
                        })
                        .await;
                    match created {
                        Ok(tx) => {
                            info!(election_id = %election_id, block = tx.block, "Election pushed to ledger")
                        }
                        // An earlier attempt landed after its deadline
                        Err(ElectionError::AlreadyExists(_)) => {
                            debug!(election_id = %election_id, "Election create already applied")
                        }
                        Err(e) => return Err(e),
                    }
                }
            }

            state.election_on_chain = true;
            state.synced = false;
            states.save(&state)?;
        }

        let pending: Vec<&Candidate> = candidates
            .iter()
            .filter(|c| c.id > state.candidates_synced_through)
            .collect();
        if !pending.is_empty() {
            state.synced = false;
        }

        for candidate in pending {
            let on_chain = self
                .retry
                .run("getCandidate", || {
                    self.chain.get_candidate(election_id, candidate.id)
                })
                .await?;

            match on_chain {
                Some(existing) => {
                    check_candidate_matches(election_id, candidate, &existing)?;
                    debug!(
                        election_id = %election_id,
                        candidate_id = candidate.id,
                        "Candidate already on ledger"
                    );
                }
                None => {
                    let added = self
                        .retry
                        .run("addCandidate", || {
                            self.chain.add_candidate(
                                election_id,
                                candidate.id,
                                &candidate.name,
                                &candidate.party,
                            )
                        })
                        .await;
                    match added {
                        Ok(tx) => info!(
                            election_id = %election_id,
                            candidate_id = candidate.id,
                            block = tx.block,
                            "Candidate pushed to ledger"
                        ),
                        Err(ElectionError::AlreadyExists(_)) => {}
                        Err(e) => return Err(e),
                    }
                }
            }

            state.candidates_synced_through = candidate.id;
            states.save(&state)?;
        }

        state.synced = true;

        if state != before {
            states.save(&state)?;
            info!(
                election_id = %election_id,
                candidates_synced_through = state.candidates_synced_through,
                "Election synced"
            );
        } else {
            debug!(election_id = %election_id, "Election already in sync");
        }
        Ok(state)
    }

    /// Open or close voting on the ledger. Requires a completed sync.
    pub async fn set_on_chain_active(&self, election_id: &ElectionId, active: bool) -> Result<SyncState> {
        let _guard = self.lock_election(election_id).await?;

        let candidates = self.store.candidates().list(election_id)?;
        let states = self.store.sync_states();
        let mut state = states.get(election_id)?;
        if !is_fully_synced(&state, &candidates) {
            return Err(ElectionError::NotSynced(election_id.clone()));
        }

        let tx = self
            .retry
            .run("setElectionStatus", || {
                self.chain.set_election_status(election_id, active)
            })
            .await?;

        state.on_chain_active = Some(active);
        states.save(&state)?;
        info!(election_id = %election_id, active, block = tx.block, "On-chain activation updated");
        Ok(state)
    }

    /// Cast a vote according to the configured routing.
    ///
    /// With `ledger_anchored` routing the mirror preconditions are checked
    /// first so nothing doomed reaches the ledger; the vote is then sent as
    /// the voter and recorded in the mirror under the ledger's receipt. The
    /// election lock is held throughout so a reconciliation cannot land
    /// between the ledger commit and the mirror write.
    ///
    /// If the ledger already holds this voter's vote although the mirror has
    /// none, an earlier submission committed without being acknowledged. The
    /// ledger's vote is adopted when it is for the same candidate.
    pub async fn submit_vote(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
    ) -> Result<VoteReceipt> {
        let votes = self.store.votes();

        if self.routing == VoteRouting::MirrorOnly {
            return votes.cast_vote(election_id, voter, candidate_id);
        }

        let _guard = self.lock_election(election_id).await?;

        votes.check_ballot(election_id, voter, candidate_id)?;

        let state = self.store.sync_states().get(election_id)?;
        if !state.synced || state.candidates_synced_through < candidate_id {
            return Err(ElectionError::NotSynced(election_id.clone()));
        }

        let cast = self
            .retry
            .run("castVote", || {
                self.chain.cast_vote(voter, election_id, candidate_id)
            })
            .await;
        let (hash, tx) = match cast {
            Ok(outcome) => (outcome.hash, outcome.tx),
            Err(ElectionError::AlreadyVoted { .. }) => {
                self.adopt_ledger_vote(election_id, voter, candidate_id)
                    .await?
            }
            Err(e) => return Err(e),
        };

        votes
            .record_anchored_vote(election_id, voter, candidate_id, hash, tx.timestamp, tx.block)
            .map_err(|e| {
                warn!(
                    election_id = %election_id,
                    voter = %voter,
                    block = tx.block,
                    error = %e,
                    "Vote anchored on ledger but not recorded in mirror"
                );
                e
            })
    }

    async fn adopt_ledger_vote(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
    ) -> Result<(ReceiptHash, TxReceipt)> {
        let on_chain = self
            .retry
            .run("getVote", || self.chain.get_vote(election_id, voter))
            .await?
            .ok_or_else(|| ElectionError::SyncConflict {
                election_id: election_id.clone(),
                detail: format!("ledger refused a second vote by {} but holds none", voter),
            })?;

        if on_chain.candidate_id != candidate_id {
            warn!(
                election_id = %election_id,
                voter = %voter,
                requested = candidate_id,
                on_chain = on_chain.candidate_id,
                block = on_chain.tx.block,
                "Ledger holds a different vote for this voter"
            );
            return Err(ElectionError::SyncConflict {
                election_id: election_id.clone(),
                detail: format!(
                    "ledger holds a vote by {} for candidate {}, not {}",
                    voter, on_chain.candidate_id, candidate_id
                ),
            });
        }

        info!(
            election_id = %election_id,
            voter = %voter,
            candidate_id,
            block = on_chain.tx.block,
            "Adopted unacknowledged vote from ledger"
        );
        Ok((on_chain.hash, on_chain.tx))
    }

    /// Compare mirror counts with the ledger and, when the ledger is the vote
    /// record, correct the mirror.
    pub async fn reconcile(&self, election_id: &ElectionId) -> Result<ReconciliationReport> {
        let _guard = self.lock_election(election_id).await?;

        let election = self.store.elections().get(election_id)?;
        let candidates = self.store.candidates().list(election_id)?;
        let states = self.store.sync_states();
        let mut state = states.get(election_id)?;

        if !state.election_on_chain {
            return Err(ElectionError::NotSynced(election_id.clone()));
        }

        let on_chain = self
            .retry
            .run("getElection", || self.chain.get_election(election_id))
            .await?
            .ok_or_else(|| ElectionError::SyncConflict {
                election_id: election_id.clone(),
                detail: "election recorded as synced is missing from the ledger".to_string(),
            })?;

        let mut ledger_counts: BTreeMap<CandidateId, u64> = BTreeMap::new();
        let mut divergences = Vec::new();
        let mut unsynced_candidates = Vec::new();

        for candidate in &candidates {
            let existing = self
                .retry
                .run("getCandidate", || {
                    self.chain.get_candidate(election_id, candidate.id)
                })
                .await?;

            let Some(existing) = existing else {
                if candidate.id <= state.candidates_synced_through {
                    return Err(ElectionError::SyncConflict {
                        election_id: election_id.clone(),
                        detail: format!(
                            "candidate {} recorded as synced is missing from the ledger",
                            candidate.id
                        ),
                    });
                }
                unsynced_candidates.push(candidate.id);
                continue;
            };

            check_candidate_matches(election_id, candidate, &existing)?;
            ledger_counts.insert(candidate.id, existing.vote_count);

            if existing.vote_count != candidate.vote_count {
                warn!(
                    election_id = %election_id,
                    candidate_id = candidate.id,
                    mirror = candidate.vote_count,
                    ledger = existing.vote_count,
                    "Vote count divergence"
                );
                divergences.push(CountDivergence {
                    candidate_id: candidate.id,
                    name: candidate.name.clone(),
                    mirror_votes: candidate.vote_count,
                    ledger_votes: existing.vote_count,
                });
            }
        }

        let corrected = self.routing == VoteRouting::LedgerAnchored && !divergences.is_empty();
        if corrected {
            self.store
                .votes()
                .correct_vote_counts(election_id, &ledger_counts)?;
        }

        let reconciled_at = now_millis();
        state.last_reconciled_at = Some(reconciled_at);
        state.last_reconciled_counts = ledger_counts;
        states.save(&state)?;

        let report = ReconciliationReport {
            election_id: election_id.clone(),
            routing: self.routing,
            mirror_active: election.state == ElectionState::Active,
            ledger_active: on_chain.is_active,
            divergences,
            corrected,
            unsynced_candidates,
            reconciled_at,
        };

        info!(
            election_id = %election_id,
            divergences = report.divergences.len(),
            corrected = report.corrected,
            consistent = report.is_consistent(),
            "Reconciliation finished"
        );
        Ok(report)
    }

    /// Ledger connection and health summary.
    pub async fn chain_status(&self) -> Result<ChainStatus> {
        self.retry.run("status", || self.chain.status()).await
    }
}

fn is_fully_synced(state: &SyncState, candidates: &[Candidate]) -> bool {
    state.synced
        && candidates
            .iter()
            .all(|c| c.id <= state.candidates_synced_through)
}

fn check_candidate_matches(
    election_id: &ElectionId,
    candidate: &Candidate,
    on_chain: &OnChainCandidate,
) -> Result<()> {
    if on_chain.name != candidate.name || on_chain.party != candidate.party {
        return Err(ElectionError::SyncConflict {
            election_id: election_id.clone(),
            detail: format!(
                "candidate {} is '{}' ({}) on the ledger but '{}' ({}) in the mirror",
                candidate.id, on_chain.name, on_chain.party, candidate.name, candidate.party
            ),
        });
    }
    Ok(())
}
