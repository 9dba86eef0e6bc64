//! Vote proof verification against the ledger.

use crate::retry::RetryPolicy;
use std::sync::Arc;
use tracing::debug;
use votechain_core::{ElectionId, ReceiptHash, Result, VoterId};
use votechain_ledger::ChainClient;

/// Checks voter receipts against the hashes the ledger stored.
///
/// Reads from the ledger only; the mirror is never consulted.
#[derive(Clone)]
pub struct VoteProofVerifier {
    chain: Arc<dyn ChainClient>,
    retry: RetryPolicy,
}

impl VoteProofVerifier {
    pub fn new(chain: Arc<dyn ChainClient>, retry: RetryPolicy) -> Self {
        Self { chain, retry }
    }

    /// True iff the ledger holds exactly `claimed_hash` for this voter.
    ///
    /// A malformed hash or a missing vote is `false`; an unreachable ledger
    /// is an error.
    pub async fn verify(&self, election_id: &ElectionId, voter: &VoterId, claimed_hash: &str) -> Result<bool> {
        let claimed: ReceiptHash = match claimed_hash.trim().parse() {
            Ok(hash) => hash,
            Err(e) => {
                debug!(election_id = %election_id, voter = %voter, error = %e, "Malformed vote hash");
                return Ok(false);
            }
        };
        self.verify_receipt(election_id, voter, &claimed).await
    }

    pub async fn verify_receipt(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        claimed: &ReceiptHash,
    ) -> Result<bool> {
        let stored = self
            .retry
            .run("getVoteHash", || self.chain.get_vote_hash(election_id, voter))
            .await?;

        let verified = stored.as_ref() == Some(claimed);
        debug!(
            election_id = %election_id,
            voter = %voter,
            on_ledger = stored.is_some(),
            verified,
            "Vote proof checked"
        );
        Ok(verified)
    }
}
