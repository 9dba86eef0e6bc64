//! Vote recording
//!
//! `cast_vote` evaluates its preconditions in a fixed order and reports the
//! first one that fails:
//!
//! 1. the election exists (`NotFound`)
//! 2. the election is Active and inside its voting window (`InvalidState`)
//! 3. the candidate id is non-zero and registered (`InvalidCandidate`)
//! 4. the voter has not voted in this election (`AlreadyVoted`)
//!
//! The checks, the vote row and the candidate count increment share one
//! immediate transaction. The `UNIQUE(election_id, voter)` constraint turns
//! any race that gets past check 4 into `AlreadyVoted`.

use crate::candidates::{load_candidate, load_candidates};
use crate::elections::require_election;
use crate::store::{is_constraint_violation, MirrorStore};
use rusqlite::{params, Connection, OptionalExtension, Row};
use std::collections::BTreeMap;
use tracing::{debug, info, warn};
use votechain_core::clock::now_millis;
use votechain_core::types::rank_results;
use votechain_core::{
    compute_receipt_hash, Candidate, CandidateId, Election, ElectionError, ElectionId,
    ReceiptHash, ReceiptInput, Result, ResultsSummary, VoteReceipt, VoteRecord, VoterId,
};

const VOTE_COLUMNS: &str = "election_id, voter, candidate_id, receipt, sequence, cast_at, ledger_tx";

fn vote_from_row(row: &Row<'_>) -> rusqlite::Result<VoteRecord> {
    let receipt: Vec<u8> = row.get(3)?;
    let receipt = ReceiptHash::from_slice(&receipt).ok_or_else(|| {
        rusqlite::Error::FromSqlConversionFailure(
            3,
            rusqlite::types::Type::Blob,
            format!("receipt must be 32 bytes, got {}", receipt.len()).into(),
        )
    })?;

    Ok(VoteRecord {
        election_id: ElectionId::from(row.get::<_, String>(0)?),
        voter: VoterId::from(row.get::<_, String>(1)?),
        candidate_id: row.get::<_, i64>(2)? as CandidateId,
        receipt,
        sequence: row.get::<_, i64>(4)? as u64,
        cast_at: row.get::<_, i64>(5)? as u64,
        ledger_tx: row.get::<_, Option<i64>>(6)?.map(|v| v as u64),
    })
}

fn load_vote(conn: &Connection, election_id: &ElectionId, voter: &VoterId) -> Result<Option<VoteRecord>> {
    let sql = format!(
        "SELECT {} FROM votes WHERE election_id = ?1 AND voter = ?2",
        VOTE_COLUMNS
    );
    Ok(conn
        .query_row(&sql, params![election_id.as_str(), voter.as_str()], vote_from_row)
        .optional()?)
}

/// Evaluate the ballot preconditions in order.
///
/// With `require_open` false the lifecycle check is skipped; used when the
/// ledger has already accepted the vote.
fn check_ballot_in(
    conn: &Connection,
    election_id: &ElectionId,
    voter: &VoterId,
    candidate_id: CandidateId,
    now: u64,
    require_open: bool,
) -> Result<Election> {
    let election = require_election(conn, election_id)?;

    if require_open {
        election
            .check_accepts_votes(now)
            .map_err(ElectionError::InvalidState)?;
    }

    if candidate_id == 0 || load_candidate(conn, election_id, candidate_id)?.is_none() {
        return Err(ElectionError::InvalidCandidate {
            election_id: election_id.clone(),
            candidate_id,
        });
    }

    if load_vote(conn, election_id, voter)?.is_some() {
        return Err(ElectionError::AlreadyVoted {
            election_id: election_id.clone(),
            voter: voter.clone(),
        });
    }

    Ok(election)
}

fn next_sequence(conn: &Connection) -> Result<u64> {
    conn.execute(
        "UPDATE counters SET value = value + 1 WHERE name = 'vote_sequence'",
        [],
    )?;
    let value: i64 = conn.query_row(
        "SELECT value FROM counters WHERE name = 'vote_sequence'",
        [],
        |row| row.get(0),
    )?;
    Ok(value as u64)
}

fn insert_vote(conn: &Connection, record: &VoteRecord) -> Result<()> {
    let inserted = conn.execute(
        "INSERT INTO votes (election_id, voter, candidate_id, receipt, sequence, cast_at, ledger_tx)
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            record.election_id.as_str(),
            record.voter.as_str(),
            record.candidate_id as i64,
            &record.receipt.as_bytes()[..],
            record.sequence as i64,
            record.cast_at as i64,
            record.ledger_tx.map(|v| v as i64),
        ],
    );

    match inserted {
        Ok(_) => {}
        Err(e) if is_constraint_violation(&e) => {
            return Err(ElectionError::AlreadyVoted {
                election_id: record.election_id.clone(),
                voter: record.voter.clone(),
            })
        }
        Err(e) => return Err(e.into()),
    }

    conn.execute(
        "UPDATE candidates SET vote_count = vote_count + 1 WHERE election_id = ?1 AND candidate_id = ?2",
        params![record.election_id.as_str(), record.candidate_id as i64],
    )?;
    Ok(())
}

/// Owner of vote records and candidate vote counts.
#[derive(Clone)]
pub struct VoteLedger {
    store: MirrorStore,
}

impl VoteLedger {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Record a vote and return its receipt.
    pub fn cast_vote(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
    ) -> Result<VoteReceipt> {
        let record = self.store.write(|tx| {
            let now = now_millis();
            check_ballot_in(tx, election_id, voter, candidate_id, now, true)?;

            let sequence = next_sequence(tx)?;
            let receipt = compute_receipt_hash(&ReceiptInput {
                election_id: election_id.as_str(),
                voter: voter.as_str(),
                candidate_id,
                timestamp: now,
                sequence,
            });

            let record = VoteRecord {
                election_id: election_id.clone(),
                voter: voter.clone(),
                candidate_id,
                receipt,
                sequence,
                cast_at: now,
                ledger_tx: None,
            };
            insert_vote(tx, &record)?;
            Ok(record)
        })?;

        info!(
            election_id = %election_id,
            voter = %voter,
            candidate_id,
            receipt = %record.receipt,
            "Vote recorded"
        );
        Ok(VoteReceipt::from(&record))
    }

    /// Evaluate the preconditions of `cast_vote` without writing anything.
    pub fn check_ballot(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
    ) -> Result<Election> {
        self.store
            .read(|conn| check_ballot_in(conn, election_id, voter, candidate_id, now_millis(), true))
    }

    /// Record a vote the ledger has already accepted, keeping its receipt.
    ///
    /// `ledger_tx` is the ledger event sequence number of the vote and doubles
    /// as the receipt's uniqueness salt.
    pub fn record_anchored_vote(
        &self,
        election_id: &ElectionId,
        voter: &VoterId,
        candidate_id: CandidateId,
        receipt: ReceiptHash,
        cast_at: u64,
        ledger_tx: u64,
    ) -> Result<VoteReceipt> {
        let record = self.store.write(|tx| {
            check_ballot_in(tx, election_id, voter, candidate_id, cast_at, false)?;

            let record = VoteRecord {
                election_id: election_id.clone(),
                voter: voter.clone(),
                candidate_id,
                receipt,
                sequence: ledger_tx,
                cast_at,
                ledger_tx: Some(ledger_tx),
            };
            insert_vote(tx, &record)?;
            Ok(record)
        })?;

        info!(
            election_id = %election_id,
            voter = %voter,
            candidate_id,
            ledger_tx,
            "Anchored vote recorded"
        );
        Ok(VoteReceipt::from(&record))
    }

    pub fn has_voted(&self, election_id: &ElectionId, voter: &VoterId) -> Result<bool> {
        self.store
            .read(|conn| Ok(load_vote(conn, election_id, voter)?.is_some()))
    }

    /// The vote a voter cast in an election, if any.
    pub fn vote_of(&self, election_id: &ElectionId, voter: &VoterId) -> Result<Option<VoteRecord>> {
        self.store.read(|conn| {
            require_election(conn, election_id)?;
            load_vote(conn, election_id, voter)
        })
    }

    /// Candidates with their vote counts, most votes first.
    pub fn results(&self, election_id: &ElectionId) -> Result<Vec<(Candidate, u64)>> {
        self.store.read(|conn| {
            require_election(conn, election_id)?;
            let mut rows: Vec<(Candidate, u64)> = load_candidates(conn, election_id)?
                .into_iter()
                .map(|c| {
                    let votes = c.vote_count;
                    (c, votes)
                })
                .collect();
            rank_results(&mut rows);
            Ok(rows)
        })
    }

    /// Results with totals and percentages.
    pub fn summary(&self, election_id: &ElectionId) -> Result<ResultsSummary> {
        let election = self.store.read(|conn| require_election(conn, election_id))?;
        let rows = self.results(election_id)?;
        Ok(ResultsSummary::from_rows(&election, rows))
    }

    /// Vote rows per candidate, counted from the records themselves.
    pub fn recorded_counts(&self, election_id: &ElectionId) -> Result<BTreeMap<CandidateId, u64>> {
        self.store.read(|conn| {
            let mut stmt = conn.prepare(
                "SELECT candidate_id, COUNT(*) FROM votes WHERE election_id = ?1 GROUP BY candidate_id",
            )?;
            let counts = stmt
                .query_map([election_id.as_str()], |row| {
                    Ok((row.get::<_, i64>(0)? as CandidateId, row.get::<_, i64>(1)? as u64))
                })?
                .collect::<std::result::Result<BTreeMap<_, _>, _>>()?;
            Ok(counts)
        })
    }

    /// Overwrite candidate vote counts with authoritative values.
    ///
    /// Returns the candidates whose count changed as `(id, old, new)`.
    pub fn correct_vote_counts(
        &self,
        election_id: &ElectionId,
        counts: &BTreeMap<CandidateId, u64>,
    ) -> Result<Vec<(CandidateId, u64, u64)>> {
        let corrected = self.store.write(|tx| {
            require_election(tx, election_id)?;
            let mut corrected = Vec::new();
            for (&candidate_id, &count) in counts {
                let Some(candidate) = load_candidate(tx, election_id, candidate_id)? else {
                    debug!(election_id = %election_id, candidate_id, "Skipping unknown candidate");
                    continue;
                };
                if candidate.vote_count == count {
                    continue;
                }
                tx.execute(
                    "UPDATE candidates SET vote_count = ?3 WHERE election_id = ?1 AND candidate_id = ?2",
                    params![election_id.as_str(), candidate_id as i64, count as i64],
                )?;
                corrected.push((candidate_id, candidate.vote_count, count));
            }
            Ok(corrected)
        })?;

        for (candidate_id, old, new) in &corrected {
            warn!(
                election_id = %election_id,
                candidate_id,
                old,
                new,
                "Mirror vote count corrected"
            );
        }
        Ok(corrected)
    }
}
