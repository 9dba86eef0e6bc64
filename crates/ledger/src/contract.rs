//! Local election contract host
//!
//! Reproduces the on-chain election contract on top of SQLite: contract
//! storage lives in `chain_*` tables and every accepted transaction appends
//! one event to the hash-chained log in the same database transaction. The
//! event's sequence number is the block height of the transaction.
//!
//! Admin calls (`create_election`, `add_candidate`, `set_election_status`)
//! are gated by the configured [`AdminPolicy`]. `cast_vote` is identified by
//! its sender and computes the vote hash over the sender, the candidate, the
//! block timestamp and the block height.

use crate::error::{ContractError, LedgerError, Result};
use crate::events::{self, ContractEvent, LedgerHealth, LoggedEvent};
use crate::policy::{AdminAction, AdminPolicy};
use rusqlite::{params, Connection, OpenFlags, OptionalExtension, Transaction, TransactionBehavior};
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::sync::Arc;
use tracing::{debug, info, warn};
use votechain_core::clock::now_millis;
use votechain_core::{compute_receipt_hash, CandidateId, ReceiptHash, ReceiptInput};

/// Election as held in contract storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainElection {
    pub election_id: String,
    pub title: String,
    pub is_active: bool,
    pub candidate_count: u32,
    pub created_block: u64,
}

/// Candidate as held in contract storage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainCandidate {
    pub election_id: String,
    pub candidate_id: CandidateId,
    pub name: String,
    pub party: String,
    pub vote_count: u64,
}

/// Inclusion proof of an accepted transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxReceipt {
    /// Block height (event sequence number)
    pub block: u64,
    /// Block timestamp (Unix milliseconds)
    pub timestamp: u64,
}

/// A vote as held in contract storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct OnChainVote {
    pub candidate_id: CandidateId,
    pub hash: ReceiptHash,
    /// Transaction that recorded the vote
    pub tx: TxReceipt,
}

/// Result of an accepted `cast_vote`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CastOutcome {
    pub hash: ReceiptHash,
    pub tx: TxReceipt,
}

/// Election contract host
pub struct VotingContract {
    conn: Connection,
    policy: Arc<dyn AdminPolicy>,
    health: LedgerHealth,
}

impl VotingContract {
    /// Open (or deploy) the contract at `path`.
    ///
    /// The first open records the policy owner as contract owner; later opens
    /// must present the same owner. Fails if the event log is corrupted.
    pub fn open(path: impl AsRef<Path>, policy: Arc<dyn AdminPolicy>) -> Result<Self> {
        let path = path.as_ref();

        info!(path = %path.display(), owner = %policy.owner(), "Opening contract host");

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        Self::deploy(conn, policy)
    }

    /// Ephemeral contract, for tests and dry runs.
    pub fn open_in_memory(policy: Arc<dyn AdminPolicy>) -> Result<Self> {
        Self::deploy(Connection::open_in_memory()?, policy)
    }

    fn deploy(conn: Connection, policy: Arc<dyn AdminPolicy>) -> Result<Self> {
        Self::init_schema(&conn)?;

        let stored: Option<String> = conn
            .query_row(
                "SELECT value FROM contract_meta WHERE key = 'owner'",
                [],
                |row| row.get(0),
            )
            .optional()?;
        match stored {
            Some(stored) if stored != policy.owner() => {
                return Err(LedgerError::OwnerMismatch {
                    stored,
                    configured: policy.owner().to_string(),
                })
            }
            Some(_) => {}
            None => {
                conn.execute(
                    "INSERT INTO contract_meta (key, value) VALUES ('owner', ?1)",
                    [policy.owner()],
                )?;
                info!(owner = %policy.owner(), "Contract deployed");
            }
        }

        let mut contract = Self {
            conn,
            policy,
            health: LedgerHealth::Ok,
        };
        contract.startup_continuity_check()?;
        Ok(contract)
    }

    fn init_schema(conn: &Connection) -> Result<()> {
        conn.execute_batch(
            r#"
            CREATE TABLE IF NOT EXISTS contract_meta (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chain_elections (
                election_id TEXT PRIMARY KEY,
                title TEXT NOT NULL,
                is_active INTEGER NOT NULL DEFAULT 0,
                candidate_count INTEGER NOT NULL DEFAULT 0,
                created_block INTEGER NOT NULL
            );

            CREATE TABLE IF NOT EXISTS chain_candidates (
                election_id TEXT NOT NULL,
                candidate_id INTEGER NOT NULL,
                name TEXT NOT NULL,
                party TEXT NOT NULL,
                vote_count INTEGER NOT NULL DEFAULT 0,
                PRIMARY KEY (election_id, candidate_id)
            );

            CREATE TABLE IF NOT EXISTS chain_votes (
                election_id TEXT NOT NULL,
                voter TEXT NOT NULL,
                candidate_id INTEGER NOT NULL,
                hash BLOB NOT NULL,
                block INTEGER NOT NULL,
                cast_at INTEGER NOT NULL,
                PRIMARY KEY (election_id, voter)
            );
            "#,
        )?;
        events::init_schema(conn)
    }

    /// Verify the event log and refuse writes if it is broken.
    pub fn startup_continuity_check(&mut self) -> Result<()> {
        self.health = events::continuity_check(&self.conn)?;
        match &self.health {
            LedgerHealth::Ok => Ok(()),
            LedgerHealth::Corrupted { error_type, .. } => {
                Err(LedgerError::CorruptionDetected(error_type.clone()))
            }
        }
    }

    pub fn health(&self) -> &LedgerHealth {
        &self.health
    }

    pub fn owner(&self) -> &str {
        self.policy.owner()
    }

    /// Current block height (0 before the first transaction).
    pub fn latest_block(&self) -> Result<u64> {
        Ok(events::latest(&self.conn)?.map(|(seq_no, _)| seq_no).unwrap_or(0))
    }

    fn begin(&mut self) -> Result<Transaction<'_>> {
        if !self.health.is_ok() {
            warn!("Attempted to transact on a corrupted contract log");
            return Err(LedgerError::CorruptionDetected(
                "Cannot append to corrupted ledger".to_string(),
            ));
        }
        Ok(self
            .conn
            .transaction_with_behavior(TransactionBehavior::Immediate)?)
    }

    pub fn create_election(&mut self, sender: &str, election_id: &str, title: &str) -> Result<TxReceipt> {
        self.policy.authorize(sender, AdminAction::CreateElection)?;
        if election_id.is_empty() {
            return Err(ContractError::InvalidInput("election id must not be empty".into()).into());
        }

        let timestamp = now_millis();
        let tx = self.begin()?;
        if load_election(&tx, election_id)?.is_some() {
            return Err(ContractError::ElectionExists(election_id.to_string()).into());
        }

        let block = events::next_seq_no(&tx)?;
        tx.execute(
            "INSERT INTO chain_elections (election_id, title, created_block) VALUES (?1, ?2, ?3)",
            params![election_id, title, block as i64],
        )?;
        let block = events::append(
            &tx,
            timestamp,
            &ContractEvent::ElectionCreated {
                election_id: election_id.to_string(),
                title: title.to_string(),
            },
        )?;
        tx.commit()?;

        info!(election_id, block, "ElectionCreated");
        Ok(TxReceipt { block, timestamp })
    }

    pub fn add_candidate(
        &mut self,
        sender: &str,
        election_id: &str,
        candidate_id: CandidateId,
        name: &str,
        party: &str,
    ) -> Result<TxReceipt> {
        self.policy.authorize(sender, AdminAction::AddCandidate)?;

        let timestamp = now_millis();
        let tx = self.begin()?;
        let election = load_election(&tx, election_id)?
            .ok_or_else(|| ContractError::ElectionNotFound(election_id.to_string()))?;
        if election.is_active {
            return Err(ContractError::ElectionActive(election_id.to_string()).into());
        }
        if candidate_id == 0 {
            return Err(ContractError::InvalidCandidate {
                election_id: election_id.to_string(),
                candidate_id,
            }
            .into());
        }
        if load_candidate(&tx, election_id, candidate_id)?.is_some() {
            return Err(ContractError::CandidateExists {
                election_id: election_id.to_string(),
                candidate_id,
            }
            .into());
        }

        tx.execute(
            "INSERT INTO chain_candidates (election_id, candidate_id, name, party) VALUES (?1, ?2, ?3, ?4)",
            params![election_id, candidate_id as i64, name, party],
        )?;
        tx.execute(
            "UPDATE chain_elections SET candidate_count = candidate_count + 1 WHERE election_id = ?1",
            [election_id],
        )?;
        let block = events::append(
            &tx,
            timestamp,
            &ContractEvent::CandidateAdded {
                election_id: election_id.to_string(),
                candidate_id,
                name: name.to_string(),
                party: party.to_string(),
            },
        )?;
        tx.commit()?;

        info!(election_id, candidate_id, block, "CandidateAdded");
        Ok(TxReceipt { block, timestamp })
    }

    /// Toggle voting. At most one election is active on-chain at a time.
    pub fn set_election_status(&mut self, sender: &str, election_id: &str, is_active: bool) -> Result<TxReceipt> {
        self.policy.authorize(sender, AdminAction::SetElectionStatus)?;

        let timestamp = now_millis();
        let tx = self.begin()?;
        let election = load_election(&tx, election_id)?
            .ok_or_else(|| ContractError::ElectionNotFound(election_id.to_string()))?;

        if is_active && !election.is_active {
            let active: Option<String> = tx
                .query_row(
                    "SELECT election_id FROM chain_elections WHERE is_active = 1 LIMIT 1",
                    [],
                    |row| row.get(0),
                )
                .optional()?;
            if let Some(active) = active {
                return Err(ContractError::AnotherElectionActive { active }.into());
            }
        }

        tx.execute(
            "UPDATE chain_elections SET is_active = ?2 WHERE election_id = ?1",
            params![election_id, is_active],
        )?;
        let block = events::append(
            &tx,
            timestamp,
            &ContractEvent::ElectionStatusChanged {
                election_id: election_id.to_string(),
                is_active,
            },
        )?;
        tx.commit()?;

        info!(election_id, is_active, block, "ElectionStatusChanged");
        Ok(TxReceipt { block, timestamp })
    }

    /// Cast `sender`'s vote.
    pub fn cast_vote(&mut self, sender: &str, election_id: &str, candidate_id: CandidateId) -> Result<CastOutcome> {
        let timestamp = now_millis();
        let tx = self.begin()?;

        let election = load_election(&tx, election_id)?
            .ok_or_else(|| ContractError::ElectionNotFound(election_id.to_string()))?;
        if !election.is_active {
            return Err(ContractError::ElectionNotActive(election_id.to_string()).into());
        }
        if load_vote(&tx, election_id, sender)?.is_some() {
            return Err(ContractError::AlreadyVoted {
                election_id: election_id.to_string(),
                voter: sender.to_string(),
            }
            .into());
        }
        if candidate_id == 0 || load_candidate(&tx, election_id, candidate_id)?.is_none() {
            return Err(ContractError::InvalidCandidate {
                election_id: election_id.to_string(),
                candidate_id,
            }
            .into());
        }

        let block = events::next_seq_no(&tx)?;
        let hash = compute_receipt_hash(&ReceiptInput {
            election_id,
            voter: sender,
            candidate_id,
            timestamp,
            sequence: block,
        });

        tx.execute(
            "INSERT INTO chain_votes (election_id, voter, candidate_id, hash, block, cast_at)
             VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
            params![
                election_id,
                sender,
                candidate_id as i64,
                &hash.as_bytes()[..],
                block as i64,
                timestamp as i64
            ],
        )?;
        tx.execute(
            "UPDATE chain_candidates SET vote_count = vote_count + 1 WHERE election_id = ?1 AND candidate_id = ?2",
            params![election_id, candidate_id as i64],
        )?;
        let appended = events::append(
            &tx,
            timestamp,
            &ContractEvent::VoteCast {
                election_id: election_id.to_string(),
                voter: sender.to_string(),
                candidate_id,
                hash,
            },
        )?;
        tx.commit()?;

        debug_assert_eq!(appended, block);
        info!(election_id, voter = sender, candidate_id, block, "VoteCast");
        Ok(CastOutcome {
            hash,
            tx: TxReceipt { block, timestamp },
        })
    }

    pub fn get_election(&self, election_id: &str) -> Result<Option<OnChainElection>> {
        load_election(&self.conn, election_id)
    }

    pub fn get_candidate(&self, election_id: &str, candidate_id: CandidateId) -> Result<Option<OnChainCandidate>> {
        load_candidate(&self.conn, election_id, candidate_id)
    }

    pub fn check_if_voted(&self, election_id: &str, voter: &str) -> Result<bool> {
        Ok(load_vote(&self.conn, election_id, voter)?.is_some())
    }

    /// Stored vote hash for `(election, voter)`.
    pub fn get_vote_hash(&self, election_id: &str, voter: &str) -> Result<Option<ReceiptHash>> {
        debug!(election_id, voter, "Vote hash lookup");
        Ok(load_vote(&self.conn, election_id, voter)?.map(|vote| vote.hash))
    }

    /// Full vote record for `(election, voter)`.
    pub fn get_vote(&self, election_id: &str, voter: &str) -> Result<Option<OnChainVote>> {
        load_vote(&self.conn, election_id, voter)
    }

    /// Events with `seq_no >= from_seq_no`, oldest first.
    pub fn events_since(&self, from_seq_no: u64, limit: usize) -> Result<Vec<LoggedEvent>> {
        events::read_since(&self.conn, from_seq_no, limit)
    }

    /// Execute raw SQL for testing purposes only
    ///
    /// **WARNING**: bypasses contract rules and the event log. Only tests use
    /// it, to simulate tampering.
    #[doc(hidden)]
    pub fn __test_execute_raw_sql(&self, sql: &str, params: &[&dyn rusqlite::ToSql]) -> Result<usize> {
        Ok(self.conn.execute(sql, params)?)
    }
}

fn load_election(conn: &Connection, election_id: &str) -> Result<Option<OnChainElection>> {
    Ok(conn
        .query_row(
            "SELECT election_id, title, is_active, candidate_count, created_block
             FROM chain_elections WHERE election_id = ?1",
            [election_id],
            |row| {
                Ok(OnChainElection {
                    election_id: row.get(0)?,
                    title: row.get(1)?,
                    is_active: row.get(2)?,
                    candidate_count: row.get::<_, i64>(3)? as u32,
                    created_block: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .optional()?)
}

fn load_candidate(conn: &Connection, election_id: &str, candidate_id: CandidateId) -> Result<Option<OnChainCandidate>> {
    Ok(conn
        .query_row(
            "SELECT election_id, candidate_id, name, party, vote_count
             FROM chain_candidates WHERE election_id = ?1 AND candidate_id = ?2",
            params![election_id, candidate_id as i64],
            |row| {
                Ok(OnChainCandidate {
                    election_id: row.get(0)?,
                    candidate_id: row.get::<_, i64>(1)? as CandidateId,
                    name: row.get(2)?,
                    party: row.get(3)?,
                    vote_count: row.get::<_, i64>(4)? as u64,
                })
            },
        )
        .optional()?)
}

fn load_vote(conn: &Connection, election_id: &str, voter: &str) -> Result<Option<OnChainVote>> {
    let row = conn
        .query_row(
            "SELECT candidate_id, hash, block, cast_at FROM chain_votes WHERE election_id = ?1 AND voter = ?2",
            params![election_id, voter],
            |row| {
                Ok((
                    row.get::<_, i64>(0)? as CandidateId,
                    row.get::<_, Vec<u8>>(1)?,
                    TxReceipt {
                        block: row.get::<_, i64>(2)? as u64,
                        timestamp: row.get::<_, i64>(3)? as u64,
                    },
                ))
            },
        )
        .optional()?;

    match row {
        Some((candidate_id, bytes, tx)) => {
            let hash = ReceiptHash::from_slice(&bytes).ok_or_else(|| {
                LedgerError::CorruptionDetected(format!(
                    "vote hash for {} in {} is {} bytes",
                    voter,
                    election_id,
                    bytes.len()
                ))
            })?;
            Ok(Some(OnChainVote {
                candidate_id,
                hash,
                tx,
            }))
        }
        None => Ok(None),
    }
}
