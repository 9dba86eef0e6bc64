//! Election lifecycle in the mirror.
//!
//! Draft -> Active, Active -> Draft and Active -> Closed are the only
//! transitions. At most one election is Active: the check runs inside an
//! immediate transaction, and the partial unique index on `state = 'active'`
//! rejects anything that slips past it.

use crate::store::{is_constraint_violation, MirrorStore};
use rusqlite::types::Type;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::{debug, info};
use votechain_core::clock::now_millis;
use votechain_core::{Election, ElectionError, ElectionId, ElectionState, Result};

/// Shortest accepted election title (after trimming).
pub const MIN_TITLE_LEN: usize = 10;
/// Longest accepted election title (after trimming).
pub const MAX_TITLE_LEN: usize = 255;

pub(crate) const ELECTION_COLUMNS: &str =
    "id, title, state, candidate_count, opens_at, closes_at, created_at, updated_at";

pub(crate) fn election_from_row(row: &Row<'_>) -> rusqlite::Result<Election> {
    let state: String = row.get(2)?;
    let state = state
        .parse::<ElectionState>()
        .map_err(|e| rusqlite::Error::FromSqlConversionFailure(2, Type::Text, e.into()))?;

    Ok(Election {
        id: ElectionId::from(row.get::<_, String>(0)?),
        title: row.get(1)?,
        state,
        candidate_count: row.get::<_, i64>(3)? as u32,
        opens_at: row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
        closes_at: row.get::<_, Option<i64>>(5)?.map(|v| v as u64),
        created_at: row.get::<_, i64>(6)? as u64,
        updated_at: row.get::<_, i64>(7)? as u64,
    })
}

pub(crate) fn load_election(conn: &Connection, id: &ElectionId) -> Result<Option<Election>> {
    let sql = format!("SELECT {} FROM elections WHERE id = ?1", ELECTION_COLUMNS);
    Ok(conn
        .query_row(&sql, [id.as_str()], election_from_row)
        .optional()?)
}

pub(crate) fn require_election(conn: &Connection, id: &ElectionId) -> Result<Election> {
    load_election(conn, id)?.ok_or_else(|| ElectionError::election_not_found(id))
}

fn active_election_id(conn: &Connection) -> Result<Option<ElectionId>> {
    Ok(conn
        .query_row(
            "SELECT id FROM elections WHERE state = 'active' LIMIT 1",
            [],
            |row| row.get::<_, String>(0),
        )
        .optional()?
        .map(ElectionId::from))
}

fn set_state(conn: &Connection, id: &ElectionId, state: ElectionState, now: u64) -> rusqlite::Result<usize> {
    conn.execute(
        "UPDATE elections SET state = ?2, updated_at = ?3 WHERE id = ?1",
        params![id.as_str(), state.as_str(), now as i64],
    )
}

fn validate_title(title: &str) -> Result<&str> {
    let title = title.trim();
    let len = title.chars().count();
    if len < MIN_TITLE_LEN || len > MAX_TITLE_LEN {
        return Err(ElectionError::InvalidInput(format!(
            "title must be between {} and {} characters (got {})",
            MIN_TITLE_LEN, MAX_TITLE_LEN, len
        )));
    }
    Ok(title)
}

/// Owner of election rows.
#[derive(Clone)]
pub struct ElectionRegistry {
    store: MirrorStore,
}

impl ElectionRegistry {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Create a Draft election with a fresh identifier.
    pub fn create(&self, title: &str) -> Result<Election> {
        self.create_with_id(ElectionId::generate(), title)
    }

    /// Create a Draft election under a caller-chosen identifier.
    pub fn create_with_id(&self, id: ElectionId, title: &str) -> Result<Election> {
        let title = validate_title(title)?;
        let now = now_millis();

        self.store.write(|tx| {
            let inserted = tx.execute(
                "INSERT OR IGNORE INTO elections (id, title, state, created_at, updated_at)
                 VALUES (?1, ?2, 'draft', ?3, ?3)",
                params![id.as_str(), title, now as i64],
            )?;
            if inserted == 0 {
                return Err(ElectionError::AlreadyExists(format!("election {}", id)));
            }
            Ok(())
        })?;

        info!(election_id = %id, title = %title, "Election created");

        Ok(Election {
            id,
            title: title.to_string(),
            state: ElectionState::Draft,
            candidate_count: 0,
            opens_at: None,
            closes_at: None,
            created_at: now,
            updated_at: now,
        })
    }

    pub fn get(&self, id: &ElectionId) -> Result<Election> {
        self.store.read(|conn| require_election(conn, id))
    }

    /// All elections, newest first.
    pub fn list(&self) -> Result<Vec<Election>> {
        self.store.read(|conn| {
            let sql = format!(
                "SELECT {} FROM elections ORDER BY created_at DESC, rowid DESC",
                ELECTION_COLUMNS
            );
            let mut stmt = conn.prepare(&sql)?;
            let elections = stmt
                .query_map([], election_from_row)?
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(elections)
        })
    }

    /// The single Active election, if any.
    pub fn get_active(&self) -> Result<Option<Election>> {
        self.store.read(|conn| {
            let sql = format!(
                "SELECT {} FROM elections WHERE state = 'active' LIMIT 1",
                ELECTION_COLUMNS
            );
            Ok(conn.query_row(&sql, [], election_from_row).optional()?)
        })
    }

    /// Open voting. Idempotent for an election that is already Active.
    pub fn activate(&self, id: &ElectionId) -> Result<Election> {
        let (election, changed) = self.store.write(|tx| {
            let mut election = require_election(tx, id)?;
            match election.state {
                ElectionState::Active => return Ok((election, false)),
                ElectionState::Closed => {
                    return Err(ElectionError::InvalidState(format!(
                        "election {} is closed",
                        id
                    )))
                }
                ElectionState::Draft => {}
            }

            if let Some(active) = active_election_id(tx)? {
                return Err(ElectionError::AlreadyActiveElsewhere { active });
            }

            let now = now_millis();
            if let Err(e) = set_state(tx, id, ElectionState::Active, now) {
                if is_constraint_violation(&e) {
                    if let Some(active) = active_election_id(tx)? {
                        return Err(ElectionError::AlreadyActiveElsewhere { active });
                    }
                }
                return Err(e.into());
            }

            election.state = ElectionState::Active;
            election.updated_at = now;
            Ok((election, true))
        })?;

        if changed {
            info!(election_id = %id, "Election activated");
        } else {
            debug!(election_id = %id, "Election already active");
        }
        Ok(election)
    }

    /// Suspend voting, returning the election to Draft. Idempotent for Draft.
    pub fn deactivate(&self, id: &ElectionId) -> Result<Election> {
        let (election, changed) = self.store.write(|tx| {
            let mut election = require_election(tx, id)?;
            match election.state {
                ElectionState::Draft => return Ok((election, false)),
                ElectionState::Closed => {
                    return Err(ElectionError::InvalidState(format!(
                        "election {} is closed",
                        id
                    )))
                }
                ElectionState::Active => {}
            }

            let now = now_millis();
            set_state(tx, id, ElectionState::Draft, now)?;
            election.state = ElectionState::Draft;
            election.updated_at = now;
            Ok((election, true))
        })?;

        if changed {
            info!(election_id = %id, "Election deactivated");
        }
        Ok(election)
    }

    /// Close voting for good. Only an Active election can be closed.
    pub fn close(&self, id: &ElectionId) -> Result<Election> {
        let (election, changed) = self.store.write(|tx| {
            let mut election = require_election(tx, id)?;
            match election.state {
                ElectionState::Closed => return Ok((election, false)),
                ElectionState::Draft => {
                    return Err(ElectionError::InvalidState(format!(
                        "election {} was never opened",
                        id
                    )))
                }
                ElectionState::Active => {}
            }

            let now = now_millis();
            set_state(tx, id, ElectionState::Closed, now)?;
            election.state = ElectionState::Closed;
            election.updated_at = now;
            Ok((election, true))
        })?;

        if changed {
            info!(election_id = %id, "Election closed");
        }
        Ok(election)
    }

    /// Set or clear the voting window of a Draft election.
    pub fn schedule(
        &self,
        id: &ElectionId,
        opens_at: Option<u64>,
        closes_at: Option<u64>,
    ) -> Result<Election> {
        if let (Some(opens), Some(closes)) = (opens_at, closes_at) {
            if opens >= closes {
                return Err(ElectionError::InvalidInput(
                    "voting window must open before it closes".to_string(),
                ));
            }
        }

        let election = self.store.write(|tx| {
            let mut election = require_election(tx, id)?;
            if election.state != ElectionState::Draft {
                return Err(ElectionError::InvalidState(format!(
                    "election {} is {}; the voting window is fixed",
                    id, election.state
                )));
            }

            let now = now_millis();
            tx.execute(
                "UPDATE elections SET opens_at = ?2, closes_at = ?3, updated_at = ?4 WHERE id = ?1",
                params![
                    id.as_str(),
                    opens_at.map(|v| v as i64),
                    closes_at.map(|v| v as i64),
                    now as i64
                ],
            )?;
            election.opens_at = opens_at;
            election.closes_at = closes_at;
            election.updated_at = now;
            Ok(election)
        })?;

        info!(election_id = %id, ?opens_at, ?closes_at, "Voting window scheduled");
        Ok(election)
    }
}
