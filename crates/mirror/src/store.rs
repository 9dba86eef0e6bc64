//! Mirror database handle
//!
//! One SQLite connection per process, shared behind `Arc<Mutex<_>>`. Every
//! mutation runs in a `BEGIN IMMEDIATE` transaction so that writers in other
//! processes sharing the same file are serialized by SQLite's write lock.

use crate::candidates::CandidateRegistry;
use crate::elections::ElectionRegistry;
use crate::sync_state::SyncStateStore;
use crate::votes::VoteLedger;
use rusqlite::{Connection, ErrorCode, OpenFlags, Transaction, TransactionBehavior};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tracing::info;
use votechain_core::{ElectionError, Result};

/// Default wait on a locked database before giving up.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_secs(5);

const SCHEMA: &str = r#"
    CREATE TABLE IF NOT EXISTS elections (
        id TEXT PRIMARY KEY,
        title TEXT NOT NULL,
        state TEXT NOT NULL CHECK (state IN ('draft', 'active', 'closed')),
        candidate_count INTEGER NOT NULL DEFAULT 0,
        next_candidate_id INTEGER NOT NULL DEFAULT 1,
        opens_at INTEGER,
        closes_at INTEGER,
        created_at INTEGER NOT NULL,
        updated_at INTEGER NOT NULL
    );

    CREATE UNIQUE INDEX IF NOT EXISTS idx_single_active_election
        ON elections(state) WHERE state = 'active';

    CREATE TABLE IF NOT EXISTS candidates (
        election_id TEXT NOT NULL REFERENCES elections(id),
        candidate_id INTEGER NOT NULL CHECK (candidate_id > 0),
        name TEXT NOT NULL,
        party TEXT NOT NULL DEFAULT '',
        bio TEXT,
        vote_count INTEGER NOT NULL DEFAULT 0,
        created_at INTEGER NOT NULL,
        PRIMARY KEY (election_id, candidate_id)
    );

    CREATE TABLE IF NOT EXISTS votes (
        election_id TEXT NOT NULL,
        voter TEXT NOT NULL,
        candidate_id INTEGER NOT NULL,
        receipt BLOB NOT NULL,
        sequence INTEGER NOT NULL,
        cast_at INTEGER NOT NULL,
        ledger_tx INTEGER,
        UNIQUE (election_id, voter),
        FOREIGN KEY (election_id, candidate_id)
            REFERENCES candidates(election_id, candidate_id)
    );

    CREATE INDEX IF NOT EXISTS idx_votes_candidate ON votes(election_id, candidate_id);

    CREATE TABLE IF NOT EXISTS counters (
        name TEXT PRIMARY KEY,
        value INTEGER NOT NULL
    );

    INSERT OR IGNORE INTO counters (name, value) VALUES ('vote_sequence', 0);

    CREATE TABLE IF NOT EXISTS sync_state (
        election_id TEXT PRIMARY KEY REFERENCES elections(id),
        election_on_chain INTEGER NOT NULL DEFAULT 0,
        candidates_synced_through INTEGER NOT NULL DEFAULT 0,
        synced INTEGER NOT NULL DEFAULT 0,
        on_chain_active INTEGER,
        last_reconciled_at INTEGER,
        last_reconciled_counts TEXT NOT NULL DEFAULT '{}'
    );
"#;

/// Shared handle to the mirror database.
#[derive(Clone)]
pub struct MirrorStore {
    conn: Arc<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl MirrorStore {
    /// Open (or create) the mirror at `path`.
    pub fn open(path: impl AsRef<Path>, busy_timeout: Duration) -> Result<Self> {
        let path = path.as_ref();

        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    ElectionError::Storage(format!("creating {}: {}", parent.display(), e))
                })?;
            }
        }

        let conn = Connection::open_with_flags(
            path,
            OpenFlags::SQLITE_OPEN_READ_WRITE
                | OpenFlags::SQLITE_OPEN_CREATE
                | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        conn.busy_timeout(busy_timeout)?;
        conn.pragma_update(None, "journal_mode", "WAL")?;
        conn.pragma_update(None, "synchronous", "NORMAL")?;

        let store = Self::from_connection(conn, Some(path.to_path_buf()))?;
        info!(path = %path.display(), "Mirror store opened");
        Ok(store)
    }

    /// Open a private in-memory mirror.
    pub fn open_in_memory() -> Result<Self> {
        Self::from_connection(Connection::open_in_memory()?, None)
    }

    fn from_connection(conn: Connection, path: Option<PathBuf>) -> Result<Self> {
        conn.pragma_update(None, "foreign_keys", "ON")?;
        conn.execute_batch(SCHEMA)?;
        Ok(Self {
            conn: Arc::new(Mutex::new(conn)),
            path,
        })
    }

    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    pub fn elections(&self) -> ElectionRegistry {
        ElectionRegistry::new(self.clone())
    }

    pub fn candidates(&self) -> CandidateRegistry {
        CandidateRegistry::new(self.clone())
    }

    pub fn votes(&self) -> VoteLedger {
        VoteLedger::new(self.clone())
    }

    /// Sync bookkeeping. Only the sync engine writes through this handle.
    pub fn sync_states(&self) -> SyncStateStore {
        SyncStateStore::new(self.clone())
    }

    /// Run a read against the connection.
    pub(crate) fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        let guard = self
            .conn
            .lock()
            .map_err(|_| ElectionError::Storage("mirror connection lock poisoned".to_string()))?;
        f(&guard)
    }

    /// Run `f` inside an immediate transaction, committing on success.
    pub(crate) fn write<T>(&self, f: impl FnOnce(&Transaction<'_>) -> Result<T>) -> Result<T> {
        let mut guard = self
            .conn
            .lock()
            .map_err(|_| ElectionError::Storage("mirror connection lock poisoned".to_string()))?;
        let tx = guard.transaction_with_behavior(TransactionBehavior::Immediate)?;
        let out = f(&tx)?;
        tx.commit()?;
        Ok(out)
    }

    /// Execute raw SQL for testing purposes only
    ///
    /// Bypasses every registry invariant. Tests use it to simulate a mirror
    /// that drifted from the ledger.
    #[doc(hidden)]
    pub fn __test_execute_raw_sql(
        &self,
        sql: &str,
        params: &[&dyn rusqlite::ToSql],
    ) -> Result<usize> {
        self.read(|conn| Ok(conn.execute(sql, params)?))
    }
}

pub(crate) fn is_constraint_violation(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(e, _) if e.code == ErrorCode::ConstraintViolation
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_open_creates_schema() {
        let db_path = std::env::temp_dir().join(format!("test_mirror_{}.db", uuid::Uuid::new_v4()));

        let store = MirrorStore::open(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert_eq!(store.path(), Some(db_path.as_path()));
        assert!(store.elections().list().unwrap().is_empty());
        drop(store);

        // Reopening an existing file keeps the schema idempotent
        let store = MirrorStore::open(&db_path, DEFAULT_BUSY_TIMEOUT).unwrap();
        assert!(store.elections().get_active().unwrap().is_none());

        std::fs::remove_file(&db_path).ok();
    }

    #[test]
    fn test_in_memory_has_no_path() {
        let store = MirrorStore::open_in_memory().unwrap();
        assert!(store.path().is_none());
    }
}
