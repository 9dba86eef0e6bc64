//! Per-election ledger synchronization bookkeeping.

use crate::elections::require_election;
use crate::store::MirrorStore;
use rusqlite::{params, OptionalExtension};
use std::collections::BTreeMap;
use votechain_core::{CandidateId, ElectionId, Result, SyncState};

#[derive(Clone)]
pub struct SyncStateStore {
    store: MirrorStore,
}

impl SyncStateStore {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    /// Stored state, or a fresh one for an election never synced.
    pub fn get(&self, election_id: &ElectionId) -> Result<SyncState> {
        let row = self.store.read(|conn| {
            require_election(conn, election_id)?;
            Ok(conn
                .query_row(
                    "SELECT election_on_chain, candidates_synced_through, synced, on_chain_active,
                            last_reconciled_at, last_reconciled_counts
                     FROM sync_state WHERE election_id = ?1",
                    [election_id.as_str()],
                    |row| {
                        Ok((
                            row.get::<_, bool>(0)?,
                            row.get::<_, i64>(1)? as CandidateId,
                            row.get::<_, bool>(2)?,
                            row.get::<_, Option<bool>>(3)?,
                            row.get::<_, Option<i64>>(4)?.map(|v| v as u64),
                            row.get::<_, String>(5)?,
                        ))
                    },
                )
                .optional()?)
        })?;

        let Some((on_chain, through, synced, active, reconciled_at, counts)) = row else {
            return Ok(SyncState::new(election_id.clone()));
        };

        let last_reconciled_counts: BTreeMap<CandidateId, u64> = serde_json::from_str(&counts)?;
        Ok(SyncState {
            election_id: election_id.clone(),
            election_on_chain: on_chain,
            candidates_synced_through: through,
            synced,
            on_chain_active: active,
            last_reconciled_at: reconciled_at,
            last_reconciled_counts,
        })
    }

    pub fn save(&self, state: &SyncState) -> Result<()> {
        let counts = serde_json::to_string(&state.last_reconciled_counts)?;
        self.store.write(|tx| {
            tx.execute(
                "INSERT INTO sync_state (
                     election_id, election_on_chain, candidates_synced_through, synced,
                     on_chain_active, last_reconciled_at, last_reconciled_counts
                 ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
                 ON CONFLICT(election_id) DO UPDATE SET
                     election_on_chain = excluded.election_on_chain,
                     candidates_synced_through = excluded.candidates_synced_through,
                     synced = excluded.synced,
                     on_chain_active = excluded.on_chain_active,
                     last_reconciled_at = excluded.last_reconciled_at,
                     last_reconciled_counts = excluded.last_reconciled_counts",
                params![
                    state.election_id.as_str(),
                    state.election_on_chain,
                    state.candidates_synced_through as i64,
                    state.synced,
                    state.on_chain_active,
                    state.last_reconciled_at.map(|v| v as i64),
                    counts,
                ],
            )?;
            Ok(())
        })
    }

    /// Elections whose last sync completed.
    pub fn synced_elections(&self) -> Result<Vec<ElectionId>> {
        self.store.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT election_id FROM sync_state WHERE synced = 1 ORDER BY election_id")?;
            let ids = stmt
                .query_map([], |row| row.get::<_, String>(0))?
                .map(|r| r.map(ElectionId::from))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            Ok(ids)
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use votechain_core::ErrorKind;

    #[test]
    fn test_defaults_then_round_trip() {
        let store = MirrorStore::open_in_memory().unwrap();
        let id = store.elections().create("Board Election").unwrap().id;
        let states = store.sync_states();

        let fresh = states.get(&id).unwrap();
        assert_eq!(fresh, SyncState::new(id.clone()));
        assert!(states.synced_elections().unwrap().is_empty());

        let mut state = fresh;
        state.election_on_chain = true;
        state.candidates_synced_through = 2;
        state.synced = true;
        state.on_chain_active = Some(true);
        state.last_reconciled_at = Some(1_700_000_000_000);
        state.last_reconciled_counts.insert(1, 4);
        states.save(&state).unwrap();

        assert_eq!(states.get(&id).unwrap(), state);
        assert_eq!(states.synced_elections().unwrap(), vec![id.clone()]);

        state.synced = false;
        states.save(&state).unwrap();
        assert!(states.synced_elections().unwrap().is_empty());
    }

    #[test]
    fn test_unknown_election() {
        let store = MirrorStore::open_in_memory().unwrap();
        let err = store.sync_states().get(&ElectionId::from("nope")).unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }
}
