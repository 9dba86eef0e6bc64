//! Candidate rosters.
//!
//! Candidates may only be added or removed while their election is Draft.
//! Ids come from the election's `next_candidate_id` counter, so they start
//! at 1 and are never reused, even after a removal.

use crate::elections::require_election;
use crate::store::MirrorStore;
use rusqlite::{params, Connection, OptionalExtension, Row};
use tracing::info;
use votechain_core::clock::now_millis;
use votechain_core::{Candidate, CandidateId, ElectionError, ElectionId, ElectionState, Result};

pub(crate) const CANDIDATE_COLUMNS: &str =
    "election_id, candidate_id, name, party, bio, vote_count, created_at";

pub(crate) fn candidate_from_row(row: &Row<'_>) -> rusqlite::Result<Candidate> {
    Ok(Candidate {
        election_id: ElectionId::from(row.get::<_, String>(0)?),
        id: row.get::<_, i64>(1)? as CandidateId,
        name: row.get(2)?,
        party: row.get(3)?,
        bio: row.get(4)?,
        vote_count: row.get::<_, i64>(5)? as u64,
        created_at: row.get::<_, i64>(6)? as u64,
    })
}

pub(crate) fn load_candidate(
    conn: &Connection,
    election_id: &ElectionId,
    candidate_id: CandidateId,
) -> Result<Option<Candidate>> {
    let sql = format!(
        "SELECT {} FROM candidates WHERE election_id = ?1 AND candidate_id = ?2",
        CANDIDATE_COLUMNS
    );
    Ok(conn
        .query_row(
            &sql,
            params![election_id.as_str(), candidate_id as i64],
            candidate_from_row,
        )
        .optional()?)
}

pub(crate) fn load_candidates(conn: &Connection, election_id: &ElectionId) -> Result<Vec<Candidate>> {
    let sql = format!(
        "SELECT {} FROM candidates WHERE election_id = ?1 ORDER BY candidate_id ASC",
        CANDIDATE_COLUMNS
    );
    let mut stmt = conn.prepare(&sql)?;
    let candidates = stmt
        .query_map([election_id.as_str()], candidate_from_row)?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(candidates)
}

fn require_roster_editable(election_id: &ElectionId, state: ElectionState) -> Result<()> {
    if state != ElectionState::Draft {
        return Err(ElectionError::InvalidState(format!(
            "election {} is {}; its candidate roster is frozen",
            election_id, state
        )));
    }
    Ok(())
}

/// Owner of candidate rows.
#[derive(Clone)]
pub struct CandidateRegistry {
    store: MirrorStore,
}

impl CandidateRegistry {
    pub fn new(store: MirrorStore) -> Self {
        Self { store }
    }

    pub fn add_candidate(&self, election_id: &ElectionId, name: &str, party: &str) -> Result<Candidate> {
        self.add_candidate_with_bio(election_id, name, party, None)
    }

    /// Register a candidate in a Draft election.
    pub fn add_candidate_with_bio(
        &self,
        election_id: &ElectionId,
        name: &str,
        party: &str,
        bio: Option<&str>,
    ) -> Result<Candidate> {
        let name = name.trim();
        if name.is_empty() {
            return Err(ElectionError::InvalidInput(
                "candidate name must not be empty".to_string(),
            ));
        }
        let party = party.trim();
        let now = now_millis();

        let candidate = self.store.write(|tx| {
            let election = require_election(tx, election_id)?;
            require_roster_editable(election_id, election.state)?;

            let id: i64 = tx.query_row(
                "SELECT next_candidate_id FROM elections WHERE id = ?1",
                [election_id.as_str()],
                |row| row.get(0),
            )?;

            tx.execute(
                "INSERT INTO candidates (election_id, candidate_id, name, party, bio, created_at)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6)",
                params![election_id.as_str(), id, name, party, bio, now as i64],
            )?;
            tx.execute(
                "UPDATE elections
                 SET candidate_count = candidate_count + 1,
                     next_candidate_id = next_candidate_id + 1,
                     updated_at = ?2
                 WHERE id = ?1",
                params![election_id.as_str(), now as i64],
            )?;

            Ok(Candidate {
                election_id: election_id.clone(),
                id: id as CandidateId,
                name: name.to_string(),
                party: party.to_string(),
                bio: bio.map(str::to_string),
                vote_count: 0,
                created_at: now,
            })
        })?;

        info!(
            election_id = %election_id,
            candidate_id = candidate.id,
            name = %candidate.name,
            "Candidate added"
        );
        Ok(candidate)
    }

    /// Candidates of an election in id order.
    pub fn list(&self, election_id: &ElectionId) -> Result<Vec<Candidate>> {
        self.store.read(|conn| {
            require_election(conn, election_id)?;
            load_candidates(conn, election_id)
        })
    }

    pub fn get(&self, election_id: &ElectionId, candidate_id: CandidateId) -> Result<Candidate> {
        self.store.read(|conn| {
            load_candidate(conn, election_id, candidate_id)?.ok_or_else(|| {
                ElectionError::NotFound(format!(
                    "candidate {} in election {}",
                    candidate_id, election_id
                ))
            })
        })
    }

    /// Withdraw a candidate from a Draft election.
    ///
    /// Refused once the candidate holds votes or has been pushed to the
    /// ledger, where it cannot be withdrawn.
    pub fn remove_candidate(&self, election_id: &ElectionId, candidate_id: CandidateId) -> Result<()> {
        let now = now_millis();

        self.store.write(|tx| {
            let election = require_election(tx, election_id)?;
            require_roster_editable(election_id, election.state)?;

            if load_candidate(tx, election_id, candidate_id)?.is_none() {
                return Err(ElectionError::NotFound(format!(
                    "candidate {} in election {}",
                    candidate_id, election_id
                )));
            }

            let published: Option<i64> = tx
                .query_row(
                    "SELECT candidates_synced_through FROM sync_state WHERE election_id = ?1",
                    [election_id.as_str()],
                    |row| row.get(0),
                )
                .optional()?;
            if published.is_some_and(|through| candidate_id as i64 <= through) {
                return Err(ElectionError::InvalidState(format!(
                    "candidate {} is already on the ledger",
                    candidate_id
                )));
            }

            let votes: i64 = tx.query_row(
                "SELECT COUNT(*) FROM votes WHERE election_id = ?1 AND candidate_id = ?2",
                params![election_id.as_str(), candidate_id as i64],
                |row| row.get(0),
            )?;
            if votes > 0 {
                return Err(ElectionError::InvalidState(format!(
                    "candidate {} already holds {} vote(s)",
                    candidate_id, votes
                )));
            }

            tx.execute(
                "DELETE FROM candidates WHERE election_id = ?1 AND candidate_id = ?2",
                params![election_id.as_str(), candidate_id as i64],
            )?;
            tx.execute(
                "UPDATE elections SET candidate_count = candidate_count - 1, updated_at = ?2 WHERE id = ?1",
                params![election_id.as_str(), now as i64],
            )?;
            Ok(())
        })?;

        info!(election_id = %election_id, candidate_id, "Candidate removed");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use votechain_core::ErrorKind;

    fn setup() -> (MirrorStore, ElectionId) {
        let store = MirrorStore::open_in_memory().unwrap();
        let election = store.elections().create("Board Election").unwrap();
        (store, election.id)
    }

    #[test]
    fn test_ids_are_sequential_from_one() {
        let (store, id) = setup();
        let reg = store.candidates();
        let alice = reg.add_candidate(&id, "Alice", "Green").unwrap();
        let bob = reg.add_candidate(&id, "Bob", "Blue").unwrap();
        assert_eq!((alice.id, bob.id), (1, 2));
        assert_eq!(store.elections().get(&id).unwrap().candidate_count, 2);

        let names: Vec<_> = reg.list(&id).unwrap().into_iter().map(|c| c.name).collect();
        assert_eq!(names, vec!["Alice", "Bob"]);
    }

    #[test]
    fn test_party_and_bio_optional() {
        let (store, id) = setup();
        let reg = store.candidates();
        let indie = reg
            .add_candidate_with_bio(&id, "Dana", "", Some("Long-time treasurer"))
            .unwrap();
        let fetched = reg.get(&id, indie.id).unwrap();
        assert_eq!(fetched.party, "");
        assert_eq!(fetched.bio.as_deref(), Some("Long-time treasurer"));
    }

    #[test]
    fn test_empty_name_rejected() {
        let (store, id) = setup();
        let err = store.candidates().add_candidate(&id, "   ", "Green").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidInput);
    }

    #[test]
    fn test_add_after_activate_rejected() {
        let (store, id) = setup();
        let reg = store.candidates();
        reg.add_candidate(&id, "Alice", "Green").unwrap();
        store.elections().activate(&id).unwrap();

        let err = reg.add_candidate(&id, "Mallory", "Red").unwrap_err();
        assert_eq!(err.kind(), ErrorKind::InvalidState);
        assert_eq!(store.elections().get(&id).unwrap().candidate_count, 1);
        assert_eq!(reg.list(&id).unwrap().len(), 1);
    }

    #[test]
    fn test_add_to_missing_election() {
        let store = MirrorStore::open_in_memory().unwrap();
        let err = store
            .candidates()
            .add_candidate(&ElectionId::from("nope"), "Alice", "Green")
            .unwrap_err();
        assert_eq!(err.kind(), ErrorKind::NotFound);
    }

    #[test]
    fn test_removed_ids_are_not_reused() {
        let (store, id) = setup();
        let reg = store.candidates();
        reg.add_candidate(&id, "Alice", "Green").unwrap();
        let bob = reg.add_candidate(&id, "Bob", "Blue").unwrap();

        reg.remove_candidate(&id, bob.id).unwrap();
        assert_eq!(store.elections().get(&id).unwrap().candidate_count, 1);
        assert_eq!(reg.get(&id, bob.id).unwrap_err().kind(), ErrorKind::NotFound);

        let carol = reg.add_candidate(&id, "Carol", "Gold").unwrap();
        assert_eq!(carol.id, 3);
    }

    #[test]
    fn test_remove_rules() {
        let (store, id) = setup();
        let reg = store.candidates();
        let alice = reg.add_candidate(&id, "Alice", "Green").unwrap();

        assert_eq!(
            reg.remove_candidate(&id, 99).unwrap_err().kind(),
            ErrorKind::NotFound
        );

        store.elections().activate(&id).unwrap();
        assert_eq!(
            reg.remove_candidate(&id, alice.id).unwrap_err().kind(),
            ErrorKind::InvalidState
        );

        store.elections().deactivate(&id).unwrap();
        let mut state = store.sync_states().get(&id).unwrap();
        state.candidates_synced_through = alice.id;
        store.sync_states().save(&state).unwrap();
        assert_eq!(
            reg.remove_candidate(&id, alice.id).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
        state.candidates_synced_through = 0;
        store.sync_states().save(&state).unwrap();
        store.elections().activate(&id).unwrap();

        // A vote pins the candidate even once the election is back in Draft
        store
            .votes()
            .cast_vote(&id, &"V1".into(), alice.id)
            .unwrap();
        store.elections().deactivate(&id).unwrap();
        assert_eq!(
            reg.remove_candidate(&id, alice.id).unwrap_err().kind(),
            ErrorKind::InvalidState
        );
    }
}
