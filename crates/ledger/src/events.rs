//! Append-only, hash-chained contract event log
//!
//! Every state change the contract makes is recorded as one event row in the
//! same transaction as the change itself. Each row carries:
//! - seq_no: block height, increasing by exactly 1 from 1
//! - timestamp: block time (Unix milliseconds)
//! - event_type / payload: the event, JSON encoded
//! - prev_event_hash: `event_hash` of the previous row (zeroes for the first)
//! - event_hash: BLAKE3 over the previous hash, seq_no, timestamp and payload
//!
//! The continuity check walks the whole log, so an edited, deleted or
//! reordered row is detected the next time the contract host starts.

use crate::error::{LedgerError, Result};
use blake3::Hasher;
use rusqlite::{params, Connection, OptionalExtension};
use serde::{Deserialize, Serialize};
use tracing::{error, info};
use votechain_core::{CandidateId, ReceiptHash};

/// `prev_event_hash` of the first event.
pub const GENESIS_HASH: [u8; 32] = [0u8; 32];

const EVENT_DOMAIN: &[u8] = b"votechain.event.v1";

/// Events emitted by the election contract.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ContractEvent {
    ElectionCreated {
        election_id: String,
        title: String,
    },
    CandidateAdded {
        election_id: String,
        candidate_id: CandidateId,
        name: String,
        party: String,
    },
    VoteCast {
        election_id: String,
        voter: String,
        candidate_id: CandidateId,
        hash: ReceiptHash,
    },
    ElectionStatusChanged {
        election_id: String,
        is_active: bool,
    },
}

impl ContractEvent {
    pub fn name(&self) -> &'static str {
        match self {
            ContractEvent::ElectionCreated { .. } => "ElectionCreated",
            ContractEvent::CandidateAdded { .. } => "CandidateAdded",
            ContractEvent::VoteCast { .. } => "VoteCast",
            ContractEvent::ElectionStatusChanged { .. } => "ElectionStatusChanged",
        }
    }

    pub fn election_id(&self) -> &str {
        match self {
            ContractEvent::ElectionCreated { election_id, .. }
            | ContractEvent::CandidateAdded { election_id, .. }
            | ContractEvent::VoteCast { election_id, .. }
            | ContractEvent::ElectionStatusChanged { election_id, .. } => election_id,
        }
    }
}

/// An event as stored in the log.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LoggedEvent {
    pub seq_no: u64,
    pub timestamp: u64,
    pub event: ContractEvent,
    #[serde(with = "hex_bytes")]
    pub event_hash: [u8; 32],
    #[serde(with = "hex_bytes")]
    pub prev_event_hash: [u8; 32],
}

/// Log health status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum LedgerHealth {
    /// Log is intact
    Ok,
    /// Log is corrupted; writes are refused
    Corrupted {
        /// Last good sequence number
        last_good_seq_no: Option<u64>,
        /// First failing sequence number
        first_bad_seq_no: u64,
        /// Error type description
        error_type: String,
    },
}

impl LedgerHealth {
    pub fn is_ok(&self) -> bool {
        matches!(self, LedgerHealth::Ok)
    }
}

pub(crate) fn init_schema(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        r#"
        CREATE TABLE IF NOT EXISTS contract_events (
            seq_no INTEGER PRIMARY KEY,
            timestamp INTEGER NOT NULL,
            event_type TEXT NOT NULL,
            election_id TEXT NOT NULL,
            payload TEXT NOT NULL,
            event_hash BLOB NOT NULL,
            prev_event_hash BLOB NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_events_election ON contract_events(election_id);
        "#,
    )?;
    Ok(())
}

fn compute_event_hash(prev: &[u8; 32], seq_no: u64, timestamp: u64, payload: &str) -> [u8; 32] {
    let mut hasher = Hasher::new();
    hasher.update(EVENT_DOMAIN);
    hasher.update(prev);
    hasher.update(&seq_no.to_be_bytes());
    hasher.update(&timestamp.to_be_bytes());
    hasher.update(payload.as_bytes());
    *hasher.finalize().as_bytes()
}

fn to_hash(bytes: Vec<u8>, seq_no: u64) -> Result<[u8; 32]> {
    bytes.try_into().map_err(|b: Vec<u8>| {
        LedgerError::CorruptionDetected(format!(
            "hash at seq_no {} is {} bytes",
            seq_no,
            b.len()
        ))
    })
}

/// Latest `(seq_no, event_hash)`, if the log is not empty.
pub(crate) fn latest(conn: &Connection) -> Result<Option<(u64, [u8; 32])>> {
    let row = conn
        .query_row(
            "SELECT seq_no, event_hash FROM contract_events ORDER BY seq_no DESC LIMIT 1",
            [],
            |row| Ok((row.get::<_, i64>(0)? as u64, row.get::<_, Vec<u8>>(1)?)),
        )
        .optional()?;

    match row {
        Some((seq_no, hash)) => Ok(Some((seq_no, to_hash(hash, seq_no)?))),
        None => Ok(None),
    }
}

/// Height the next appended event will get.
pub(crate) fn next_seq_no(conn: &Connection) -> Result<u64> {
    Ok(latest(conn)?.map(|(seq_no, _)| seq_no + 1).unwrap_or(1))
}

/// Append an event. Must run inside the transaction that applies the change.
pub(crate) fn append(conn: &Connection, timestamp: u64, event: &ContractEvent) -> Result<u64> {
    let (seq_no, prev) = match latest(conn)? {
        Some((last, hash)) => (last + 1, hash),
        None => (1, GENESIS_HASH),
    };

    let payload = serde_json::to_string(event)?;
    let hash = compute_event_hash(&prev, seq_no, timestamp, &payload);

    conn.execute(
        "INSERT INTO contract_events (
             seq_no, timestamp, event_type, election_id, payload, event_hash, prev_event_hash
         ) VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)",
        params![
            seq_no as i64,
            timestamp as i64,
            event.name(),
            event.election_id(),
            payload,
            &hash[..],
            &prev[..],
        ],
    )?;

    Ok(seq_no)
}

type RawRow = (u64, u64, String, Vec<u8>, Vec<u8>);

fn raw_rows(conn: &Connection, from_seq_no: u64, limit: Option<usize>) -> Result<Vec<RawRow>> {
    let limit = limit.map(|l| l as i64).unwrap_or(-1);
    let mut stmt = conn.prepare(
        "SELECT seq_no, timestamp, payload, event_hash, prev_event_hash
         FROM contract_events
         WHERE seq_no >= ?1
         ORDER BY seq_no ASC
         LIMIT ?2",
    )?;
    let rows = stmt
        .query_map(params![from_seq_no as i64, limit], |row| {
            Ok((
                row.get::<_, i64>(0)? as u64,
                row.get::<_, i64>(1)? as u64,
                row.get::<_, String>(2)?,
                row.get::<_, Vec<u8>>(3)?,
                row.get::<_, Vec<u8>>(4)?,
            ))
        })?
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(rows)
}

fn decode(row: RawRow) -> Result<LoggedEvent> {
    let (seq_no, timestamp, payload, hash, prev) = row;
    Ok(LoggedEvent {
        seq_no,
        timestamp,
        event: serde_json::from_str(&payload)?,
        event_hash: to_hash(hash, seq_no)?,
        prev_event_hash: to_hash(prev, seq_no)?,
    })
}

/// Events from `from_seq_no` (inclusive), at most `limit` of them.
pub(crate) fn read_since(conn: &Connection, from_seq_no: u64, limit: usize) -> Result<Vec<LoggedEvent>> {
    raw_rows(conn, from_seq_no, Some(limit))?
        .into_iter()
        .map(decode)
        .collect()
}

/// Walk the whole log, verifying numbering, chaining and content hashes.
pub(crate) fn continuity_check(conn: &Connection) -> Result<LedgerHealth> {
    let rows = raw_rows(conn, 0, None)?;
    let count = rows.len();

    let mut expected_seq_no = 1u64;
    let mut prev_hash = GENESIS_HASH;
    let mut last_good: Option<u64> = None;

    for (seq_no, timestamp, payload, hash, prev) in rows {
        let problem = if seq_no != expected_seq_no {
            Some(if seq_no < expected_seq_no {
                format!("Duplicated sequence number: {}", seq_no)
            } else {
                format!(
                    "Missing events: gap between {} and {}",
                    expected_seq_no.saturating_sub(1),
                    seq_no
                )
            })
        } else if prev.as_slice() != prev_hash.as_slice() {
            Some(format!(
                "Hash mismatch at seq_no {}: expected prev_hash {}, got {}",
                seq_no,
                hex::encode(prev_hash),
                hex::encode(&prev)
            ))
        } else if hash.as_slice() != compute_event_hash(&prev_hash, seq_no, timestamp, &payload).as_slice() {
            Some(format!("Content hash mismatch at seq_no {}", seq_no))
        } else if serde_json::from_str::<ContractEvent>(&payload).is_err() {
            Some(format!("Undecodable payload at seq_no {}", seq_no))
        } else {
            None
        };

        if let Some(error_type) = problem {
            error!(
                seq_no,
                error_type = %error_type,
                "Contract event log corruption detected"
            );
            return Ok(LedgerHealth::Corrupted {
                last_good_seq_no: last_good,
                first_bad_seq_no: seq_no,
                error_type,
            });
        }

        prev_hash = to_hash(hash, seq_no)?;
        last_good = Some(seq_no);
        expected_seq_no += 1;
    }

    info!(event_count = count, "Contract event log continuity check passed");
    Ok(LedgerHealth::Ok)
}

mod hex_bytes {
    use serde::{Deserialize, Deserializer, Serializer};

    pub fn serialize<S: Serializer>(bytes: &[u8; 32], serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(bytes))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<[u8; 32], D::Error> {
        let s = String::deserialize(deserializer)?;
        let mut out = [0u8; 32];
        hex::decode_to_slice(&s, &mut out).map_err(serde::de::Error::custom)?;
        Ok(out)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn log() -> Connection {
        let conn = Connection::open_in_memory().unwrap();
        init_schema(&conn).unwrap();
        conn
    }

    fn created(id: &str) -> ContractEvent {
        ContractEvent::ElectionCreated {
            election_id: id.to_string(),
            title: "Board Election".to_string(),
        }
    }

    #[test]
    fn test_append_chains_hashes() {
        let conn = log();
        assert_eq!(next_seq_no(&conn).unwrap(), 1);

        assert_eq!(append(&conn, 1_000, &created("e1")).unwrap(), 1);
        assert_eq!(append(&conn, 2_000, &created("e2")).unwrap(), 2);

        let events = read_since(&conn, 1, 10).unwrap();
        assert_eq!(events.len(), 2);
        assert_eq!(events[0].prev_event_hash, GENESIS_HASH);
        assert_eq!(events[1].prev_event_hash, events[0].event_hash);
        assert_eq!(events[1].event.election_id(), "e2");

        assert_eq!(read_since(&conn, 2, 10).unwrap().len(), 1);
        assert_eq!(read_since(&conn, 1, 1).unwrap().len(), 1);
        assert!(continuity_check(&conn).unwrap().is_ok());
    }

    #[test]
    fn test_payload_tampering_detected() {
        let conn = log();
        append(&conn, 1_000, &created("e1")).unwrap();
        append(&conn, 2_000, &created("e2")).unwrap();

        conn.execute(
            "UPDATE contract_events SET payload = replace(payload, 'Board', 'Bored') WHERE seq_no = 1",
            [],
        )
        .unwrap();

        match continuity_check(&conn).unwrap() {
            LedgerHealth::Corrupted {
                last_good_seq_no,
                first_bad_seq_no,
                ..
            } => {
                assert_eq!(last_good_seq_no, None);
                assert_eq!(first_bad_seq_no, 1);
            }
            LedgerHealth::Ok => panic!("tampering went unnoticed"),
        }
    }

    #[test]
    fn test_gap_detected() {
        let conn = log();
        for i in 0..3 {
            append(&conn, 1_000 + i, &created(&format!("e{}", i))).unwrap();
        }
        conn.execute("DELETE FROM contract_events WHERE seq_no = 2", [])
            .unwrap();

        match continuity_check(&conn).unwrap() {
            LedgerHealth::Corrupted {
                last_good_seq_no,
                first_bad_seq_no,
                error_type,
            } => {
                assert_eq!(last_good_seq_no, Some(1));
                assert_eq!(first_bad_seq_no, 3);
                assert!(error_type.contains("Missing events"));
            }
            LedgerHealth::Ok => panic!("gap went unnoticed"),
        }
    }

    #[test]
    fn test_event_serialization_is_tagged() {
        let json = serde_json::to_value(ContractEvent::ElectionStatusChanged {
            election_id: "e1".to_string(),
            is_active: true,
        })
        .unwrap();
        assert_eq!(json["type"], "ElectionStatusChanged");
        assert_eq!(json["is_active"], true);
    }
}
