//! Relational mirror of elections, candidates and votes.
//!
//! The mirror is the fast, transactional store the calling layer reads and
//! writes. It enforces the local safety invariants (single active election,
//! frozen rosters once voting opens, one vote per voter) and never talks to
//! the ledger; that is the sync engine's job.

pub mod candidates;
pub mod elections;
pub mod store;
pub mod sync_state;
pub mod votes;

pub use candidates::CandidateRegistry;
pub use elections::ElectionRegistry;
pub use store::{MirrorStore, DEFAULT_BUSY_TIMEOUT};
pub use sync_state::SyncStateStore;
pub use votes::VoteLedger;
