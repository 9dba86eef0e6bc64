//! Admin authorization for contract calls.
//!
//! Every admin call asks an [`AdminPolicy`] before it touches state. The
//! contract owner is always an admin; richer policies add more identities.

use crate::error::ContractError;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;

/// Contract calls gated by the admin policy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum AdminAction {
    CreateElection,
    AddCandidate,
    SetElectionStatus,
}

impl fmt::Display for AdminAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            AdminAction::CreateElection => "create elections",
            AdminAction::AddCandidate => "add candidates",
            AdminAction::SetElectionStatus => "change election status",
        })
    }
}

pub trait AdminPolicy: Send + Sync {
    /// Identity the contract was deployed by.
    fn owner(&self) -> &str;

    /// Whether `sender` may perform `action`.
    fn permits(&self, sender: &str, action: AdminAction) -> bool;

    fn authorize(&self, sender: &str, action: AdminAction) -> Result<(), ContractError> {
        if self.permits(sender, action) {
            Ok(())
        } else {
            Err(ContractError::Unauthorized {
                sender: sender.to_string(),
                action,
            })
        }
    }
}

/// Only the owner may administer.
#[derive(Debug, Clone)]
pub struct SingleOwner {
    owner: String,
}

impl SingleOwner {
    pub fn new(owner: impl Into<String>) -> Self {
        Self {
            owner: owner.into(),
        }
    }
}

impl AdminPolicy for SingleOwner {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn permits(&self, sender: &str, _action: AdminAction) -> bool {
        sender == self.owner
    }
}

/// The owner plus a fixed set of delegated admins.
#[derive(Debug, Clone)]
pub struct AdminSet {
    owner: String,
    admins: BTreeSet<String>,
}

impl AdminSet {
    pub fn new(owner: impl Into<String>, admins: impl IntoIterator<Item = String>) -> Self {
        Self {
            owner: owner.into(),
            admins: admins.into_iter().collect(),
        }
    }
}

impl AdminPolicy for AdminSet {
    fn owner(&self) -> &str {
        &self.owner
    }

    fn permits(&self, sender: &str, _action: AdminAction) -> bool {
        sender == self.owner || self.admins.contains(sender)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_owner() {
        let policy = SingleOwner::new("0xowner");
        assert!(policy.authorize("0xowner", AdminAction::CreateElection).is_ok());
        let err = policy
            .authorize("0xvoter", AdminAction::AddCandidate)
            .unwrap_err();
        assert_eq!(err.to_string(), "0xvoter is not allowed to add candidates");
    }

    #[test]
    fn test_admin_set() {
        let policy = AdminSet::new("0xowner", vec!["0xdeputy".to_string()]);
        assert_eq!(policy.owner(), "0xowner");
        assert!(policy.permits("0xowner", AdminAction::SetElectionStatus));
        assert!(policy.permits("0xdeputy", AdminAction::SetElectionStatus));
        assert!(!policy.permits("0xvoter", AdminAction::SetElectionStatus));
    }
}
