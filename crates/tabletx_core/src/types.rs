//! Core type definitions for tabletx.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Unique identifier for a physical transaction.
///
/// Transaction IDs are monotonically increasing within one repository.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct TransactionId(pub u64);

impl TransactionId {
    /// Creates a new transaction ID.
    #[must_use]
    pub const fn new(id: u64) -> Self {
        Self(id)
    }

    /// Returns the raw ID value.
    #[must_use]
    pub const fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for TransactionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "txn:{}", self.0)
    }
}

/// Isolation level requested from the backing store.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    /// Serializable reads and writes. The only read-write level.
    #[default]
    SerializableReadWrite,
    /// Reads see a consistent, up-to-date state.
    OnlineConsistentReadOnly,
    /// Reads see up-to-date rows without cross-row consistency.
    OnlineInconsistentReadOnly,
    /// Reads see a consistent but possibly stale state.
    StaleConsistentReadOnly,
    /// Reads see a consistent snapshot fixed at transaction start.
    Snapshot,
}

impl IsolationLevel {
    /// Returns true for every level except `SerializableReadWrite`.
    #[must_use]
    pub const fn is_read_only(self) -> bool {
        !matches!(self, Self::SerializableReadWrite)
    }

    /// Short tag appended to transaction names in diagnostics.
    #[must_use]
    pub const fn tx_id_suffix(self) -> &'static str {
        match self {
            Self::SerializableReadWrite => "",
            Self::OnlineConsistentReadOnly => "OC",
            Self::OnlineInconsistentReadOnly => "OI",
            Self::StaleConsistentReadOnly => "SC",
            Self::Snapshot => "SP",
        }
    }
}

/// What a transactional call does when a transaction is already bound to
/// the current thread.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Propagation {
    /// Reject the call.
    #[default]
    Never,
    /// Run inside the existing transaction.
    Required,
    /// Start an independent transaction, shadowing the existing one.
    RequiresNew,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_serializable_is_read_write() {
        assert!(!IsolationLevel::SerializableReadWrite.is_read_only());
        assert!(IsolationLevel::OnlineConsistentReadOnly.is_read_only());
        assert!(IsolationLevel::OnlineInconsistentReadOnly.is_read_only());
        assert!(IsolationLevel::StaleConsistentReadOnly.is_read_only());
        assert!(IsolationLevel::Snapshot.is_read_only());
    }

    #[test]
    fn suffixes() {
        assert_eq!(IsolationLevel::SerializableReadWrite.tx_id_suffix(), "");
        assert_eq!(IsolationLevel::Snapshot.tx_id_suffix(), "SP");
        assert_eq!(IsolationLevel::StaleConsistentReadOnly.tx_id_suffix(), "SC");
    }

    #[test]
    fn transaction_id_display() {
        assert_eq!(TransactionId::new(42).to_string(), "txn:42");
    }

    #[test]
    fn serde_names() {
        let json = serde_json::to_string(&Propagation::RequiresNew).unwrap();
        assert_eq!(json, "\"requires_new\"");

        let level: IsolationLevel = serde_json::from_str("\"stale_consistent_read_only\"").unwrap();
        assert_eq!(level, IsolationLevel::StaleConsistentReadOnly);
    }
}
