//! Sample entities and ready-made test environments.

use crate::logging::init_tracing;
use serde::{Deserialize, Serialize};
use tabletx_core::{Entity, RetryPolicy, TxManager, TxResult};
use tabletx_inmemory::InMemoryRepository;
use uuid::Uuid;

/// A bank account, keyed by a random UUID.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// Account id.
    pub id: Uuid,
    /// Owner name.
    pub owner: String,
    /// Balance in cents.
    pub balance: i64,
}

impl Account {
    /// Creates an account with a fresh id.
    pub fn new(owner: impl Into<String>, balance: i64) -> Self {
        Self {
            id: Uuid::new_v4(),
            owner: owner.into(),
            balance,
        }
    }
}

impl Entity for Account {
    type Id = Uuid;
    const TABLE: &'static str = "accounts";

    fn id(&self) -> Uuid {
        self.id
    }
}

/// A note with a numeric id.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Note {
    /// Note id.
    pub id: u64,
    /// Note body.
    pub text: String,
}

impl Note {
    /// Creates a note.
    pub fn new(id: u64, text: impl Into<String>) -> Self {
        Self {
            id,
            text: text.into(),
        }
    }
}

impl Entity for Note {
    type Id = u64;
    const TABLE: &'static str = "notes";

    fn id(&self) -> u64 {
        self.id
    }
}

/// An in-memory repository and a manager over it.
///
/// The manager retries without sleeping so tests stay fast.
#[derive(Debug, Clone)]
pub struct TestEnv {
    /// The backing repository.
    pub repo: InMemoryRepository,
    /// A manager with default settings and immediate retries.
    pub manager: TxManager,
}

impl TestEnv {
    /// Creates an empty environment.
    pub fn new() -> Self {
        init_tracing();
        let repo = InMemoryRepository::new();
        let manager =
            TxManager::new(repo.clone()).with_retry_policy(RetryPolicy::retry_immediately());
        Self { repo, manager }
    }

    /// Stores `count` accounts with `balance` each, outside any transaction.
    pub fn seed_accounts(&self, count: usize, balance: i64) -> TxResult<Vec<Account>> {
        (0..count)
            .map(|i| {
                let account = Account::new(format!("owner-{i}"), balance);
                self.repo.put_entity(&account)?;
                Ok(account)
            })
            .collect()
    }

    /// Stores notes `0..count`, outside any transaction.
    pub fn seed_notes(&self, count: u64) -> TxResult<Vec<Note>> {
        (0..count)
            .map(|id| {
                let note = Note::new(id, format!("note {id}"));
                self.repo.put_entity(&note)?;
                Ok(note)
            })
            .collect()
    }
}

impl Default for TestEnv {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn seeded_rows_are_committed() {
        let env = TestEnv::new();
        let accounts = env.seed_accounts(3, 100).unwrap();
        env.seed_notes(5).unwrap();

        assert_eq!(env.repo.len(Account::TABLE), 3);
        assert_eq!(env.repo.len(Note::TABLE), 5);
        let stored = env.repo.get_entity::<Account>(&accounts[1].id).unwrap();
        assert_eq!(stored.as_ref(), Some(&accounts[1]));
    }
}
