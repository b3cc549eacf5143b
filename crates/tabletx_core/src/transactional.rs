//! Declarative transaction settings.

use crate::error::{TxError, TxResult};
use crate::transaction::TxManager;
use crate::types::{IsolationLevel, Propagation};
use std::fmt;
use std::sync::Arc;

/// Transaction settings declared once and applied to a manager per call.
///
/// Unlike a bare [`TxManager`], the default propagation here is
/// [`Propagation::Required`], so wrapped operations compose: calling one
/// from inside another joins the outer transaction.
#[derive(Clone)]
pub struct Transactional {
    name: Option<String>,
    read_only: bool,
    isolation: Option<IsolationLevel>,
    propagation: Propagation,
    max_retries: Option<u32>,
    no_rollback_for: Option<Arc<dyn Fn(&TxError) -> bool + Send + Sync>>,
}

impl Transactional {
    /// Creates settings that join an existing transaction or start one.
    pub fn new() -> Self {
        Self {
            name: None,
            read_only: false,
            isolation: None,
            propagation: Propagation::Required,
            max_retries: None,
            no_rollback_for: None,
        }
    }

    /// Sets the transaction name.
    #[must_use]
    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Marks the transaction read-only.
    #[must_use]
    pub fn read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    /// Sets the isolation level.
    #[must_use]
    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation = Some(level);
        self
    }

    /// Sets the propagation mode.
    #[must_use]
    pub fn with_propagation(mut self, propagation: Propagation) -> Self {
        self.propagation = propagation;
        self
    }

    /// Overrides the manager's retry budget.
    #[must_use]
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = Some(max_retries);
        self
    }

    /// Commits despite errors matching `matches`.
    #[must_use]
    pub fn with_no_rollback_for(
        mut self,
        matches: impl Fn(&TxError) -> bool + Send + Sync + 'static,
    ) -> Self {
        self.no_rollback_for = Some(Arc::new(matches));
        self
    }

    /// Derives a manager carrying these settings.
    pub fn apply(&self, manager: &TxManager) -> TxResult<TxManager> {
        let mut configured = manager.with_propagation(self.propagation);

        let isolation = match (self.read_only, self.isolation) {
            (true, Some(level)) if !level.is_read_only() => {
                return Err(TxError::invalid_argument(format!(
                    "read-only transaction cannot use {level:?}"
                )));
            }
            (true, None) => Some(IsolationLevel::OnlineConsistentReadOnly),
            (_, level) => level,
        };
        if let Some(level) = isolation {
            configured = configured.with_isolation_level(level);
        }
        if let Some(name) = &self.name {
            configured = configured.with_name(name.clone());
        }
        if let Some(max_retries) = self.max_retries {
            configured = configured.with_max_retries(max_retries);
        }
        if let Some(matches) = &self.no_rollback_for {
            let matches = Arc::clone(matches);
            configured = configured.with_no_rollback_for(move |e| matches(e));
        }
        Ok(configured)
    }
}

impl Default for Transactional {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Debug for Transactional {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Transactional")
            .field("name", &self.name)
            .field("read_only", &self.read_only)
            .field("isolation", &self.isolation)
            .field("propagation", &self.propagation)
            .field("max_retries", &self.max_retries)
            .field("no_rollback_for", &self.no_rollback_for.is_some())
            .finish()
    }
}

/// Runs `work` under `transactional` settings applied to `manager`.
#[track_caller]
pub fn with_transaction<T, F>(
    manager: &TxManager,
    transactional: &Transactional,
    work: F,
) -> TxResult<T>
where
    F: FnMut() -> TxResult<T>,
{
    transactional.apply(manager)?.tx(work)
}
