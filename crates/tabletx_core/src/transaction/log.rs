//! Per-transaction statement log.

use crate::config::LogLevel;
use std::cell::RefCell;

/// Statements recorded by one physical transaction.
///
/// The log is emitted through `tracing` when the transaction rolls back,
/// and after a commit if `log_statement_on_success` is set.
#[derive(Debug)]
pub struct TxLog {
    level: LogLevel,
    context: String,
    entries: RefCell<Vec<String>>,
}

impl TxLog {
    pub(crate) fn new(level: LogLevel, context: String) -> Self {
        Self {
            level,
            context,
            entries: RefCell::new(Vec::new()),
        }
    }

    /// Records a statement at debug level.
    pub fn debug(&self, statement: impl Into<String>) {
        if self.level == LogLevel::Debug {
            self.entries.borrow_mut().push(statement.into());
        }
    }

    /// Records a statement at info level.
    pub fn info(&self, statement: impl Into<String>) {
        if self.level != LogLevel::Off {
            self.entries.borrow_mut().push(statement.into());
        }
    }

    /// Returns the recorded statements.
    pub fn entries(&self) -> Vec<String> {
        self.entries.borrow().clone()
    }

    pub(crate) fn emit(&self, outcome: &str) {
        let entries = self.entries.borrow();
        if entries.is_empty() {
            return;
        }
        tracing::info!(
            tx = %self.context,
            outcome,
            statements = entries.len(),
            "{}",
            entries.join("; ")
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn levels_filter_statements() {
        let log = TxLog::new(LogLevel::Info, "t".into());
        log.debug("find accounts/1");
        log.info("upsert accounts/1");
        assert_eq!(log.entries(), vec!["upsert accounts/1".to_string()]);

        let log = TxLog::new(LogLevel::Debug, "t".into());
        log.debug("find accounts/1");
        log.info("upsert accounts/1");
        assert_eq!(log.entries().len(), 2);

        let log = TxLog::new(LogLevel::Off, "t".into());
        log.info("upsert accounts/1");
        assert!(log.entries().is_empty());
    }
}
