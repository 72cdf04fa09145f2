//! Statement timeouts synchronized with transaction deadlines

use std::time::Duration;

use crate::transaction::TransactionBranch;

/// Computes the timeout a statement runs with.
///
/// With synchronization enabled, a statement inside an active branch never
/// outlives the branch: it gets `min(default, remaining)`. Outside a branch, or
/// once the branch has completed, the configured default applies again.
#[derive(Debug, Clone, Copy)]
pub struct TimeoutSynchronizer {
    sync: bool,
}

impl TimeoutSynchronizer {
    pub fn new(sync_with_transaction: bool) -> Self {
        Self {
            sync: sync_with_transaction,
        }
    }

    pub fn effective_timeout(
        &self,
        default: Option<Duration>,
        branch: Option<&TransactionBranch>,
    ) -> Option<Duration> {
        let remaining = match branch {
            Some(branch) if self.sync && branch.is_active() => branch.remaining(),
            _ => None,
        };
        match (default, remaining) {
            (Some(default), Some(remaining)) => Some(default.min(remaining)),
            (None, remaining) => remaining,
            (default, None) => default,
        }
    }

    /// Timeout for one statement; an explicit statement timeout always wins
    pub fn for_statement(
        &self,
        explicit: Option<Duration>,
        default: Option<Duration>,
        branch: Option<&TransactionBranch>,
    ) -> Option<Duration> {
        explicit.or_else(|| self.effective_timeout(default, branch))
    }
}
