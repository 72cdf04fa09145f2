//! The coordinator's commit decision log

use std::collections::{BTreeMap, BTreeSet};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use xapool_core::Result;

/// Outcome the coordinator decided for a global transaction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Decision {
    Commit,
    Rollback,
}

/// A logged decision and the resource managers that have not yet applied it
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LogEntry {
    pub global_id: Uuid,
    pub decision: Decision,
    pub pending: BTreeSet<String>,
    pub logged_at: DateTime<Utc>,
}

impl LogEntry {
    pub fn new(
        global_id: Uuid,
        decision: Decision,
        resource_managers: impl IntoIterator<Item = String>,
    ) -> Self {
        Self {
            global_id,
            decision,
            pending: resource_managers.into_iter().collect(),
            logged_at: Utc::now(),
        }
    }
}

/// Storage for commit decisions.
///
/// A decision must be durable before phase two starts; an xid with no entry
/// is presumed aborted.
#[async_trait]
pub trait TransactionLog: Send + Sync {
    async fn record(&self, entry: LogEntry) -> Result<()>;

    async fn decision(&self, global_id: Uuid) -> Result<Option<Decision>>;

    /// Mark one resource manager done; the entry is dropped once none remain
    async fn resolved(&self, global_id: Uuid, resource_manager: &str) -> Result<()>;

    async fn forget(&self, global_id: Uuid) -> Result<()>;

    async fn entries(&self) -> Result<Vec<LogEntry>>;
}

/// Non-durable log for tests and embedded use
#[derive(Debug, Default)]
pub struct InMemoryTransactionLog {
    entries: Mutex<BTreeMap<Uuid, LogEntry>>,
}

impl InMemoryTransactionLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Snapshot of the log as JSON
    pub fn to_json(&self) -> Result<String> {
        let entries: Vec<LogEntry> = self.entries.lock().values().cloned().collect();
        Ok(serde_json::to_string_pretty(&entries)?)
    }
}

#[async_trait]
impl TransactionLog for InMemoryTransactionLog {
    async fn record(&self, entry: LogEntry) -> Result<()> {
        tracing::debug!(gid = %entry.global_id, decision = ?entry.decision, pending = ?entry.pending, "logging decision");
        self.entries.lock().insert(entry.global_id, entry);
        Ok(())
    }

    async fn decision(&self, global_id: Uuid) -> Result<Option<Decision>> {
        Ok(self.entries.lock().get(&global_id).map(|entry| entry.decision))
    }

    async fn resolved(&self, global_id: Uuid, resource_manager: &str) -> Result<()> {
        let mut entries = self.entries.lock();
        if let Some(entry) = entries.get_mut(&global_id) {
            entry.pending.remove(resource_manager);
            if entry.pending.is_empty() {
                entries.remove(&global_id);
            }
        }
        Ok(())
    }

    async fn forget(&self, global_id: Uuid) -> Result<()> {
        self.entries.lock().remove(&global_id);
        Ok(())
    }

    async fn entries(&self) -> Result<Vec<LogEntry>> {
        Ok(self.entries.lock().values().cloned().collect())
    }
}
