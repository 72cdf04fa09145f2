//! Transaction branches and their participants

use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use xapool_core::{ResourceKind, Result, XaPoolError, XaResource, Xid};

use crate::pool::{ManagedConnection, McKey, Pool};

pub(crate) const TIMED_OUT: &str = "transaction timed out";

/// Whether a branch coordinates XA resources or local transactions
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ScopeKind {
    Global,
    Local,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchStatus {
    Active,
    /// Still open, but can only be rolled back
    RollbackOnly,
    Committing,
    RollingBack,
    Committed,
    RolledBack,
    /// Completed with a heuristic outcome; recovery owns the rest
    InDoubt,
}

/// A managed connection enlisted in a branch
pub(crate) struct Participant {
    pub pool: Arc<Pool>,
    pub key: McKey,
    pub mc: Arc<ManagedConnection>,
    pub resource: Arc<dyn XaResource>,
    pub xid: Xid,
    pub kind: ResourceKind,
    pub rm: String,
}

struct BranchInner {
    status: BranchStatus,
    participants: Vec<Participant>,
    next_branch: u16,
    rollback_reason: Option<String>,
}

/// One active global or local transaction scope
pub struct TransactionBranch {
    id: Uuid,
    kind: ScopeKind,
    timeout: Option<Duration>,
    deadline: Option<Instant>,
    inner: Mutex<BranchInner>,
}

impl TransactionBranch {
    pub(crate) fn new(kind: ScopeKind, timeout: Option<Duration>) -> Self {
        Self {
            id: Uuid::new_v4(),
            kind,
            timeout,
            deadline: timeout.map(|timeout| Instant::now() + timeout),
            inner: Mutex::new(BranchInner {
                status: BranchStatus::Active,
                participants: Vec::new(),
                next_branch: 1,
                rollback_reason: None,
            }),
        }
    }

    /// Global transaction id shared by every branch xid
    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn kind(&self) -> ScopeKind {
        self.kind
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    /// Time left before the branch times out, `None` without a timeout
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    pub fn is_expired(&self) -> bool {
        self.deadline.is_some_and(|deadline| Instant::now() >= deadline)
    }

    pub fn status(&self) -> BranchStatus {
        self.inner.lock().status
    }

    /// Whether the branch still accepts work
    pub fn is_active(&self) -> bool {
        matches!(self.status(), BranchStatus::Active | BranchStatus::RollbackOnly)
    }

    pub fn is_rollback_only(&self) -> bool {
        self.status() == BranchStatus::RollbackOnly
    }

    /// Mark an active branch so that it can only roll back; the first reason sticks
    pub fn mark_rollback_only(&self, reason: impl Into<String>) {
        let mut inner = self.inner.lock();
        if inner.status == BranchStatus::Active {
            inner.status = BranchStatus::RollbackOnly;
            inner.rollback_reason = Some(reason.into());
        }
    }

    pub fn rollback_reason(&self) -> Option<String> {
        self.inner.lock().rollback_reason.clone()
    }

    pub fn participant_count(&self) -> usize {
        self.inner.lock().participants.len()
    }

    /// Resource manager names of the enlisted participants
    pub fn resource_managers(&self) -> Vec<String> {
        self.inner
            .lock()
            .participants
            .iter()
            .map(|p| p.rm.clone())
            .collect()
    }

    /// Fail unless new work may run in this branch, marking it rollback-only on timeout
    pub fn check_usable(&self) -> Result<()> {
        if self.is_expired() {
            self.mark_rollback_only(TIMED_OUT);
        }
        let inner = self.inner.lock();
        match inner.status {
            BranchStatus::Active => Ok(()),
            BranchStatus::RollbackOnly if inner.rollback_reason.as_deref() == Some(TIMED_OUT) => {
                Err(XaPoolError::TransactionTimedOut(self.id.to_string()))
            }
            BranchStatus::RollbackOnly => Err(XaPoolError::InvalidState(format!(
                "transaction {} is marked rollback-only",
                self.id
            ))),
            status => Err(XaPoolError::InvalidState(format!(
                "transaction {} is no longer active ({:?})",
                self.id, status
            ))),
        }
    }

    pub(crate) fn has_participant(&self, mc_id: Uuid) -> bool {
        self.inner
            .lock()
            .participants
            .iter()
            .any(|p| p.mc.id() == mc_id)
    }

    /// (one-phase-only participants, all participants)
    pub(crate) fn participant_kinds(&self) -> (usize, usize) {
        let inner = self.inner.lock();
        let one_phase = inner
            .participants
            .iter()
            .filter(|p| p.kind == ResourceKind::OnePhaseOnly)
            .count();
        (one_phase, inner.participants.len())
    }

    pub(crate) fn next_xid(&self) -> Xid {
        let mut inner = self.inner.lock();
        let branch = inner.next_branch;
        inner.next_branch = inner.next_branch.wrapping_add(1);
        Xid::new(self.id, branch)
    }

    pub(crate) fn add_participant(&self, participant: Participant) {
        self.inner.lock().participants.push(participant);
    }

    pub(crate) fn take_participants(&self) -> Vec<Participant> {
        std::mem::take(&mut self.inner.lock().participants)
    }

    pub(crate) fn set_status(&self, status: BranchStatus) {
        self.inner.lock().status = status;
    }
}

impl std::fmt::Debug for TransactionBranch {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionBranch")
            .field("id", &self.id)
            .field("kind", &self.kind)
            .field("status", &self.status())
            .field("remaining", &self.remaining())
            .finish()
    }
}
