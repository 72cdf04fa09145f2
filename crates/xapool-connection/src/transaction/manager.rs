//! Enlistment and completion of transaction branches

use std::collections::{BTreeSet, HashSet};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::sync::Notify;
use uuid::Uuid;
use xapool_core::{
    HeuristicKind, ResourceKind, Result, TransactionConfig, Vote, XaErrorCode, XaPoolError,
    XaResource,
};

use super::branch::{BranchStatus, Participant, ScopeKind, TIMED_OUT, TransactionBranch};
use super::fault::ResourceInterceptor;
use super::local::LocalTransactionResource;
use super::log::{Decision, LogEntry, TransactionLog};
use crate::pool::{BranchState, ManagedConnection, McKey, Pool};

/// Coordinates enlistment of managed connections and the commit protocol
pub struct TransactionManager {
    config: TransactionConfig,
    log: Arc<dyn TransactionLog>,
    interceptor: RwLock<Option<Arc<dyn ResourceInterceptor>>>,
    recovery_signal: Arc<Notify>,
    /// Global transactions begun and not yet completed
    active: Mutex<HashSet<Uuid>>,
}

impl TransactionManager {
    pub fn new(config: TransactionConfig, log: Arc<dyn TransactionLog>) -> Self {
        Self {
            config,
            log,
            interceptor: RwLock::new(None),
            recovery_signal: Arc::new(Notify::new()),
            active: Mutex::new(HashSet::new()),
        }
    }

    pub fn config(&self) -> &TransactionConfig {
        &self.config
    }

    pub fn log(&self) -> &Arc<dyn TransactionLog> {
        &self.log
    }

    /// Notified whenever a commit ends with a heuristic outcome
    pub fn recovery_signal(&self) -> Arc<Notify> {
        Arc::clone(&self.recovery_signal)
    }

    pub fn set_interceptor(&self, interceptor: Option<Arc<dyn ResourceInterceptor>>) {
        *self.interceptor.write() = interceptor;
    }

    /// Pass a resource through the configured interceptor
    pub fn wrap(&self, resource: Arc<dyn XaResource>) -> Arc<dyn XaResource> {
        let interceptor = self.interceptor.read().clone();
        match interceptor {
            Some(interceptor) => interceptor.intercept(resource),
            None => resource,
        }
    }

    /// Whether the global transaction is still being driven by this manager
    pub fn is_active(&self, global_id: Uuid) -> bool {
        self.active.lock().contains(&global_id)
    }

    /// Begin a global transaction; `None` applies the configured default timeout
    pub fn begin(&self, timeout: Option<Duration>) -> Arc<TransactionBranch> {
        let timeout = timeout.or(self.config.default_timeout());
        let branch = Arc::new(TransactionBranch::new(ScopeKind::Global, timeout));
        self.active.lock().insert(branch.id());
        tracing::info!(gid = %branch.id(), timeout = ?timeout, "global transaction started");
        branch
    }

    /// Begin a local transaction scope
    pub fn begin_local(&self) -> Arc<TransactionBranch> {
        let branch = Arc::new(TransactionBranch::new(ScopeKind::Local, None));
        tracing::debug!(gid = %branch.id(), "local transaction scope started");
        branch
    }

    /// Enlist a managed connection in the branch at its first use there
    #[tracing::instrument(skip_all, fields(gid = %branch.id(), factory = %pool.name(), connection_id = %mc.id()))]
    pub async fn enlist(
        &self,
        branch: &TransactionBranch,
        pool: &Arc<Pool>,
        key: McKey,
        mc: &Arc<ManagedConnection>,
    ) -> Result<()> {
        if !pool.config().transactional() || branch.has_participant(mc.id()) {
            return Ok(());
        }
        branch.check_usable()?;
        if !mc.branch_state().is_free() {
            return Err(XaPoolError::InvalidState(format!(
                "connection {} is already enlisted in another transaction",
                mc.id()
            )));
        }

        let resource = match (branch.kind(), mc.xa_resource()) {
            (ScopeKind::Global, Some(resource)) => resource,
            _ => Arc::new(LocalTransactionResource::new(Arc::clone(mc))) as Arc<dyn XaResource>,
        };
        let resource = self.wrap(resource);
        let kind = resource.kind();
        if branch.kind() == ScopeKind::Global {
            self.check_one_phase_limit(branch, kind)?;
        }

        let xid = branch.next_xid();
        resource.start(&xid).await?;
        mc.set_branch_state(BranchState::Active(branch.id()));
        let rm = resource.resource_manager().to_string();
        tracing::debug!(xid = %xid, rm = %rm, kind = ?kind, "enlisted connection");
        branch.add_participant(Participant {
            pool: Arc::clone(pool),
            key,
            mc: Arc::clone(mc),
            resource,
            xid,
            kind,
            rm,
        });
        Ok(())
    }

    fn check_one_phase_limit(&self, branch: &TransactionBranch, kind: ResourceKind) -> Result<()> {
        let (one_phase, total) = branch.participant_kinds();
        let one_phase = one_phase + usize::from(kind == ResourceKind::OnePhaseOnly);
        let total = total + 1;
        if one_phase > 1 {
            return Err(XaPoolError::InvalidState(format!(
                "transaction {} already has a one-phase-only participant",
                branch.id()
            )));
        }
        if one_phase == 1 && total > 1 && !self.config.last_participant_support() {
            return Err(XaPoolError::InvalidState(format!(
                "transaction {} cannot mix a one-phase-only resource with two-phase resources \
                 without last participant support",
                branch.id()
            )));
        }
        Ok(())
    }

    /// Commit the branch, rolling back instead if it is marked rollback-only
    #[tracing::instrument(skip_all, fields(gid = %branch.id()))]
    pub async fn commit(&self, branch: &TransactionBranch) -> Result<()> {
        let gid = branch.id();
        if !branch.is_active() {
            return Err(XaPoolError::InvalidState(format!(
                "transaction {} is not active",
                gid
            )));
        }
        if branch.is_expired() {
            branch.mark_rollback_only(TIMED_OUT);
        }
        if branch.is_rollback_only() {
            let reason = branch
                .rollback_reason()
                .unwrap_or_else(|| "marked rollback-only".to_string());
            if let Err(e) = self.rollback(branch).await {
                tracing::warn!(error = %e, "rollback of rollback-only transaction reported an error");
            }
            return Err(XaPoolError::RolledBack {
                xid: gid.to_string(),
                reason,
            });
        }

        branch.set_status(BranchStatus::Committing);
        let participants = branch.take_participants();
        let result = match branch.kind() {
            ScopeKind::Local => self.commit_local(branch, &participants).await,
            ScopeKind::Global => self.commit_global(branch, &participants).await,
        };
        self.finish(&participants).await;

        let status = match &result {
            Ok(()) => BranchStatus::Committed,
            Err(e) if e.is_heuristic() => BranchStatus::InDoubt,
            Err(_) => BranchStatus::RolledBack,
        };
        branch.set_status(status);
        self.active.lock().remove(&gid);

        match &result {
            Ok(()) => tracing::info!(participants = participants.len(), "transaction committed"),
            Err(e) if e.is_heuristic() => {
                tracing::error!(error = %e, "transaction completed heuristically, signalling recovery");
                self.recovery_signal.notify_one();
            }
            Err(e) => tracing::warn!(error = %e, "transaction rolled back during commit"),
        }
        result
    }

    async fn commit_local(
        &self,
        branch: &TransactionBranch,
        participants: &[Participant],
    ) -> Result<()> {
        let mut committed = Vec::new();
        for (index, p) in participants.iter().enumerate() {
            if let Err(e) = p.resource.commit(&p.xid, true).await {
                tracing::warn!(rm = %p.rm, error = %e, "local commit failed");
                self.rollback_each(&participants[index..]).await;
                if committed.is_empty() {
                    return Err(XaPoolError::RolledBack {
                        xid: branch.id().to_string(),
                        reason: e.to_string(),
                    });
                }
                return Err(XaPoolError::Heuristic {
                    xid: branch.id().to_string(),
                    kind: HeuristicKind::Mixed,
                    committed,
                    failed: vec![p.rm.clone()],
                });
            }
            committed.push(p.rm.clone());
        }
        Ok(())
    }

    async fn commit_global(
        &self,
        branch: &TransactionBranch,
        participants: &[Participant],
    ) -> Result<()> {
        let gid = branch.id();
        for p in participants {
            if let Err(e) = p.resource.end(&p.xid).await {
                self.rollback_each(participants).await;
                return Err(XaPoolError::RolledBack {
                    xid: gid.to_string(),
                    reason: format!("ending work on {} failed: {}", p.rm, e),
                });
            }
            p.mc.set_branch_state(BranchState::Suspended(gid));
        }

        match participants {
            [] => Ok(()),
            [only] => self.commit_one_phase(gid, only).await,
            _ => self.commit_two_phase(gid, participants).await,
        }
    }

    async fn commit_one_phase(&self, gid: Uuid, p: &Participant) -> Result<()> {
        tracing::debug!(rm = %p.rm, xid = %p.xid, "single participant, committing in one phase");
        match p.resource.commit(&p.xid, true).await {
            Ok(()) => Ok(()),
            Err(e) if e.xa_code() == Some(XaErrorCode::RolledBack) => Err(XaPoolError::RolledBack {
                xid: gid.to_string(),
                reason: e.to_string(),
            }),
            Err(e) => {
                tracing::error!(rm = %p.rm, error = %e, "one-phase commit outcome unknown");
                Err(XaPoolError::Heuristic {
                    xid: gid.to_string(),
                    kind: HeuristicKind::Hazard,
                    committed: Vec::new(),
                    failed: vec![p.rm.clone()],
                })
            }
        }
    }

    async fn commit_two_phase(&self, gid: Uuid, participants: &[Participant]) -> Result<()> {
        let (last, two_phase): (Vec<&Participant>, Vec<&Participant>) = participants
            .iter()
            .partition(|p| p.kind == ResourceKind::OnePhaseOnly);

        // Phase one
        let mut prepared: Vec<&Participant> = Vec::new();
        for (index, p) in two_phase.iter().copied().enumerate() {
            match p.resource.prepare(&p.xid).await {
                Ok(Vote::Ok) => prepared.push(p),
                Ok(Vote::ReadOnly) => {
                    tracing::debug!(rm = %p.rm, xid = %p.xid, "read-only vote, participant leaves the commit");
                }
                Err(e) => {
                    tracing::warn!(rm = %p.rm, xid = %p.xid, error = %e, "prepare failed, rolling back");
                    let undo: Vec<&Participant> = prepared
                        .iter()
                        .copied()
                        .chain(two_phase[index..].iter().copied())
                        .chain(last.iter().copied())
                        .collect();
                    self.rollback_refs(&undo).await;
                    return Err(XaPoolError::RolledBack {
                        xid: gid.to_string(),
                        reason: format!("prepare failed on {}: {}", p.rm, e),
                    });
                }
            }
        }

        let mut committed = Vec::new();
        if let Some(lp) = last.first() {
            tracing::debug!(rm = %lp.rm, "committing last participant");
            if let Err(e) = lp.resource.commit(&lp.xid, true).await {
                tracing::warn!(rm = %lp.rm, error = %e, "last participant failed, rolling back prepared participants");
                self.rollback_refs(&prepared).await;
                return Err(XaPoolError::RolledBack {
                    xid: gid.to_string(),
                    reason: format!("last participant {} failed: {}", lp.rm, e),
                });
            }
            committed.push(lp.rm.clone());
        }

        if prepared.is_empty() {
            return Ok(());
        }

        let entry = LogEntry::new(gid, Decision::Commit, prepared.iter().map(|p| p.rm.clone()));
        if let Err(e) = self.log.record(entry).await {
            tracing::error!(error = %e, "could not log commit decision, rolling back");
            self.rollback_refs(&prepared).await;
            if committed.is_empty() {
                return Err(XaPoolError::RolledBack {
                    xid: gid.to_string(),
                    reason: format!("logging the commit decision failed: {}", e),
                });
            }
            return Err(XaPoolError::Heuristic {
                xid: gid.to_string(),
                kind: HeuristicKind::Mixed,
                committed,
                failed: prepared.iter().map(|p| p.rm.clone()).collect(),
            });
        }

        // Phase two
        let mut failed = Vec::new();
        for p in &prepared {
            match p.resource.commit(&p.xid, false).await {
                Ok(()) => committed.push(p.rm.clone()),
                Err(e)
                    if matches!(
                        e.xa_code(),
                        Some(XaErrorCode::UnknownXid | XaErrorCode::HeuristicCommit)
                    ) =>
                {
                    tracing::debug!(rm = %p.rm, xid = %p.xid, error = %e, "branch already committed");
                    committed.push(p.rm.clone());
                }
                Err(e) => {
                    tracing::error!(rm = %p.rm, xid = %p.xid, error = %e, "phase two commit failed");
                    failed.push(p.rm.clone());
                }
            }
        }

        let done: BTreeSet<&str> = prepared
            .iter()
            .map(|p| p.rm.as_str())
            .filter(|rm| !failed.iter().any(|f| f.as_str() == *rm))
            .collect();
        for rm in done {
            if let Err(e) = self.log.resolved(gid, rm).await {
                tracing::warn!(rm = %rm, error = %e, "could not mark log entry resolved");
            }
        }

        if failed.is_empty() {
            return Ok(());
        }
        let kind = if committed.is_empty() {
            HeuristicKind::Hazard
        } else {
            HeuristicKind::Mixed
        };
        Err(XaPoolError::Heuristic {
            xid: gid.to_string(),
            kind,
            committed,
            failed,
        })
    }

    /// Roll back every participant of the branch
    #[tracing::instrument(skip_all, fields(gid = %branch.id()))]
    pub async fn rollback(&self, branch: &TransactionBranch) -> Result<()> {
        let gid = branch.id();
        if !branch.is_active() {
            return Err(XaPoolError::InvalidState(format!(
                "transaction {} is not active",
                gid
            )));
        }
        branch.set_status(BranchStatus::RollingBack);
        let participants = branch.take_participants();

        if branch.kind() == ScopeKind::Global {
            for p in &participants {
                if let Err(e) = p.resource.end(&p.xid).await {
                    tracing::debug!(rm = %p.rm, error = %e, "ending work before rollback failed");
                }
            }
        }
        let failed = self.rollback_each(&participants).await;
        self.finish(&participants).await;
        branch.set_status(BranchStatus::RolledBack);
        self.active.lock().remove(&gid);
        tracing::info!(participants = participants.len(), "transaction rolled back");

        match failed.into_iter().next() {
            None => Ok(()),
            Some(e) => Err(e),
        }
    }

    async fn rollback_each(&self, participants: &[Participant]) -> Vec<XaPoolError> {
        let refs: Vec<&Participant> = participants.iter().collect();
        self.rollback_refs(&refs).await
    }

    async fn rollback_refs(&self, participants: &[&Participant]) -> Vec<XaPoolError> {
        let mut failed = Vec::new();
        for p in participants {
            match p.resource.rollback(&p.xid).await {
                Ok(()) => {}
                Err(e) if e.xa_code() == Some(XaErrorCode::UnknownXid) => {}
                Err(e) => {
                    tracing::warn!(rm = %p.rm, xid = %p.xid, error = %e, "rollback failed");
                    failed.push(e);
                }
            }
        }
        failed
    }

    /// Delist completed participants, returning unused connections to their pools
    async fn finish(&self, participants: &[Participant]) {
        for p in participants {
            p.mc.set_branch_state(BranchState::Free);
            p.pool.delist(p.key).await;
        }
    }
}

impl std::fmt::Debug for TransactionManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TransactionManager")
            .field("config", &self.config)
            .field("active", &self.active.lock().len())
            .finish()
    }
}
