//! Resolution of prepared branches left behind by interrupted commits

use std::collections::{BTreeMap, BTreeSet, HashSet};
use std::sync::Arc;

use parking_lot::RwLock;
use uuid::Uuid;
use xapool_core::{
    Credentials, PhysicalConnection, PhysicalConnectionFactory, Result, XaErrorCode, XaPoolError,
    XaResource, Xid,
};

use crate::transaction::{Decision, TransactionManager};

/// A transactional data source the coordinator scans for in-doubt branches
#[derive(Clone)]
pub struct RecoverableResource {
    pub name: String,
    pub factory: Arc<dyn PhysicalConnectionFactory>,
    /// Resolved from `recovery_auth_ref`; `None` connects with the data source defaults
    pub credentials: Option<Credentials>,
}

impl RecoverableResource {
    pub fn new(name: impl Into<String>, factory: Arc<dyn PhysicalConnectionFactory>) -> Self {
        Self {
            name: name.into(),
            factory,
            credentials: None,
        }
    }

    pub fn with_credentials(mut self, credentials: Option<Credentials>) -> Self {
        self.credentials = credentials;
        self
    }
}

impl std::fmt::Debug for RecoverableResource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoverableResource")
            .field("name", &self.name)
            .field("credentials", &self.credentials)
            .finish_non_exhaustive()
    }
}

/// What one scan of a resource manager found
struct ScanOutcome {
    resource_manager: String,
    /// Global ids the resource manager reported as prepared
    reported: HashSet<Uuid>,
    unresolved: BTreeSet<Uuid>,
}

/// Drives prepared branches to the outcome recorded in the transaction log.
///
/// Branches with no log entry are presumed aborted and rolled back. Every
/// call is idempotent: a resource manager answering "unknown xid" has
/// already completed the branch.
pub struct RecoveryCoordinator {
    tm: Arc<TransactionManager>,
    resources: RwLock<Vec<RecoverableResource>>,
    running: tokio::sync::Mutex<()>,
}

impl RecoveryCoordinator {
    pub fn new(tm: Arc<TransactionManager>) -> Self {
        Self {
            tm,
            resources: RwLock::new(Vec::new()),
            running: tokio::sync::Mutex::new(()),
        }
    }

    pub fn register(&self, resource: RecoverableResource) {
        tracing::debug!(factory = %resource.name, "registered data source for recovery");
        self.resources.write().push(resource);
    }

    pub fn resource_count(&self) -> usize {
        self.resources.read().len()
    }

    /// Resolve every in-doubt branch reachable now.
    ///
    /// Returns the global ids that remain unresolved; an empty result means
    /// the log and every resource manager agree.
    #[tracing::instrument(skip(self))]
    pub async fn recover(&self) -> Result<Vec<Uuid>> {
        let _running = self.running.lock().await;
        let resources = self.resources.read().clone();

        let mut unresolved = BTreeSet::new();
        let mut scanned = Vec::new();
        let mut unreachable = HashSet::new();
        for resource in &resources {
            match self.scan(resource).await {
                Ok(Some(outcome)) => {
                    unresolved.extend(outcome.unresolved.iter().copied());
                    scanned.push(outcome);
                }
                Ok(None) => {}
                Err(e) => {
                    tracing::warn!(factory = %resource.name, error = %e, "recovery scan failed");
                    unreachable.insert(resource.name.clone());
                }
            }
        }

        for entry in self.tm.log().entries().await? {
            let gid = entry.global_id;
            if self.tm.is_active(gid) {
                continue;
            }
            for rm in &entry.pending {
                match scanned.iter().find(|s| &s.resource_manager == rm) {
                    Some(scan) if !scan.reported.contains(&gid) => {
                        tracing::debug!(gid = %gid, rm = %rm, "branch no longer in doubt");
                        self.tm.log().resolved(gid, rm).await?;
                    }
                    Some(_) => {}
                    None => {
                        unresolved.insert(gid);
                    }
                }
            }
        }

        if !unreachable.is_empty() {
            tracing::debug!(unreachable = ?unreachable, "some data sources could not be scanned");
        }
        let unresolved: Vec<Uuid> = unresolved.into_iter().collect();
        if unresolved.is_empty() {
            tracing::debug!(resources = resources.len(), "recovery pass complete");
        } else {
            tracing::info!(unresolved = unresolved.len(), "recovery pass left branches in doubt");
        }
        Ok(unresolved)
    }

    /// Scan one data source; `Ok(None)` when it has no two-phase resource
    async fn scan(&self, resource: &RecoverableResource) -> Result<Option<ScanOutcome>> {
        let connection = resource
            .factory
            .connect(resource.credentials.as_ref())
            .await?;
        let outcome = self.scan_connection(resource, connection.as_ref()).await;
        if let Err(e) = connection.close().await {
            tracing::debug!(factory = %resource.name, error = %e, "closing recovery connection failed");
        }
        outcome
    }

    async fn scan_connection(
        &self,
        resource: &RecoverableResource,
        connection: &dyn PhysicalConnection,
    ) -> Result<Option<ScanOutcome>> {
        let Some(xa) = connection.xa_resource() else {
            return Ok(None);
        };
        let xa = self.tm.wrap(xa);
        let rm = xa.resource_manager().to_string();

        let prepared: Vec<Xid> = xa
            .recover()
            .await?
            .into_iter()
            .filter(Xid::is_ours)
            .collect();
        tracing::debug!(factory = %resource.name, rm = %rm, prepared = prepared.len(), "scanned resource manager");

        let mut outcome = ScanOutcome {
            resource_manager: rm.clone(),
            reported: prepared.iter().map(Xid::global_id).collect(),
            unresolved: BTreeSet::new(),
        };
        // One gid may hold several branches on this resource manager
        let mut branches: BTreeMap<Uuid, Vec<Xid>> = BTreeMap::new();
        for xid in prepared {
            branches.entry(xid.global_id()).or_default().push(xid);
        }
        for (gid, xids) in branches {
            if self.tm.is_active(gid) {
                outcome.unresolved.insert(gid);
                continue;
            }
            let decision = self
                .tm
                .log()
                .decision(gid)
                .await?
                .unwrap_or(Decision::Rollback);

            let mut settled = true;
            for xid in &xids {
                if !self.resolve(xa.as_ref(), &rm, xid, decision).await {
                    settled = false;
                }
            }
            if settled {
                self.tm.log().resolved(gid, &rm).await?;
                outcome.reported.remove(&gid);
            } else {
                outcome.unresolved.insert(gid);
            }
        }
        Ok(Some(outcome))
    }

    /// Complete one branch; `false` when it is still in doubt
    async fn resolve(&self, xa: &dyn XaResource, rm: &str, xid: &Xid, decision: Decision) -> bool {
        let result = match decision {
            Decision::Commit => xa.commit(xid, false).await,
            Decision::Rollback => xa.rollback(xid).await,
        };
        match result {
            Ok(()) => {
                tracing::info!(xid = %xid, rm = %rm, decision = ?decision, "recovered branch");
                true
            }
            Err(e) if e.xa_code() == Some(XaErrorCode::UnknownXid) => true,
            Err(e) if is_heuristic_code(&e) => {
                tracing::warn!(xid = %xid, rm = %rm, error = %e, "branch completed heuristically, forgetting");
                if let Err(e) = xa.forget(xid).await {
                    tracing::debug!(xid = %xid, error = %e, "forget failed");
                }
                true
            }
            Err(e) => {
                tracing::warn!(xid = %xid, rm = %rm, decision = ?decision, error = %e, "branch still in doubt");
                false
            }
        }
    }
}

fn is_heuristic_code(error: &XaPoolError) -> bool {
    matches!(
        error.xa_code(),
        Some(
            XaErrorCode::HeuristicCommit
                | XaErrorCode::HeuristicRollback
                | XaErrorCode::HeuristicMixed
        )
    )
}

impl std::fmt::Debug for RecoveryCoordinator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RecoveryCoordinator")
            .field("resources", &self.resources.read().len())
            .finish()
    }
}
