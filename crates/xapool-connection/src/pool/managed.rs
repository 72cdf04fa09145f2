//! A pooled physical connection and its transactional state

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use tokio::time::Instant;
use uuid::Uuid;
use xapool_core::{
    CleanupAction, ConnectionState, IsolationLevel, PhysicalConnection, ResolvedRequest, Result,
    XaResource,
};

/// Where a managed connection stands with respect to transaction branches
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BranchState {
    /// Not enlisted in any branch
    Free,
    /// Enlisted, work is associated with the branch
    Active(Uuid),
    /// Work on the branch has ended and its outcome is pending
    Suspended(Uuid),
}

impl BranchState {
    pub fn is_free(&self) -> bool {
        matches!(self, BranchState::Free)
    }
}

/// One physical connection owned by a pool.
///
/// Tracks the live [`ConnectionState`] so sharing decisions can compare it
/// against new requests without asking the driver.
pub struct ManagedConnection {
    id: Uuid,
    factory: String,
    physical: Arc<dyn PhysicalConnection>,
    created_at: Instant,
    state: Mutex<ConnectionState>,
    branch: Mutex<BranchState>,
    local_work: AtomicBool,
}

impl ManagedConnection {
    pub(crate) fn new(
        factory: impl Into<String>,
        physical: Arc<dyn PhysicalConnection>,
        isolation: IsolationLevel,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            factory: factory.into(),
            physical,
            created_at: Instant::now(),
            state: Mutex::new(ConnectionState::initial(isolation)),
            branch: Mutex::new(BranchState::Free),
            local_work: AtomicBool::new(false),
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Name of the data source this connection belongs to
    pub fn factory(&self) -> &str {
        &self.factory
    }

    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    pub fn physical(&self) -> &Arc<dyn PhysicalConnection> {
        &self.physical
    }

    /// Snapshot of the live connection state
    pub fn state(&self) -> ConnectionState {
        self.state.lock().clone()
    }

    pub fn branch_state(&self) -> BranchState {
        *self.branch.lock()
    }

    pub(crate) fn set_branch_state(&self, state: BranchState) {
        *self.branch.lock() = state;
    }

    /// Whether statements ran since the last local commit or rollback
    pub fn has_local_work(&self) -> bool {
        self.local_work.load(Ordering::SeqCst)
    }

    pub fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.physical.xa_resource()
    }

    pub fn is_aborted(&self) -> bool {
        self.physical.is_aborted()
    }

    pub fn is_closed(&self) -> bool {
        self.physical.is_closed()
    }

    /// Bring the live state in line with a resolved request
    pub(crate) async fn apply_request(&self, request: &ResolvedRequest) -> Result<()> {
        let current = self.state();
        if current.isolation != request.isolation {
            self.set_isolation(request.isolation).await?;
        }
        if current.read_only != request.read_only {
            self.set_read_only(request.read_only).await?;
        }
        if current.client_info != request.client_info {
            for (key, value) in &request.client_info {
                self.physical.set_client_info(key, value).await?;
            }
            self.state.lock().client_info = request.client_info.clone();
        }
        Ok(())
    }

    pub async fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.physical.set_isolation(level).await?;
        self.state.lock().isolation = level;
        Ok(())
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.physical.set_read_only(read_only).await?;
        self.state.lock().read_only = read_only;
        Ok(())
    }

    /// Switch autocommit; turning it back on ends any open local transaction
    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        if self.state.lock().auto_commit == auto_commit {
            return Ok(());
        }
        self.physical.set_auto_commit(auto_commit).await?;
        self.state.lock().auto_commit = auto_commit;
        if auto_commit {
            self.local_work.store(false, Ordering::SeqCst);
        }
        Ok(())
    }

    pub async fn execute(&self, sql: &str, timeout: Option<Duration>) -> Result<u64> {
        let rows = self.physical.execute(sql, timeout).await?;
        if !self.state.lock().auto_commit {
            self.local_work.store(true, Ordering::SeqCst);
        }
        Ok(rows)
    }

    pub async fn commit_local(&self) -> Result<()> {
        self.physical.commit().await?;
        self.local_work.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn rollback_local(&self) -> Result<()> {
        self.physical.rollback().await?;
        self.local_work.store(false, Ordering::SeqCst);
        Ok(())
    }

    pub async fn ping(&self) -> Result<()> {
        self.physical.ping().await
    }

    /// Reset the connection before it goes back to the free pool.
    ///
    /// Pending local work is resolved per `action`, autocommit is restored and
    /// isolation, read-only and client info return to the data source defaults.
    pub(crate) async fn cleanup(&self, isolation: IsolationLevel, action: CleanupAction) -> Result<()> {
        if self.has_local_work() {
            tracing::debug!(connection_id = %self.id, action = ?action, "resolving uncommitted local work on cleanup");
            match action {
                CleanupAction::Commit => self.commit_local().await?,
                CleanupAction::Rollback => self.rollback_local().await?,
            }
        }
        self.set_auto_commit(true).await?;

        let current = self.state();
        if current.isolation != isolation {
            self.set_isolation(isolation).await?;
        }
        if current.read_only {
            self.set_read_only(false).await?;
        }
        if !current.client_info.is_empty() {
            for key in current.client_info.keys() {
                self.physical.set_client_info(key, "").await?;
            }
            self.state.lock().client_info.clear();
        }
        Ok(())
    }

    /// Close the physical connection, logging rather than propagating failures
    pub(crate) async fn destroy(&self) {
        if self.physical.is_closed() {
            return;
        }
        if let Err(e) = self.physical.close().await {
            tracing::debug!(connection_id = %self.id, error = %e, "error closing physical connection");
        }
    }
}

impl std::fmt::Debug for ManagedConnection {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ManagedConnection")
            .field("id", &self.id)
            .field("factory", &self.factory)
            .field("driver", &self.physical.driver_name())
            .field("branch", &self.branch_state())
            .finish()
    }
}
