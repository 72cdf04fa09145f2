//! The explicit unit-of-work context
//!
//! A [`Session`] carries the transaction scope that handles acquired through
//! it take part in. Beginning or ending a scope dissociates every shareable
//! handle so that its next use associates under the new scope's sharing rules.

use std::collections::HashMap;
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use xapool_core::{ConnectionRequest, Result, XaPoolError};

use crate::handle::{ConnectionHandle, HandleInner};
use crate::pool::Pool;
use crate::transaction::{TransactionBranch, TransactionManager};

/// Pools by logical data source name
pub(crate) type PoolTable = RwLock<HashMap<String, Arc<Pool>>>;

/// The transaction scope shared by a session and its handles
#[derive(Default)]
pub(crate) struct ScopeCell {
    current: RwLock<Option<Arc<TransactionBranch>>>,
}

impl ScopeCell {
    pub(crate) fn current(&self) -> Option<Arc<TransactionBranch>> {
        self.current.read().clone()
    }

    fn set(&self, branch: Arc<TransactionBranch>) {
        *self.current.write() = Some(branch);
    }

    fn take(&self) -> Option<Arc<TransactionBranch>> {
        self.current.write().take()
    }
}

/// A caller's unit of work: acquires handles and demarcates transactions
pub struct Session {
    pools: Arc<PoolTable>,
    tm: Arc<TransactionManager>,
    scope: Arc<ScopeCell>,
    handles: Mutex<Vec<Weak<HandleInner>>>,
}

impl Session {
    pub(crate) fn new(pools: Arc<PoolTable>, tm: Arc<TransactionManager>) -> Self {
        Self {
            pools,
            tm,
            scope: Arc::new(ScopeCell::default()),
            handles: Mutex::new(Vec::new()),
        }
    }

    /// Acquire a handle from the named data source.
    ///
    /// Inside a transaction scope a shareable request may share a connection
    /// another handle of this session already uses.
    #[tracing::instrument(skip(self, request))]
    pub async fn acquire(
        &self,
        factory: &str,
        request: ConnectionRequest,
    ) -> Result<ConnectionHandle> {
        let pool = self
            .pools
            .read()
            .get(factory)
            .cloned()
            .ok_or_else(|| XaPoolError::NotFound(format!("data source '{}'", factory)))?;
        let handle = ConnectionHandle::new(
            pool,
            Arc::clone(&self.tm),
            Arc::clone(&self.scope),
            request,
        );
        handle.associate().await?;

        let mut handles = self.handles.lock();
        handles.retain(|h| h.strong_count() > 0);
        handles.push(handle.downgrade());
        Ok(handle)
    }

    /// Begin a global transaction with the default timeout
    pub async fn begin(&self) -> Result<Arc<TransactionBranch>> {
        self.ensure_no_scope()?;
        self.dissociate_all().await;
        let branch = self.tm.begin(None);
        self.scope.set(Arc::clone(&branch));
        Ok(branch)
    }

    /// Begin a global transaction that times out after `timeout`
    pub async fn begin_with_timeout(&self, timeout: Duration) -> Result<Arc<TransactionBranch>> {
        self.ensure_no_scope()?;
        self.dissociate_all().await;
        let branch = self.tm.begin(Some(timeout));
        self.scope.set(Arc::clone(&branch));
        Ok(branch)
    }

    /// Begin a local transaction scope
    pub async fn begin_local(&self) -> Result<Arc<TransactionBranch>> {
        self.ensure_no_scope()?;
        self.dissociate_all().await;
        let branch = self.tm.begin_local();
        self.scope.set(Arc::clone(&branch));
        Ok(branch)
    }

    pub async fn commit(&self) -> Result<()> {
        let branch = self.end_scope().await?;
        let result = self.tm.commit(&branch).await;
        self.clear_scope(&branch).await;
        result
    }

    pub async fn rollback(&self) -> Result<()> {
        let branch = self.end_scope().await?;
        let result = self.tm.rollback(&branch).await;
        self.clear_scope(&branch).await;
        result
    }

    /// The transaction scope currently active in this session
    pub fn current_transaction(&self) -> Option<Arc<TransactionBranch>> {
        self.scope.current()
    }

    pub fn in_transaction(&self) -> bool {
        self.scope.current().is_some()
    }

    fn ensure_no_scope(&self) -> Result<()> {
        match self.scope.current() {
            Some(branch) => Err(XaPoolError::InvalidState(format!(
                "transaction {} is already active in this session",
                branch.id()
            ))),
            None => Ok(()),
        }
    }

    async fn end_scope(&self) -> Result<Arc<TransactionBranch>> {
        let branch = self
            .scope
            .take()
            .ok_or_else(|| XaPoolError::InvalidState("no transaction is active".to_string()))?;
        self.dissociate_all().await;
        Ok(branch)
    }

    async fn dissociate_all(&self) {
        let handles: Vec<ConnectionHandle> = self
            .handles
            .lock()
            .iter()
            .filter_map(ConnectionHandle::upgrade)
            .filter(|handle| handle.is_shareable())
            .collect();
        for handle in handles {
            handle.dissociate().await;
        }
    }

    async fn clear_scope(&self, branch: &TransactionBranch) {
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in pools {
            pool.clear_scope(branch.id()).await;
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        let Some(branch) = self.scope.take() else {
            return;
        };
        tracing::warn!(gid = %branch.id(), "session dropped with an active transaction, rolling back");
        let tm = Arc::clone(&self.tm);
        if let Ok(runtime) = tokio::runtime::Handle::try_current() {
            runtime.spawn(async move {
                if let Err(e) = tm.rollback(&branch).await {
                    tracing::warn!(error = %e, "rollback of abandoned transaction failed");
                }
            });
        }
    }
}
