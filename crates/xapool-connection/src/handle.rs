//! Caller-visible connection handles and their statements

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::Mutex;
use uuid::Uuid;
use xapool_core::{
    ConnectionRequest, ConnectionState, IsolationLevel, ResolvedRequest, Result, XaPoolError,
};

use crate::pool::{ManagedConnection, McKey, Pool};
use crate::session::ScopeCell;
use crate::sharing::SharingCoordinator;
use crate::timeout::TimeoutSynchronizer;
use crate::transaction::{TransactionBranch, TransactionManager};

/// A handle's current association
struct Bound {
    key: McKey,
    mc: Arc<ManagedConnection>,
    branch: Option<Arc<TransactionBranch>>,
}

pub(crate) struct HandleInner {
    id: Uuid,
    pool: Arc<Pool>,
    tm: Arc<TransactionManager>,
    scope: Arc<ScopeCell>,
    request: ConnectionRequest,
    resolved: ResolvedRequest,
    /// Serializes association changes and use of the managed connection
    binding: tokio::sync::Mutex<Option<McKey>>,
    statements: Mutex<Vec<Weak<StatementInner>>>,
    closed: AtomicBool,
}

impl HandleInner {
    /// Resolve the managed connection, associating and enlisting on first use
    async fn bind(&self, binding: &mut Option<McKey>, enlist: bool) -> Result<Bound> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(XaPoolError::InvalidState(format!(
                "handle {} is closed",
                self.id
            )));
        }
        let branch = self.scope.current();
        if let Some(branch) = &branch {
            branch.check_usable()?;
        }

        let key = match *binding {
            Some(key) => key,
            None => {
                let key = self.associate(branch.as_deref()).await?;
                *binding = Some(key);
                key
            }
        };
        let Some(mc) = self.pool.get(key) else {
            *binding = None;
            self.close_statements();
            return Err(self
                .pool
                .bad_connection("connection was destroyed after a connection failure"));
        };

        if enlist && let Some(branch) = &branch {
            self.tm.enlist(branch, &self.pool, key, &mc).await?;
        }
        Ok(Bound { key, mc, branch })
    }

    async fn associate(&self, branch: Option<&TransactionBranch>) -> Result<McKey> {
        let scope = branch.map(TransactionBranch::id);
        if let Some(scope) = scope
            && self.request.is_shareable()
        {
            let coordinator = SharingCoordinator::new(self.pool.config().connection_sharing());
            let candidates = self.pool.candidates(scope);
            if let Some(key) = coordinator.select(&self.resolved, &candidates)
                && self.pool.bind_shared(key, scope)
            {
                tracing::debug!(handle_id = %self.id, factory = %self.pool.name(), "sharing connection within transaction scope");
                return Ok(key);
            }
        }
        self.pool
            .acquire_for(&self.resolved, self.request.is_shareable(), scope)
            .await
    }

    /// Turn a failure into the caller's error, discarding a broken connection
    async fn failed(
        &self,
        binding: &mut Option<McKey>,
        bound: &Bound,
        error: XaPoolError,
    ) -> XaPoolError {
        if !error.is_connection_error() {
            return error;
        }
        tracing::warn!(handle_id = %self.id, connection_id = %bound.mc.id(), error = %error, "connection failed during use");
        *binding = None;
        self.close_statements();
        if let Some(branch) = &bound.branch
            && !bound.mc.branch_state().is_free()
        {
            branch.mark_rollback_only(format!("connection failure: {}", error));
        }
        self.pool
            .connection_error_occurred(bound.key, bound.mc.is_aborted())
            .await;
        match error {
            e @ XaPoolError::BadConnection { .. } => e,
            other => self.pool.bad_connection(other.to_string()),
        }
    }

    async fn dissociate(&self) {
        let mut binding = self.binding.lock().await;
        if let Some(key) = binding.take() {
            self.close_statements();
            self.pool.detach(key).await;
        }
    }

    fn close_statements(&self) {
        for statement in self.statements.lock().drain(..) {
            if let Some(statement) = statement.upgrade() {
                statement.closed.store(true, Ordering::SeqCst);
            }
        }
    }
}

impl Drop for HandleInner {
    fn drop(&mut self) {
        let Some(key) = self.binding.get_mut().take() else {
            return;
        };
        let pool = Arc::clone(&self.pool);
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { pool.detach(key).await });
            }
            Err(_) => {
                tracing::warn!(handle_id = %self.id, "handle dropped outside a runtime, connection not returned to the pool");
            }
        }
    }
}

/// A proxy for a pooled connection.
///
/// The handle may be dissociated from its managed connection at transaction
/// scope boundaries and transparently re-associated on its next use.
#[derive(Clone)]
pub struct ConnectionHandle {
    inner: Arc<HandleInner>,
}

impl ConnectionHandle {
    pub(crate) fn new(
        pool: Arc<Pool>,
        tm: Arc<TransactionManager>,
        scope: Arc<ScopeCell>,
        request: ConnectionRequest,
    ) -> Self {
        let resolved = request.resolve(pool.config().isolation_level());
        Self {
            inner: Arc::new(HandleInner {
                id: Uuid::new_v4(),
                pool,
                tm,
                scope,
                request,
                resolved,
                binding: tokio::sync::Mutex::new(None),
                statements: Mutex::new(Vec::new()),
                closed: AtomicBool::new(false),
            }),
        }
    }

    pub(crate) fn downgrade(&self) -> Weak<HandleInner> {
        Arc::downgrade(&self.inner)
    }

    pub(crate) fn upgrade(inner: &Weak<HandleInner>) -> Option<Self> {
        inner.upgrade().map(|inner| Self { inner })
    }

    pub fn id(&self) -> Uuid {
        self.inner.id
    }

    /// Name of the data source the handle draws from
    pub fn factory(&self) -> &str {
        self.inner.pool.name()
    }

    pub fn request(&self) -> &ConnectionRequest {
        &self.inner.request
    }

    pub fn is_shareable(&self) -> bool {
        self.inner.request.is_shareable()
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    async fn run<T, F, Fut>(&self, enlist: bool, op: F) -> Result<T>
    where
        F: FnOnce(Arc<ManagedConnection>, Option<Arc<TransactionBranch>>) -> Fut,
        Fut: Future<Output = Result<T>>,
    {
        let mut binding = self.inner.binding.lock().await;
        let bound = self.inner.bind(&mut binding, enlist).await?;
        match op(Arc::clone(&bound.mc), bound.branch.clone()).await {
            Ok(value) => Ok(value),
            Err(e) => Err(self.inner.failed(&mut binding, &bound, e).await),
        }
    }

    /// Associate with a managed connection now rather than at first use
    pub(crate) async fn associate(&self) -> Result<()> {
        self.run(false, |_, _| async { Ok(()) }).await
    }

    /// Execute a statement with the data source's query timeout
    pub async fn execute(&self, sql: &str) -> Result<u64> {
        self.execute_with(sql, None).await
    }

    /// Execute a statement with an explicit timeout, overriding transaction sync
    pub async fn execute_with_timeout(&self, sql: &str, timeout: Duration) -> Result<u64> {
        self.execute_with(sql, Some(timeout)).await
    }

    async fn execute_with(&self, sql: &str, explicit: Option<Duration>) -> Result<u64> {
        let config = self.inner.pool.config();
        let sync = TimeoutSynchronizer::new(config.sync_query_timeout_with_transaction_timeout());
        let default = config.query_timeout();
        self.run(true, |mc, branch| async move {
            let timeout = sync.for_statement(explicit, default, branch.as_deref());
            mc.execute(sql, timeout).await
        })
        .await
    }

    /// Create a statement bound to this handle; it closes when the handle dissociates
    pub fn prepare(&self, sql: impl Into<String>) -> Result<Statement> {
        if self.is_closed() {
            return Err(XaPoolError::InvalidState(format!(
                "handle {} is closed",
                self.inner.id
            )));
        }
        let statement = Arc::new(StatementInner {
            sql: sql.into(),
            query_timeout: Mutex::new(None),
            closed: AtomicBool::new(false),
        });
        let mut statements = self.inner.statements.lock();
        statements.retain(|s| s.strong_count() > 0);
        statements.push(Arc::downgrade(&statement));
        Ok(Statement {
            handle: self.clone(),
            inner: statement,
        })
    }

    pub async fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.run(false, |mc, _| async move { mc.set_isolation(level).await })
            .await
    }

    pub async fn set_read_only(&self, read_only: bool) -> Result<()> {
        self.run(false, |mc, _| async move { mc.set_read_only(read_only).await })
            .await
    }

    /// Switch autocommit; not allowed while enlisted in a transaction
    pub async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.run(false, |mc, _| async move {
            ensure_unenlisted(&mc, "change autocommit")?;
            mc.set_auto_commit(auto_commit).await
        })
        .await
    }

    /// Commit the connection's local transaction
    pub async fn commit(&self) -> Result<()> {
        self.run(false, |mc, _| async move {
            ensure_unenlisted(&mc, "commit")?;
            mc.commit_local().await
        })
        .await
    }

    /// Roll back the connection's local transaction
    pub async fn rollback(&self) -> Result<()> {
        self.run(false, |mc, _| async move {
            ensure_unenlisted(&mc, "roll back")?;
            mc.rollback_local().await
        })
        .await
    }

    /// Live state of the associated managed connection
    pub async fn state(&self) -> Result<ConnectionState> {
        self.run(false, |mc, _| async move { Ok(mc.state()) }).await
    }

    /// Id of the managed connection currently associated, if any
    pub async fn managed_connection_id(&self) -> Option<Uuid> {
        let binding = self.inner.binding.lock().await;
        binding
            .and_then(|key| self.inner.pool.get(key))
            .map(|mc| mc.id())
    }

    pub async fn is_associated(&self) -> bool {
        self.inner.binding.lock().await.is_some()
    }

    /// Release the managed connection; the next use associates again
    pub async fn dissociate(&self) {
        self.inner.dissociate().await
    }

    /// Close the handle, returning its connection when nothing else uses it
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.inner.dissociate().await;
    }
}

impl std::fmt::Debug for ConnectionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConnectionHandle")
            .field("id", &self.inner.id)
            .field("factory", &self.inner.pool.name())
            .field("closed", &self.is_closed())
            .finish()
    }
}

fn ensure_unenlisted(mc: &ManagedConnection, action: &str) -> Result<()> {
    if mc.branch_state().is_free() {
        Ok(())
    } else {
        Err(XaPoolError::InvalidState(format!(
            "cannot {} while the connection is enlisted in a transaction",
            action
        )))
    }
}

pub(crate) struct StatementInner {
    sql: String,
    query_timeout: Mutex<Option<Duration>>,
    closed: AtomicBool,
}

/// A statement created from a [`ConnectionHandle`]
pub struct Statement {
    handle: ConnectionHandle,
    inner: Arc<StatementInner>,
}

impl Statement {
    pub fn sql(&self) -> &str {
        &self.inner.sql
    }

    /// Explicit timeout for this statement, overriding the data source default
    pub fn set_query_timeout(&self, timeout: Option<Duration>) {
        *self.inner.query_timeout.lock() = timeout;
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        *self.inner.query_timeout.lock()
    }

    pub async fn execute(&self) -> Result<u64> {
        if self.is_closed() {
            return Err(XaPoolError::InvalidState("statement is closed".to_string()));
        }
        let timeout = self.query_timeout();
        self.handle.execute_with(&self.inner.sql, timeout).await
    }

    pub fn close(&self) {
        self.inner.closed.store(true, Ordering::SeqCst);
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }
}
