//! Driver-level connection traits
//!
//! A driver supplies a [`PhysicalConnectionFactory`] per data source. The pool
//! owns the connections it produces and never lets application code see them
//! directly.

use crate::{Credentials, IsolationLevel, ResourceKind, Result, Vote, Xid};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

/// A raw connection to the backing engine
#[async_trait]
pub trait PhysicalConnection: Send + Sync {
    /// Get the driver name (e.g., "postgresql", "mock")
    fn driver_name(&self) -> &str;

    /// Execute a statement, bounded by the given query timeout.
    ///
    /// Returns the number of rows affected. Drivers report an unusable
    /// connection with `XaPoolError::ConnectionLost`.
    async fn execute(&self, sql: &str, timeout: Option<Duration>) -> Result<u64>;

    /// Lightweight liveness probe
    async fn ping(&self) -> Result<()>;

    async fn set_isolation(&self, level: IsolationLevel) -> Result<()>;

    async fn set_read_only(&self, read_only: bool) -> Result<()>;

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()>;

    async fn set_client_info(&self, _key: &str, _value: &str) -> Result<()> {
        Ok(())
    }

    /// Commit the current local transaction
    async fn commit(&self) -> Result<()>;

    /// Roll back the current local transaction
    async fn rollback(&self) -> Result<()>;

    /// The two-phase resource of this connection, if the driver is XA capable
    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        None
    }

    /// Abort the connection without a graceful close
    fn abort(&self) {}

    /// Whether the connection was aborted with [`PhysicalConnection::abort`]
    fn is_aborted(&self) -> bool {
        false
    }

    /// Close the connection
    async fn close(&self) -> Result<()>;

    /// Check if the connection is closed
    fn is_closed(&self) -> bool;
}

/// Opens physical connections for one data source
#[async_trait]
pub trait PhysicalConnectionFactory: Send + Sync + 'static {
    /// Open a new connection, using the given credentials instead of the
    /// data source defaults when provided
    async fn connect(&self, credentials: Option<&Credentials>)
    -> Result<Arc<dyn PhysicalConnection>>;
}

#[async_trait]
impl<T: PhysicalConnectionFactory> PhysicalConnectionFactory for Arc<T> {
    async fn connect(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn PhysicalConnection>> {
        (**self).connect(credentials).await
    }
}

/// The transactional resource a resource manager exposes to a transaction coordinator
#[async_trait]
pub trait XaResource: Send + Sync {
    /// Name of the resource manager, stable across restarts
    fn resource_manager(&self) -> &str;

    /// Commit protocol this resource supports
    fn kind(&self) -> ResourceKind {
        ResourceKind::TwoPhase
    }

    /// Associate subsequent work with the branch
    async fn start(&self, xid: &Xid) -> Result<()>;

    /// Dissociate work from the branch
    async fn end(&self, xid: &Xid) -> Result<()>;

    async fn prepare(&self, xid: &Xid) -> Result<Vote>;

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()>;

    async fn rollback(&self, xid: &Xid) -> Result<()>;

    /// Branches this resource manager holds prepared but unresolved
    async fn recover(&self) -> Result<Vec<Xid>>;

    /// Discard knowledge of a heuristically completed branch
    async fn forget(&self, _xid: &Xid) -> Result<()> {
        Ok(())
    }
}
