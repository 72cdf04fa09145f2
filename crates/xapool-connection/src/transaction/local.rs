//! One-phase resource over a connection's local transaction

use std::sync::Arc;

use async_trait::async_trait;
use xapool_core::{ResourceKind, Result, Vote, XaErrorCode, XaPoolError, XaResource, Xid};

use crate::pool::ManagedConnection;

/// Adapts a managed connection without an XA resource to the resource protocol.
///
/// Starting the branch turns autocommit off; completion commits or rolls back
/// the local transaction and restores autocommit. It cannot prepare, so it can
/// only be the single participant or the last participant of a branch.
pub struct LocalTransactionResource {
    mc: Arc<ManagedConnection>,
    name: String,
}

impl LocalTransactionResource {
    pub fn new(mc: Arc<ManagedConnection>) -> Self {
        let name = format!("{}:local", mc.factory());
        Self { mc, name }
    }
}

#[async_trait]
impl XaResource for LocalTransactionResource {
    fn resource_manager(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        ResourceKind::OnePhaseOnly
    }

    async fn start(&self, _xid: &Xid) -> Result<()> {
        self.mc.set_auto_commit(false).await
    }

    async fn end(&self, _xid: &Xid) -> Result<()> {
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        Err(XaPoolError::xa(
            XaErrorCode::Protocol,
            format!("{} cannot prepare {}", self.name, xid),
        ))
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        if !one_phase {
            return Err(XaPoolError::xa(
                XaErrorCode::Protocol,
                format!("{} can only commit {} in one phase", self.name, xid),
            ));
        }
        self.mc.commit_local().await?;
        self.mc.set_auto_commit(true).await
    }

    async fn rollback(&self, _xid: &Xid) -> Result<()> {
        self.mc.rollback_local().await?;
        self.mc.set_auto_commit(true).await
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        Ok(Vec::new())
    }
}
