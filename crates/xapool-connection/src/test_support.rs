//! In-memory driver doubles shared by the unit tests

use std::collections::BTreeSet;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use xapool_core::{
    Credentials, IsolationLevel, PhysicalConnection, PhysicalConnectionFactory, ResourceKind,
    Result, Vote, XaErrorCode, XaPoolError, XaResource, Xid,
};

/// One XA call observed by a mock resource manager
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum XaCall {
    Start,
    End,
    Prepare,
    Commit { one_phase: bool },
    Rollback,
}

/// A resource manager shared by every connection a factory opens
pub struct MockResourceManager {
    name: String,
    kind: ResourceKind,
    pub calls: Mutex<Vec<XaCall>>,
    pub prepared: Mutex<BTreeSet<Xid>>,
    pub committed: Mutex<Vec<Xid>>,
    pub vote_read_only: AtomicBool,
    pub fail_prepare: AtomicBool,
}

impl MockResourceManager {
    pub fn new(name: &str) -> Arc<Self> {
        Self::with_kind(name, ResourceKind::TwoPhase)
    }

    pub fn with_kind(name: &str, kind: ResourceKind) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            kind,
            calls: Mutex::new(Vec::new()),
            prepared: Mutex::new(BTreeSet::new()),
            committed: Mutex::new(Vec::new()),
            vote_read_only: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
        })
    }

    pub fn calls(&self) -> Vec<XaCall> {
        self.calls.lock().clone()
    }

    fn record(&self, call: XaCall) {
        self.calls.lock().push(call);
    }
}

#[async_trait]
impl XaResource for MockResourceManager {
    fn resource_manager(&self) -> &str {
        &self.name
    }

    fn kind(&self) -> ResourceKind {
        self.kind
    }

    async fn start(&self, _xid: &Xid) -> Result<()> {
        self.record(XaCall::Start);
        Ok(())
    }

    async fn end(&self, _xid: &Xid) -> Result<()> {
        self.record(XaCall::End);
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.record(XaCall::Prepare);
        if self.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaPoolError::xa(XaErrorCode::RolledBack, "prepare refused"));
        }
        if self.vote_read_only.load(Ordering::SeqCst) {
            return Ok(Vote::ReadOnly);
        }
        self.prepared.lock().insert(*xid);
        Ok(Vote::Ok)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.record(XaCall::Commit { one_phase });
        if !one_phase && !self.prepared.lock().remove(xid) {
            return Err(XaPoolError::xa(XaErrorCode::UnknownXid, "not prepared"));
        }
        self.committed.lock().push(*xid);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.record(XaCall::Rollback);
        self.prepared.lock().remove(xid);
        Ok(())
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        Ok(self.prepared.lock().iter().copied().collect())
    }
}

/// Mock physical connection with failure toggles and call counters
pub struct MockConnection {
    pub closed: AtomicBool,
    pub aborted: AtomicBool,
    pub broken: AtomicBool,
    pub ping_delay: Mutex<Option<Duration>>,
    pub rollback_delay: Mutex<Option<Duration>>,
    pub executed: AtomicUsize,
    pub commits: AtomicUsize,
    pub rollbacks: AtomicUsize,
    pub isolation: Mutex<Option<IsolationLevel>>,
    rm: Option<Arc<MockResourceManager>>,
}

impl MockConnection {
    pub fn new(rm: Option<Arc<MockResourceManager>>) -> Self {
        Self {
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            broken: AtomicBool::new(false),
            ping_delay: Mutex::new(None),
            rollback_delay: Mutex::new(None),
            executed: AtomicUsize::new(0),
            commits: AtomicUsize::new(0),
            rollbacks: AtomicUsize::new(0),
            isolation: Mutex::new(None),
            rm,
        }
    }

    fn check(&self) -> Result<()> {
        if self.broken.load(Ordering::SeqCst) || self.closed.load(Ordering::SeqCst) {
            Err(XaPoolError::ConnectionLost("socket closed".into()))
        } else {
            Ok(())
        }
    }
}

#[async_trait]
impl PhysicalConnection for MockConnection {
    fn driver_name(&self) -> &str {
        "mock"
    }

    async fn execute(&self, _sql: &str, _timeout: Option<Duration>) -> Result<u64> {
        self.check()?;
        self.executed.fetch_add(1, Ordering::SeqCst);
        Ok(1)
    }

    async fn ping(&self) -> Result<()> {
        let delay = *self.ping_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()
    }

    async fn set_isolation(&self, level: IsolationLevel) -> Result<()> {
        self.check()?;
        *self.isolation.lock() = Some(level);
        Ok(())
    }

    async fn set_read_only(&self, _read_only: bool) -> Result<()> {
        self.check()
    }

    async fn set_auto_commit(&self, _auto_commit: bool) -> Result<()> {
        self.check()
    }

    async fn commit(&self) -> Result<()> {
        self.check()?;
        self.commits.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        let delay = *self.rollback_delay.lock();
        if let Some(delay) = delay {
            tokio::time::sleep(delay).await;
        }
        self.check()?;
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        self.rm.clone().map(|rm| rm as Arc<dyn XaResource>)
    }

    fn abort(&self) {
        self.aborted.store(true, Ordering::SeqCst);
        self.broken.store(true, Ordering::SeqCst);
    }

    fn is_aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        self.closed.store(true, Ordering::SeqCst);
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }
}

/// Factory that remembers every connection it opened
pub struct MockFactory {
    pub created: AtomicUsize,
    pub fail_connect: AtomicBool,
    pub connections: Mutex<Vec<Arc<MockConnection>>>,
    pub credentials: Mutex<Vec<Option<Credentials>>>,
    rm: Option<Arc<MockResourceManager>>,
}

impl MockFactory {
    pub fn new() -> Arc<Self> {
        Self::build(None)
    }

    pub fn with_rm(rm: Arc<MockResourceManager>) -> Arc<Self> {
        Self::build(Some(rm))
    }

    fn build(rm: Option<Arc<MockResourceManager>>) -> Arc<Self> {
        Arc::new(Self {
            created: AtomicUsize::new(0),
            fail_connect: AtomicBool::new(false),
            connections: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
            rm,
        })
    }

    pub fn created(&self) -> usize {
        self.created.load(Ordering::SeqCst)
    }

    pub fn closed(&self) -> usize {
        self.connections
            .lock()
            .iter()
            .filter(|c| c.closed.load(Ordering::SeqCst))
            .count()
    }

    pub fn connection(&self, index: usize) -> Arc<MockConnection> {
        Arc::clone(&self.connections.lock()[index])
    }
}

#[async_trait]
impl PhysicalConnectionFactory for MockFactory {
    async fn connect(&self, credentials: Option<&Credentials>) -> Result<Arc<dyn PhysicalConnection>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(XaPoolError::ConnectionLost("connection refused".into()));
        }
        self.created.fetch_add(1, Ordering::SeqCst);
        self.credentials.lock().push(credentials.cloned());
        let conn = Arc::new(MockConnection::new(self.rm.clone()));
        self.connections.lock().push(Arc::clone(&conn));
        Ok(conn)
    }
}
