//! Fault injection at the XA resource seam

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use parking_lot::Mutex;
use xapool_core::{ResourceKind, Result, Vote, XaErrorCode, XaPoolError, XaResource, Xid};

/// Wraps every resource the transaction manager enlists or recovers
pub trait ResourceInterceptor: Send + Sync {
    fn intercept(self: Arc<Self>, resource: Arc<dyn XaResource>) -> Arc<dyn XaResource>;
}

/// XA call a fault can be attached to
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FaultPoint {
    Prepare,
    Commit,
    Rollback,
}

#[derive(Debug)]
struct Fault {
    resource_manager: String,
    point: FaultPoint,
    code: XaErrorCode,
    remaining: usize,
}

/// Interceptor that fails scripted XA calls before they reach the resource manager
#[derive(Debug, Default)]
pub struct FaultInjector {
    faults: Mutex<Vec<Fault>>,
    injected: AtomicUsize,
}

impl FaultInjector {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Fail the next `times` calls of `point` on the named resource manager with `code`
    pub fn fail(&self, resource_manager: impl Into<String>, point: FaultPoint, code: XaErrorCode, times: usize) {
        self.faults.lock().push(Fault {
            resource_manager: resource_manager.into(),
            point,
            code,
            remaining: times,
        });
    }

    pub fn clear(&self) {
        self.faults.lock().clear();
    }

    /// Number of failures injected so far
    pub fn injected(&self) -> usize {
        self.injected.load(Ordering::SeqCst)
    }

    fn trip(&self, resource_manager: &str, point: FaultPoint, xid: &Xid) -> Result<()> {
        let mut faults = self.faults.lock();
        let fault = faults.iter_mut().find(|fault| {
            fault.remaining > 0 && fault.point == point && fault.resource_manager == resource_manager
        });
        match fault {
            Some(fault) => {
                fault.remaining -= 1;
                self.injected.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(rm = %resource_manager, point = ?point, xid = %xid, "injecting fault");
                Err(XaPoolError::xa(
                    fault.code,
                    format!("injected {:?} failure on {}", point, resource_manager),
                ))
            }
            None => Ok(()),
        }
    }
}

impl ResourceInterceptor for FaultInjector {
    fn intercept(self: Arc<Self>, resource: Arc<dyn XaResource>) -> Arc<dyn XaResource> {
        Arc::new(FaultyResource {
            inner: resource,
            injector: self,
        })
    }
}

struct FaultyResource {
    inner: Arc<dyn XaResource>,
    injector: Arc<FaultInjector>,
}

#[async_trait]
impl XaResource for FaultyResource {
    fn resource_manager(&self) -> &str {
        self.inner.resource_manager()
    }

    fn kind(&self) -> ResourceKind {
        self.inner.kind()
    }

    async fn start(&self, xid: &Xid) -> Result<()> {
        self.inner.start(xid).await
    }

    async fn end(&self, xid: &Xid) -> Result<()> {
        self.inner.end(xid).await
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.injector
            .trip(self.resource_manager(), FaultPoint::Prepare, xid)?;
        self.inner.prepare(xid).await
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.injector
            .trip(self.resource_manager(), FaultPoint::Commit, xid)?;
        self.inner.commit(xid, one_phase).await
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.injector
            .trip(self.resource_manager(), FaultPoint::Rollback, xid)?;
        self.inner.rollback(xid).await
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        self.inner.recover().await
    }

    async fn forget(&self, xid: &Xid) -> Result<()> {
        self.inner.forget(xid).await
    }
}
