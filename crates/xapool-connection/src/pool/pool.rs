//! Connection pool implementation

use std::collections::VecDeque;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use slotmap::SlotMap;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tokio::time::Instant;
use uuid::Uuid;
use xapool_core::{
    ConnectionFactoryConfig, ConnectionRequest, PhysicalConnectionFactory, PurgePolicy,
    ResolvedRequest, Result, XaPoolError,
};

use super::managed::ManagedConnection;
use super::stats::PoolStats;
use crate::sharing::ShareCandidate;
use crate::validation::ValidationService;

slotmap::new_key_type! {
    /// Key of a managed connection in its pool's arena
    pub struct McKey;
}

/// Probe bound used for flagged connections when validation is not configured
const PRETEST_TIMEOUT: Duration = Duration::from_secs(5);

struct InUse {
    /// One permit per in-use connection bounds the pool size
    permit: OwnedSemaphorePermit,
    handles: usize,
    original: ResolvedRequest,
    shareable: bool,
    /// Transaction scope the connection may be shared within
    scope: Option<Uuid>,
}

enum SlotStatus {
    Free { since: Instant },
    /// Taken off the free list by an acquisition that is still validating it
    Reserved,
    InUse(InUse),
    /// Being cleaned up or destroyed
    Releasing,
}

struct Slot {
    mc: Arc<ManagedConnection>,
    status: SlotStatus,
    /// Purge generation the connection was created in
    generation: u64,
    /// Destroy instead of pooling on release
    stale: bool,
    /// Validate before the connection is next handed out
    pretest: bool,
}

#[derive(Default)]
struct PoolInner {
    slots: SlotMap<McKey, Slot>,
    free: VecDeque<McKey>,
    generation: u64,
}

/// A bounded pool of managed connections for one data source.
///
/// Acquisitions beyond `max_pool_size` queue on a fair semaphore and fail with
/// [`XaPoolError::PoolExhausted`] once `connection_timeout` elapses. Handles
/// refer to connections by [`McKey`]; the pool owns the connections.
pub struct Pool {
    name: String,
    config: ConnectionFactoryConfig,
    factory: Arc<dyn PhysicalConnectionFactory>,
    validator: ValidationService,
    inner: Mutex<PoolInner>,
    permits: Arc<Semaphore>,
    waiting: AtomicUsize,
    maintaining: AtomicBool,
    closed: AtomicBool,
}

impl Pool {
    /// Create a new pool; no connections are opened until they are needed
    pub fn new(
        name: impl Into<String>,
        config: ConnectionFactoryConfig,
        factory: Arc<dyn PhysicalConnectionFactory>,
    ) -> Self {
        let permits = match config.max_pool_size() {
            0 => Semaphore::MAX_PERMITS,
            max => max,
        };
        Self {
            name: name.into(),
            config,
            factory,
            validator: ValidationService::new(),
            inner: Mutex::new(PoolInner::default()),
            permits: Arc::new(Semaphore::new(permits)),
            waiting: AtomicUsize::new(0),
            maintaining: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &ConnectionFactoryConfig {
        &self.config
    }

    pub fn validator(&self) -> &ValidationService {
        &self.validator
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    /// Acquire a connection for use outside any transaction scope.
    ///
    /// The connection is returned to the pool with [`Pool::release`].
    pub async fn acquire(&self, request: &ConnectionRequest) -> Result<McKey> {
        let resolved = request.resolve(self.config.isolation_level());
        self.acquire_for(&resolved, request.is_shareable(), None).await
    }

    /// Drop one handle reference to the connection, returning it to the pool
    /// when nothing else uses it
    pub async fn release(&self, key: McKey) {
        self.detach(key).await
    }

    /// Get a connection by key, if it is still owned by the pool
    pub fn get(&self, key: McKey) -> Option<Arc<ManagedConnection>> {
        self.inner.lock().slots.get(key).map(|slot| Arc::clone(&slot.mc))
    }

    #[tracing::instrument(skip(self, request), fields(factory = %self.name))]
    pub(crate) async fn acquire_for(
        &self,
        request: &ResolvedRequest,
        shareable: bool,
        scope: Option<Uuid>,
    ) -> Result<McKey> {
        self.ensure_open()?;
        let permit = self.acquire_permit().await?;

        loop {
            let (reservation, expired) = self.reserve_free();
            for mc in expired {
                tracing::debug!(connection_id = %mc.id(), "discarding aged or purged connection");
                mc.destroy().await;
            }
            let Some(mut reservation) = reservation else {
                break;
            };
            match self.revalidate(&reservation, request).await {
                Ok(()) => {
                    reservation.settled = true;
                    let key = reservation.key;
                    let mut inner = self.inner.lock();
                    let Some(slot) = inner.slots.get_mut(key) else {
                        return Err(self.bad_connection("connection was purged during validation"));
                    };
                    slot.status = SlotStatus::InUse(InUse {
                        permit,
                        handles: 1,
                        original: request.clone(),
                        shareable,
                        scope,
                    });
                    tracing::debug!(connection_id = %slot.mc.id(), "reusing pooled connection");
                    return Ok(key);
                }
                Err(reason) => {
                    tracing::debug!(connection_id = %reservation.mc.id(), reason = %reason, "pooled connection failed revalidation");
                    self.discard(&mut reservation).await;
                }
            }
        }

        let mc = self.open().await?;
        if let Err(e) = mc.apply_request(request).await {
            mc.destroy().await;
            return Err(e);
        }
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let generation = inner.generation;
        let key = inner.slots.insert(Slot {
            mc,
            status: SlotStatus::InUse(InUse {
                permit,
                handles: 1,
                original: request.clone(),
                shareable,
                scope,
            }),
            generation,
            stale: false,
            pretest: false,
        });
        Ok(key)
    }

    async fn acquire_permit(&self) -> Result<OwnedSemaphorePermit> {
        if let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() {
            return Ok(permit);
        }

        let _waiter = WaiterGuard::new(&self.waiting);
        tracing::debug!(factory = %self.name, "pool at capacity, queueing request");
        let acquire = Arc::clone(&self.permits).acquire_owned();
        let permit = match self.config.connection_timeout() {
            Some(timeout) => tokio::time::timeout(timeout, acquire).await.map_err(|_| {
                tracing::warn!(factory = %self.name, timeout = ?timeout, "connection pool exhausted");
                XaPoolError::PoolExhausted {
                    factory: self.name.clone(),
                    timeout,
                }
            })?,
            None => acquire.await,
        };
        permit.map_err(|_| self.closed_error())
    }

    /// Pop the first usable free connection, collecting expired ones on the way
    fn reserve_free(&self) -> (Option<Reservation<'_>>, Vec<Arc<ManagedConnection>>) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        let mut expired = Vec::new();

        while let Some(key) = inner.free.pop_front() {
            let Some(slot) = inner.slots.get_mut(key) else {
                continue;
            };
            // Aging takes priority over any validation
            if slot.stale || slot.generation != inner.generation || self.is_aged(&slot.mc) {
                if let Some(slot) = inner.slots.remove(key) {
                    expired.push(slot.mc);
                }
                continue;
            }
            slot.status = SlotStatus::Reserved;
            let reservation = Reservation {
                pool: self,
                key,
                mc: Arc::clone(&slot.mc),
                pretest: std::mem::take(&mut slot.pretest),
                settled: false,
            };
            return (Some(reservation), expired);
        }
        (None, expired)
    }

    async fn revalidate(
        &self,
        reservation: &Reservation<'_>,
        request: &ResolvedRequest,
    ) -> std::result::Result<(), String> {
        let validation = self.config.validation_timeout();
        if reservation.pretest || validation.is_some() {
            let timeout = validation.unwrap_or(PRETEST_TIMEOUT);
            self.validator
                .is_alive(&reservation.mc, timeout)
                .await
                .map_err(|e| e.to_string())?;
        }
        reservation
            .mc
            .apply_request(request)
            .await
            .map_err(|e| e.to_string())
    }

    fn unreserve(&self, key: McKey) {
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        if let Some(slot) = inner.slots.get_mut(key)
            && matches!(slot.status, SlotStatus::Reserved)
        {
            slot.status = SlotStatus::Free {
                since: Instant::now(),
            };
            slot.pretest = true;
            inner.free.push_front(key);
        }
    }

    async fn discard(&self, reservation: &mut Reservation<'_>) {
        reservation.settled = true;
        self.inner.lock().slots.remove(reservation.key);
        reservation.mc.destroy().await;
    }

    async fn open(&self) -> Result<Arc<ManagedConnection>> {
        let physical = self.factory.connect(None).await.map_err(|e| {
            tracing::error!(factory = %self.name, error = %e, "failed to open physical connection");
            if e.is_connection_error() {
                self.bad_connection(e.to_string())
            } else {
                e
            }
        })?;
        let mc = Arc::new(ManagedConnection::new(
            &self.name,
            physical,
            self.config.isolation_level(),
        ));
        tracing::debug!(factory = %self.name, connection_id = %mc.id(), "opened physical connection");
        Ok(mc)
    }

    /// Share an in-use connection with one more handle of the same scope
    pub(crate) fn bind_shared(&self, key: McKey, scope: Uuid) -> bool {
        let mut inner = self.inner.lock();
        match inner.slots.get_mut(key).map(|slot| &mut slot.status) {
            Some(SlotStatus::InUse(in_use)) if in_use.shareable && in_use.scope == Some(scope) => {
                in_use.handles += 1;
                true
            }
            _ => false,
        }
    }

    /// Shareable in-use connections tagged with the given scope
    pub(crate) fn candidates(&self, scope: Uuid) -> Vec<ShareCandidate> {
        let inner = self.inner.lock();
        inner
            .slots
            .iter()
            .filter_map(|(key, slot)| match &slot.status {
                SlotStatus::InUse(in_use) if in_use.shareable && in_use.scope == Some(scope) => {
                    Some(ShareCandidate {
                        key,
                        original: in_use.original.clone(),
                        state: slot.mc.state(),
                    })
                }
                _ => None,
            })
            .collect()
    }

    /// A handle stopped using the connection
    pub(crate) async fn detach(&self, key: McKey) {
        {
            let mut inner = self.inner.lock();
            if let Some(slot) = inner.slots.get_mut(key)
                && let SlotStatus::InUse(in_use) = &mut slot.status
            {
                in_use.handles = in_use.handles.saturating_sub(1);
            }
        }
        self.check_in(key).await;
    }

    /// The connection's transaction branch completed
    pub(crate) async fn delist(&self, key: McKey) {
        self.check_in(key).await;
    }

    /// Untag connections of a finished scope, releasing the ones nobody holds
    pub(crate) async fn clear_scope(&self, scope: Uuid) {
        let keys: Vec<McKey> = {
            let mut inner = self.inner.lock();
            inner
                .slots
                .iter_mut()
                .filter_map(|(key, slot)| match &mut slot.status {
                    SlotStatus::InUse(in_use) if in_use.scope == Some(scope) => {
                        in_use.scope = None;
                        Some(key)
                    }
                    _ => None,
                })
                .collect()
        };
        for key in keys {
            self.check_in(key).await;
        }
    }

    /// Return the connection to the free pool once it has no handles and no branch
    async fn check_in(&self, key: McKey) {
        let (mc, permit, mut destroy) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let generation = inner.generation;
            let Some(slot) = inner.slots.get_mut(key) else {
                return;
            };
            let releasable = matches!(&slot.status, SlotStatus::InUse(in_use) if in_use.handles == 0)
                && slot.mc.branch_state().is_free();
            if !releasable {
                return;
            }
            let SlotStatus::InUse(in_use) = std::mem::replace(&mut slot.status, SlotStatus::Releasing)
            else {
                return;
            };
            let destroy = !self.config.pooling_enabled()
                || self.is_closed()
                || slot.stale
                || slot.generation != generation
                || self.is_aged(&slot.mc);
            (Arc::clone(&slot.mc), in_use.permit, destroy)
        };
        let mut release = CheckIn {
            pool: self,
            key,
            mc: Arc::clone(&mc),
            settled: false,
        };

        if !destroy
            && let Err(e) = mc
                .cleanup(self.config.isolation_level(), self.config.cleanup_action())
                .await
        {
            tracing::warn!(factory = %self.name, connection_id = %mc.id(), error = %e, "cleanup failed, destroying connection");
            destroy = true;
        }

        if destroy {
            self.inner.lock().slots.remove(key);
            release.settled = true;
            tracing::debug!(factory = %self.name, connection_id = %mc.id(), "destroying released connection");
            mc.destroy().await;
        } else {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            if let Some(slot) = inner.slots.get_mut(key) {
                slot.status = SlotStatus::Free {
                    since: Instant::now(),
                };
                inner.free.push_back(key);
            }
            release.settled = true;
        }
        // The next waiter only wakes once the connection is back on the free list
        drop(permit);
    }

    /// Remove a slot whose release never finished and close its connection
    fn abandon_release(&self, key: McKey, mc: Arc<ManagedConnection>) {
        let removed = {
            let mut inner = self.inner.lock();
            let releasing = matches!(
                inner.slots.get(key).map(|slot| &slot.status),
                Some(SlotStatus::Releasing)
            );
            releasing && inner.slots.remove(key).is_some()
        };
        if !removed {
            return;
        }
        tracing::debug!(factory = %self.name, connection_id = %mc.id(), "release cancelled, destroying connection");
        match tokio::runtime::Handle::try_current() {
            Ok(runtime) => {
                runtime.spawn(async move { mc.destroy().await });
            }
            Err(_) => mc.physical().abort(),
        }
    }

    /// Discard a connection that failed, applying the purge policy to the rest
    #[tracing::instrument(skip(self), fields(factory = %self.name))]
    pub(crate) async fn connection_error_occurred(&self, key: McKey, aborted: bool) {
        let policy = if aborted {
            PurgePolicy::FailingConnectionOnly
        } else {
            self.config.purge_policy()
        };

        let doomed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut doomed = Vec::new();
            if let Some(slot) = inner.slots.remove(key) {
                inner.free.retain(|k| *k != key);
                doomed.push(slot.mc);
            }
            match policy {
                PurgePolicy::EntirePool => {
                    inner.generation += 1;
                    for k in inner.free.drain(..) {
                        if let Some(slot) = inner.slots.remove(k) {
                            doomed.push(slot.mc);
                        }
                    }
                }
                PurgePolicy::FailingConnectionOnly => {}
                PurgePolicy::ValidateAllConnections => {
                    for (_, slot) in inner.slots.iter_mut() {
                        slot.pretest = true;
                    }
                }
            }
            doomed
        };

        tracing::warn!(policy = ?policy, destroyed = doomed.len(), "connection error occurred");
        for mc in doomed {
            mc.destroy().await;
        }
    }

    /// One maintenance pass: age out, reap idle connections, refill to the minimum
    #[tracing::instrument(skip(self), fields(factory = %self.name))]
    pub async fn maintain(&self) {
        if self.maintaining.swap(true, Ordering::SeqCst) {
            tracing::debug!("maintenance already running, skipping");
            return;
        }
        let _running = MaintenanceGuard(&self.maintaining);

        let doomed = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            let mut doomed = Vec::new();

            if let Some(aged) = self.aged_limit() {
                let mut expired = Vec::new();
                for (key, slot) in inner.slots.iter_mut() {
                    if slot.mc.age() < aged {
                        continue;
                    }
                    match slot.status {
                        SlotStatus::Free { .. } => expired.push(key),
                        _ => slot.stale = true,
                    }
                }
                for key in expired {
                    inner.free.retain(|k| *k != key);
                    if let Some(slot) = inner.slots.remove(key) {
                        doomed.push(slot.mc);
                    }
                }
            }

            if let Some(idle) = self.config.max_idle_time() {
                let mut excess = inner.slots.len().saturating_sub(self.config.min_pool_size());
                let mut keep = VecDeque::with_capacity(inner.free.len());
                while let Some(key) = inner.free.pop_front() {
                    let idle_too_long = matches!(
                        inner.slots.get(key).map(|slot| &slot.status),
                        Some(SlotStatus::Free { since }) if since.elapsed() >= idle
                    );
                    if excess > 0
                        && idle_too_long
                        && let Some(slot) = inner.slots.remove(key)
                    {
                        doomed.push(slot.mc);
                        excess -= 1;
                    } else {
                        keep.push_back(key);
                    }
                }
                inner.free = keep;
            }
            doomed
        };

        if !doomed.is_empty() {
            tracing::debug!(removed = doomed.len(), "maintenance removed connections");
        }
        for mc in doomed {
            mc.destroy().await;
        }
        self.fill_to_min().await;
    }

    /// Open free connections up to `min_pool_size`, using spare capacity only
    pub async fn fill_to_min(&self) {
        if !self.config.pooling_enabled() {
            return;
        }
        loop {
            if self.is_closed() || self.waiting.load(Ordering::SeqCst) > 0 {
                return;
            }
            if self.inner.lock().slots.len() >= self.config.min_pool_size() {
                return;
            }
            let Ok(permit) = Arc::clone(&self.permits).try_acquire_owned() else {
                return;
            };
            match self.open().await {
                Ok(mc) => {
                    let mut guard = self.inner.lock();
                    let inner = &mut *guard;
                    let generation = inner.generation;
                    let key = inner.slots.insert(Slot {
                        mc,
                        status: SlotStatus::Free {
                            since: Instant::now(),
                        },
                        generation,
                        stale: false,
                        pretest: false,
                    });
                    inner.free.push_back(key);
                }
                Err(e) => {
                    tracing::warn!(factory = %self.name, error = %e, "could not refill pool to minimum size");
                    return;
                }
            }
            drop(permit);
        }
    }

    /// Get current pool statistics
    pub fn stats(&self) -> PoolStats {
        let inner = self.inner.lock();
        let size = inner.slots.len();
        let free = inner.free.len();
        PoolStats::new(
            size,
            free,
            size - free,
            self.waiting.load(Ordering::SeqCst),
        )
    }

    /// Close the pool: queued acquisitions fail, free connections are closed
    /// and connections still in use are destroyed when released
    #[tracing::instrument(skip(self), fields(factory = %self.name))]
    pub async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.permits.close();
        let doomed: Vec<_> = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner
                .free
                .drain(..)
                .filter_map(|key| inner.slots.remove(key))
                .map(|slot| slot.mc)
                .collect()
        };
        tracing::info!(closed = doomed.len(), "pool closed");
        for mc in doomed {
            mc.destroy().await;
        }
    }

    fn aged_limit(&self) -> Option<Duration> {
        self.config.aged_timeout().filter(|aged| !aged.is_zero())
    }

    fn is_aged(&self, mc: &ManagedConnection) -> bool {
        self.aged_limit().is_some_and(|aged| mc.age() >= aged)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            Err(self.closed_error())
        } else {
            Ok(())
        }
    }

    fn closed_error(&self) -> XaPoolError {
        XaPoolError::InvalidState(format!("pool '{}' is closed", self.name))
    }

    pub(crate) fn bad_connection(&self, reason: impl Into<String>) -> XaPoolError {
        XaPoolError::BadConnection {
            factory: self.name.clone(),
            reason: reason.into(),
        }
    }
}

impl std::fmt::Debug for Pool {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Pool")
            .field("name", &self.name)
            .field("stats", &self.stats())
            .finish()
    }
}

/// A free connection taken off the list while an acquisition validates it.
///
/// Goes back to the front of the free list if the acquisition is cancelled.
struct Reservation<'a> {
    pool: &'a Pool,
    key: McKey,
    mc: Arc<ManagedConnection>,
    pretest: bool,
    settled: bool,
}

impl Drop for Reservation<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.unreserve(self.key);
        }
    }
}

/// A connection on its way back to the pool.
///
/// If the release is cancelled before the slot is settled, the connection is
/// removed from the pool and destroyed.
struct CheckIn<'a> {
    pool: &'a Pool,
    key: McKey,
    mc: Arc<ManagedConnection>,
    settled: bool,
}

impl Drop for CheckIn<'_> {
    fn drop(&mut self) {
        if !self.settled {
            self.pool.abandon_release(self.key, Arc::clone(&self.mc));
        }
    }
}

struct WaiterGuard<'a>(&'a AtomicUsize);

impl<'a> WaiterGuard<'a> {
    fn new(counter: &'a AtomicUsize) -> Self {
        counter.fetch_add(1, Ordering::SeqCst);
        Self(counter)
    }
}

impl Drop for WaiterGuard<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

struct MaintenanceGuard<'a>(&'a AtomicBool);

impl Drop for MaintenanceGuard<'_> {
    fn drop(&mut self) {
        self.0.store(false, Ordering::SeqCst);
    }
}
