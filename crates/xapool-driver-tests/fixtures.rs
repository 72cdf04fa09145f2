//! Core test fixtures: an in-memory resource manager and registry builders.
//!
//! [`MemoryEngine`] stands in for a relational database. It keeps committed
//! key/value data, per-connection local transactions and per-xid branches,
//! and exposes a two-phase resource with `recover()`. Every engine can share
//! a [`Journal`] so tests can assert the global order of XA calls across
//! resource managers.
//!
//! Statements understood by the engine:
//!
//! - `SELECT 1` - no-op probe
//! - `PUT <key> <value>` / `DEL <key>` - writes, routed to the active branch,
//!   the local transaction or straight to committed data under autocommit
//! - `GET <key>` - returns 1 when the key is visible in committed data
//! - `SLEEP <ms>` - waits, failing when the statement timeout is shorter
//!
//! # Usage
//!
//! ```rust,ignore
//! use xapool_driver_tests::fixtures::{MemoryEngine, pool_config, registry_with};
//!
//! let orders = MemoryEngine::new("orders");
//! let registry = registry_with(TransactionConfig::new(), [(&orders, pool_config(4))])?;
//! let session = registry.session();
//! let conn = session.acquire("orders", ConnectionRequest::new()).await?;
//! conn.execute("PUT k v").await?;
//! assert_eq!(orders.get("k").as_deref(), Some("v"));
//! ```

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use xapool_connection::PoolRegistry;
use xapool_core::{
    ConnectionFactoryConfig, Credentials, IsolationLevel, PhysicalConnection,
    PhysicalConnectionFactory, Result, TransactionConfig, Vote, XaErrorCode, XaPoolError,
    XaResource, Xid,
};

/// Install a test subscriber honouring `RUST_LOG`; safe to call from every test
pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .with_test_writer()
        .try_init();
}

/// Ordered record of XA calls, shared between engines
#[derive(Debug, Clone, Default)]
pub struct Journal {
    events: Arc<Mutex<Vec<String>>>,
}

impl Journal {
    /// Create an empty journal
    pub fn new() -> Self {
        Self::default()
    }

    fn push(&self, engine: &str, event: &str) {
        self.events.lock().push(format!("{}:{}", engine, event));
    }

    /// All events recorded so far, as `engine:call`
    pub fn events(&self) -> Vec<String> {
        self.events.lock().clone()
    }

    /// Position of the first event equal to `event`
    pub fn position(&self, event: &str) -> Option<usize> {
        self.events.lock().iter().position(|e| e == event)
    }

    /// Whether any event ends with `:call`
    pub fn contains_call(&self, call: &str) -> bool {
        let suffix = format!(":{}", call);
        self.events.lock().iter().any(|e| e.ends_with(&suffix))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Write {
    Put(String, String),
    Delete(String),
}

/// In-memory database engine acting as one resource manager
pub struct MemoryEngine {
    name: String,
    xa: bool,
    journal: Journal,
    data: Mutex<BTreeMap<String, String>>,
    branches: Mutex<HashMap<Xid, Vec<Write>>>,
    prepared: Mutex<BTreeMap<Xid, Vec<Write>>>,
    down: AtomicBool,
    fail_prepare: AtomicBool,
    connects: AtomicUsize,
    open: AtomicUsize,
    timeouts: Mutex<Vec<Option<Duration>>>,
    credentials: Mutex<Vec<Option<Credentials>>>,
}

impl MemoryEngine {
    /// Engine with a two-phase resource and its own journal
    pub fn new(name: &str) -> Arc<Self> {
        Self::build(name, true, Journal::new())
    }

    /// Engine whose connections only support local transactions
    pub fn without_xa(name: &str) -> Arc<Self> {
        Self::build(name, false, Journal::new())
    }

    /// Engine recording into a shared journal
    pub fn with_journal(name: &str, journal: &Journal) -> Arc<Self> {
        Self::build(name, true, journal.clone())
    }

    fn build(name: &str, xa: bool, journal: Journal) -> Arc<Self> {
        Arc::new(Self {
            name: name.to_string(),
            xa,
            journal,
            data: Mutex::new(BTreeMap::new()),
            branches: Mutex::new(HashMap::new()),
            prepared: Mutex::new(BTreeMap::new()),
            down: AtomicBool::new(false),
            fail_prepare: AtomicBool::new(false),
            connects: AtomicUsize::new(0),
            open: AtomicUsize::new(0),
            timeouts: Mutex::new(Vec::new()),
            credentials: Mutex::new(Vec::new()),
        })
    }

    /// Resource manager name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Connection factory opening connections to this engine
    pub fn driver(self: &Arc<Self>) -> Arc<dyn PhysicalConnectionFactory> {
        Arc::new(MemoryDriver {
            engine: Arc::clone(self),
        })
    }

    /// Committed value of a key
    pub fn get(&self, key: &str) -> Option<String> {
        self.data.lock().get(key).cloned()
    }

    /// Number of committed keys
    pub fn len(&self) -> usize {
        self.data.lock().len()
    }

    /// Whether no key is committed
    pub fn is_empty(&self) -> bool {
        self.data.lock().is_empty()
    }

    /// Take the engine down: connects, statements, probes and XA calls fail
    pub fn set_down(&self, down: bool) {
        self.down.store(down, Ordering::SeqCst);
    }

    /// Make every prepare vote to roll back
    pub fn set_fail_prepare(&self, fail: bool) {
        self.fail_prepare.store(fail, Ordering::SeqCst);
    }

    /// Physical connections opened so far
    pub fn connects(&self) -> usize {
        self.connects.load(Ordering::SeqCst)
    }

    /// Physical connections currently open
    pub fn open_connections(&self) -> usize {
        self.open.load(Ordering::SeqCst)
    }

    /// Branches prepared and not yet completed
    pub fn prepared(&self) -> Vec<Xid> {
        self.prepared.lock().keys().copied().collect()
    }

    /// Leave a prepared branch behind, as a coordinator crash after prepare would
    pub fn seed_prepared(&self, xid: Xid, key: &str, value: &str) {
        self.prepared
            .lock()
            .insert(xid, vec![Write::Put(key.to_string(), value.to_string())]);
    }

    /// Timeout passed with the most recent statement
    pub fn last_timeout(&self) -> Option<Duration> {
        self.timeouts.lock().last().copied().flatten()
    }

    /// Timeouts passed with every statement so far
    pub fn statement_timeouts(&self) -> Vec<Option<Duration>> {
        self.timeouts.lock().clone()
    }

    /// Credentials each connect was made with
    pub fn credentials_seen(&self) -> Vec<Option<Credentials>> {
        self.credentials.lock().clone()
    }

    /// Shared journal of XA calls
    pub fn journal(&self) -> &Journal {
        &self.journal
    }

    fn check_up(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(XaPoolError::ConnectionLost(format!("{} is down", self.name)))
        } else {
            Ok(())
        }
    }

    fn check_rm(&self) -> Result<()> {
        if self.down.load(Ordering::SeqCst) {
            Err(XaPoolError::xa(
                XaErrorCode::ResourceFailed,
                format!("{} is down", self.name),
            ))
        } else {
            Ok(())
        }
    }

    fn apply(&self, writes: Vec<Write>) {
        let mut data = self.data.lock();
        for write in writes {
            match write {
                Write::Put(key, value) => {
                    data.insert(key, value);
                }
                Write::Delete(key) => {
                    data.remove(&key);
                }
            }
        }
    }
}

impl std::fmt::Debug for MemoryEngine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MemoryEngine")
            .field("name", &self.name)
            .field("xa", &self.xa)
            .field("keys", &self.len())
            .finish()
    }
}

struct MemoryDriver {
    engine: Arc<MemoryEngine>,
}

#[async_trait]
impl PhysicalConnectionFactory for MemoryDriver {
    async fn connect(
        &self,
        credentials: Option<&Credentials>,
    ) -> Result<Arc<dyn PhysicalConnection>> {
        self.engine.credentials.lock().push(credentials.cloned());
        self.engine.check_up()?;
        self.engine.connects.fetch_add(1, Ordering::SeqCst);
        self.engine.open.fetch_add(1, Ordering::SeqCst);
        Ok(Arc::new(MemoryConnection {
            engine: Arc::clone(&self.engine),
            session: Arc::new(SessionState::default()),
        }))
    }
}

/// Per-connection state the connection and its XA resource share
struct SessionState {
    closed: AtomicBool,
    aborted: AtomicBool,
    auto_commit: AtomicBool,
    local: Mutex<Vec<Write>>,
    xid: Mutex<Option<Xid>>,
}

impl Default for SessionState {
    fn default() -> Self {
        Self {
            closed: AtomicBool::new(false),
            aborted: AtomicBool::new(false),
            auto_commit: AtomicBool::new(true),
            local: Mutex::new(Vec::new()),
            xid: Mutex::new(None),
        }
    }
}

struct MemoryConnection {
    engine: Arc<MemoryEngine>,
    session: Arc<SessionState>,
}

impl MemoryConnection {
    fn check(&self) -> Result<()> {
        if self.session.closed.load(Ordering::SeqCst) {
            return Err(XaPoolError::ConnectionLost("connection closed".into()));
        }
        self.engine.check_up()
    }

    fn write(&self, write: Write) {
        if let Some(xid) = *self.session.xid.lock() {
            self.engine
                .branches
                .lock()
                .entry(xid)
                .or_default()
                .push(write);
        } else if self.session.auto_commit.load(Ordering::SeqCst) {
            self.engine.apply(vec![write]);
        } else {
            self.session.local.lock().push(write);
        }
    }
}

#[async_trait]
impl PhysicalConnection for MemoryConnection {
    fn driver_name(&self) -> &str {
        "memory"
    }

    async fn execute(&self, sql: &str, timeout: Option<Duration>) -> Result<u64> {
        self.engine.timeouts.lock().push(timeout);
        self.check()?;

        let parts: Vec<&str> = sql.split_whitespace().collect();
        match parts.as_slice() {
            ["SELECT", "1"] => Ok(1),
            ["PUT", key, value] => {
                self.write(Write::Put(key.to_string(), value.to_string()));
                Ok(1)
            }
            ["DEL", key] => {
                self.write(Write::Delete(key.to_string()));
                Ok(1)
            }
            ["GET", key] => Ok(u64::from(self.engine.get(key).is_some())),
            ["SLEEP", ms] => {
                let ms: u64 = ms
                    .parse()
                    .map_err(|_| XaPoolError::Driver(format!("bad duration: {}", ms)))?;
                let wanted = Duration::from_millis(ms);
                match timeout {
                    Some(limit) if limit < wanted => {
                        tokio::time::sleep(limit).await;
                        Err(XaPoolError::Driver("statement timed out".into()))
                    }
                    _ => {
                        tokio::time::sleep(wanted).await;
                        Ok(0)
                    }
                }
            }
            _ => Err(XaPoolError::Driver(format!("unsupported statement: {}", sql))),
        }
    }

    async fn ping(&self) -> Result<()> {
        self.check()
    }

    async fn set_isolation(&self, _level: IsolationLevel) -> Result<()> {
        self.check()
    }

    async fn set_read_only(&self, _read_only: bool) -> Result<()> {
        self.check()
    }

    async fn set_auto_commit(&self, auto_commit: bool) -> Result<()> {
        self.check()?;
        self.session.auto_commit.store(auto_commit, Ordering::SeqCst);
        Ok(())
    }

    async fn commit(&self) -> Result<()> {
        self.check()?;
        let writes = std::mem::take(&mut *self.session.local.lock());
        self.engine.apply(writes);
        Ok(())
    }

    async fn rollback(&self) -> Result<()> {
        self.check()?;
        self.session.local.lock().clear();
        Ok(())
    }

    fn xa_resource(&self) -> Option<Arc<dyn XaResource>> {
        if !self.engine.xa {
            return None;
        }
        Some(Arc::new(MemoryXaResource {
            engine: Arc::clone(&self.engine),
            session: Arc::clone(&self.session),
        }))
    }

    fn abort(&self) {
        self.session.aborted.store(true, Ordering::SeqCst);
        if !self.session.closed.swap(true, Ordering::SeqCst) {
            self.engine.open.fetch_sub(1, Ordering::SeqCst);
        }
    }

    fn is_aborted(&self) -> bool {
        self.session.aborted.load(Ordering::SeqCst)
    }

    async fn close(&self) -> Result<()> {
        if !self.session.closed.swap(true, Ordering::SeqCst) {
            self.engine.open.fetch_sub(1, Ordering::SeqCst);
        }
        Ok(())
    }

    fn is_closed(&self) -> bool {
        self.session.closed.load(Ordering::SeqCst)
    }
}

struct MemoryXaResource {
    engine: Arc<MemoryEngine>,
    session: Arc<SessionState>,
}

impl MemoryXaResource {
    fn record(&self, call: &str) {
        self.engine.journal.push(&self.engine.name, call);
    }

    fn unknown(xid: &Xid) -> XaPoolError {
        XaPoolError::xa(XaErrorCode::UnknownXid, format!("unknown branch {}", xid))
    }
}

#[async_trait]
impl XaResource for MemoryXaResource {
    fn resource_manager(&self) -> &str {
        &self.engine.name
    }

    async fn start(&self, xid: &Xid) -> Result<()> {
        self.engine.check_rm()?;
        self.record("start");
        self.engine.branches.lock().entry(*xid).or_default();
        *self.session.xid.lock() = Some(*xid);
        Ok(())
    }

    async fn end(&self, xid: &Xid) -> Result<()> {
        self.record("end");
        let mut current = self.session.xid.lock();
        if *current == Some(*xid) {
            *current = None;
        }
        Ok(())
    }

    async fn prepare(&self, xid: &Xid) -> Result<Vote> {
        self.engine.check_rm()?;
        self.record("prepare");
        let writes = self
            .engine
            .branches
            .lock()
            .remove(xid)
            .ok_or_else(|| Self::unknown(xid))?;
        if self.engine.fail_prepare.load(Ordering::SeqCst) {
            return Err(XaPoolError::xa(XaErrorCode::RolledBack, "prepare refused"));
        }
        if writes.is_empty() {
            return Ok(Vote::ReadOnly);
        }
        self.engine.prepared.lock().insert(*xid, writes);
        Ok(Vote::Ok)
    }

    async fn commit(&self, xid: &Xid, one_phase: bool) -> Result<()> {
        self.engine.check_rm()?;
        self.record("commit");
        let writes = if one_phase {
            self.engine.branches.lock().remove(xid)
        } else {
            self.engine.prepared.lock().remove(xid)
        };
        let writes = writes.ok_or_else(|| Self::unknown(xid))?;
        self.engine.apply(writes);
        Ok(())
    }

    async fn rollback(&self, xid: &Xid) -> Result<()> {
        self.engine.check_rm()?;
        self.record("rollback");
        let active = self.engine.branches.lock().remove(xid);
        let prepared = self.engine.prepared.lock().remove(xid);
        match (active, prepared) {
            (None, None) => Err(Self::unknown(xid)),
            _ => Ok(()),
        }
    }

    async fn recover(&self) -> Result<Vec<Xid>> {
        self.engine.check_rm()?;
        Ok(self.engine.prepared())
    }
}

/// A bounded pool configuration with short timeouts and no reaper
pub fn pool_config(max_pool_size: usize) -> ConnectionFactoryConfig {
    ConnectionFactoryConfig::new(0, max_pool_size)
        .with_connection_timeout_ms(200)
        .with_reap_time_ms(0)
}

/// Build a registry with one data source per engine, named after the engine
pub fn registry_with<'a>(
    transactions: TransactionConfig,
    sources: impl IntoIterator<Item = (&'a Arc<MemoryEngine>, ConnectionFactoryConfig)>,
) -> anyhow::Result<PoolRegistry> {
    init_tracing();
    let registry = PoolRegistry::new(transactions);
    for (engine, config) in sources {
        registry.register(engine.name().to_string(), config, engine.driver())?;
    }
    Ok(registry)
}

/// Poll `check` until it holds or `limit` elapses
pub async fn eventually(limit: Duration, mut check: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + limit;
    while tokio::time::Instant::now() < deadline {
        if check() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    check()
}
