//! Registry of pools keyed by logical data source name

use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock};
use tokio::runtime::Handle;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use uuid::Uuid;
use xapool_core::{
    ConnectionFactoryConfig, Credentials, OnError, PhysicalConnectionFactory, RegistrySettings,
    Result, TransactionConfig, XaPoolError,
};

use crate::pool::{Pool, PoolStats};
use crate::recovery::{BackoffStrategy, RecoverableResource, RecoveryCoordinator};
use crate::session::{PoolTable, Session};
use crate::transaction::{
    InMemoryTransactionLog, ResourceInterceptor, TransactionLog, TransactionManager,
};

/// Owns every pool, the transaction manager and the background tasks that maintain them
pub struct PoolRegistry {
    pools: Arc<PoolTable>,
    tm: Arc<TransactionManager>,
    recovery: Arc<RecoveryCoordinator>,
    /// Credentials referenced by `recovery_auth_ref`
    auth_data: RwLock<HashMap<String, Credentials>>,
    /// Factories that `[data_sources]` settings refer to by `driver`
    drivers: RwLock<HashMap<String, Arc<dyn PhysicalConnectionFactory>>>,
    /// Set once started; later registrations spawn their reaper here
    runtime: Mutex<Option<Handle>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl PoolRegistry {
    /// Create a registry with a non-durable transaction log
    pub fn new(config: TransactionConfig) -> Self {
        Self::with_log(config, Arc::new(InMemoryTransactionLog::new()))
    }

    pub fn with_log(config: TransactionConfig, log: Arc<dyn TransactionLog>) -> Self {
        let tm = Arc::new(TransactionManager::new(config, log));
        Self {
            pools: Arc::new(RwLock::new(HashMap::new())),
            recovery: Arc::new(RecoveryCoordinator::new(Arc::clone(&tm))),
            tm,
            auth_data: RwLock::new(HashMap::new()),
            drivers: RwLock::new(HashMap::new()),
            runtime: Mutex::new(None),
            tasks: Mutex::new(Vec::new()),
        }
    }

    /// Build a registry from settings, resolving each data source's `driver`
    /// against the given factories
    pub fn from_settings(
        settings: &RegistrySettings,
        drivers: impl IntoIterator<Item = (String, Arc<dyn PhysicalConnectionFactory>)>,
    ) -> Result<Self> {
        let registry = Self::new(settings.transaction.to_config());
        for (name, factory) in drivers {
            registry.register_driver(name, factory);
        }
        registry.load(settings)?;
        Ok(registry)
    }

    pub fn register_driver(
        &self,
        name: impl Into<String>,
        factory: Arc<dyn PhysicalConnectionFactory>,
    ) {
        self.drivers.write().insert(name.into(), factory);
    }

    pub fn add_auth_data(&self, id: impl Into<String>, credentials: Credentials) {
        self.auth_data.write().insert(id.into(), credentials);
    }

    /// Register the auth data and data sources of a settings file
    #[tracing::instrument(skip_all, fields(data_sources = settings.data_sources.len()))]
    pub fn load(&self, settings: &RegistrySettings) -> Result<()> {
        for (id, credentials) in &settings.auth_data {
            self.add_auth_data(id.clone(), credentials.clone());
        }
        for (name, source) in &settings.data_sources {
            let driver = source
                .driver
                .as_deref()
                .ok_or_else(|| XaPoolError::Configuration {
                    factory: name.clone(),
                    check: "driver is required".to_string(),
                })?;
            let factory = self.drivers.read().get(driver).cloned().ok_or_else(|| {
                XaPoolError::Configuration {
                    factory: name.clone(),
                    check: format!("driver '{}' is not registered", driver),
                }
            })?;
            let config = source.to_config(name)?;
            self.register(name.clone(), config, factory)?;
        }
        Ok(())
    }

    /// Create the pool for a data source
    #[tracing::instrument(skip(self, config, factory), fields(factory = %name))]
    pub fn register(
        &self,
        name: String,
        config: ConnectionFactoryConfig,
        factory: Arc<dyn PhysicalConnectionFactory>,
    ) -> Result<Arc<Pool>> {
        if self.pools.read().contains_key(&name) {
            return Err(XaPoolError::Configuration {
                factory: name,
                check: "a data source with this name is already registered".to_string(),
            });
        }
        let config = config.finish(&name, Vec::new())?;
        let credentials = self.recovery_credentials(&name, &config)?;
        let transactional = config.transactional();
        let pool = Arc::new(Pool::new(name.clone(), config, Arc::clone(&factory)));

        if transactional {
            self.recovery.register(
                RecoverableResource::new(name.clone(), factory).with_credentials(credentials),
            );
        }
        self.pools.write().insert(name, Arc::clone(&pool));
        if let Some(runtime) = self.runtime.lock().clone() {
            self.spawn_reaper(&runtime, &pool);
        }
        tracing::info!(
            min = pool.config().min_pool_size(),
            max = pool.config().max_pool_size(),
            transactional,
            "data source registered"
        );
        Ok(pool)
    }

    fn recovery_credentials(
        &self,
        name: &str,
        config: &ConnectionFactoryConfig,
    ) -> Result<Option<Credentials>> {
        let Some(auth_ref) = config.recovery_auth_ref() else {
            return Ok(None);
        };
        if let Some(credentials) = self.auth_data.read().get(auth_ref) {
            return Ok(Some(credentials.clone()));
        }
        let check = format!("recovery_auth_ref '{}' does not name any auth data", auth_ref);
        match config.on_error() {
            OnError::Fail => Err(XaPoolError::Configuration {
                factory: name.to_string(),
                check,
            }),
            OnError::Warn => {
                tracing::warn!(factory = %name, check = %check, "recovering with default credentials");
                Ok(None)
            }
            OnError::Ignore => Ok(None),
        }
    }

    pub fn pool(&self, name: &str) -> Option<Arc<Pool>> {
        self.pools.read().get(name).cloned()
    }

    pub fn pool_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.pools.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Open a new unit of work against the registered data sources
    pub fn session(&self) -> Session {
        Session::new(Arc::clone(&self.pools), Arc::clone(&self.tm))
    }

    pub fn transaction_manager(&self) -> &Arc<TransactionManager> {
        &self.tm
    }

    pub fn recovery(&self) -> &Arc<RecoveryCoordinator> {
        &self.recovery
    }

    /// Wrap every enlisted and recovered resource, or stop wrapping with `None`
    pub fn set_resource_interceptor(&self, interceptor: Option<Arc<dyn ResourceInterceptor>>) {
        self.tm.set_interceptor(interceptor);
    }

    pub fn stats(&self, name: &str) -> Result<PoolStats> {
        self.pool(name)
            .map(|pool| pool.stats())
            .ok_or_else(|| XaPoolError::NotFound(format!("data source '{}'", name)))
    }

    pub fn all_stats(&self) -> BTreeMap<String, PoolStats> {
        self.pools
            .read()
            .iter()
            .map(|(name, pool)| (name.clone(), pool.stats()))
            .collect()
    }

    /// Stats of every pool as a JSON object keyed by data source name
    pub fn stats_json(&self) -> Result<String> {
        Ok(serde_json::to_string_pretty(&self.all_stats())?)
    }

    /// Run one recovery pass now
    pub async fn recover(&self) -> Result<Vec<Uuid>> {
        self.recovery.recover().await
    }

    /// Fill pools to their minimum, recover in-doubt branches and start the
    /// reaper and recovery tasks
    #[tracing::instrument(skip(self))]
    pub async fn start(&self) -> Result<()> {
        let runtime = Handle::current();
        *self.runtime.lock() = Some(runtime.clone());

        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        for pool in &pools {
            pool.fill_to_min().await;
            self.spawn_reaper(&runtime, pool);
        }

        let unresolved = self.recovery.recover().await?;
        self.spawn_recovery(&runtime, !unresolved.is_empty());
        tracing::info!(
            pools = pools.len(),
            unresolved = unresolved.len(),
            "pool registry started"
        );
        Ok(())
    }

    fn spawn_reaper(&self, runtime: &Handle, pool: &Arc<Pool>) {
        let Some(period) = pool.config().reap_time() else {
            return;
        };
        let pool = Arc::clone(pool);
        let task = runtime.spawn(async move {
            let mut ticker = tokio::time::interval(period);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
            // The first tick completes immediately
            ticker.tick().await;
            loop {
                ticker.tick().await;
                if pool.is_closed() {
                    break;
                }
                pool.maintain().await;
            }
        });
        self.tasks.lock().push(task);
    }

    fn spawn_recovery(&self, runtime: &Handle, in_doubt: bool) {
        let recovery = Arc::clone(&self.recovery);
        let signal = self.tm.recovery_signal();
        let interval = self.tm.config().recovery_interval();
        let backoff = BackoffStrategy::for_interval(interval);

        let task = runtime.spawn(async move {
            let mut in_doubt = in_doubt;
            let mut attempt = 0u32;
            loop {
                let delay: Duration = if in_doubt {
                    backoff.calculate_delay(attempt)
                } else {
                    interval
                };
                tokio::select! {
                    _ = signal.notified() => {
                        tracing::debug!("heuristic outcome signalled, recovering");
                        attempt = 0;
                    }
                    _ = tokio::time::sleep(delay) => {}
                }
                match recovery.recover().await {
                    Ok(unresolved) if unresolved.is_empty() => {
                        in_doubt = false;
                        attempt = 0;
                    }
                    Ok(unresolved) => {
                        tracing::debug!(unresolved = unresolved.len(), attempt, "branches still in doubt");
                        in_doubt = true;
                        attempt = attempt.saturating_add(1);
                    }
                    Err(e) => {
                        tracing::warn!(error = %e, attempt, "recovery pass failed");
                        in_doubt = true;
                        attempt = attempt.saturating_add(1);
                    }
                }
            }
        });
        self.tasks.lock().push(task);
    }

    /// Stop background tasks and close every pool
    #[tracing::instrument(skip(self))]
    pub async fn shutdown(&self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
        *self.runtime.lock() = None;
        let pools: Vec<Arc<Pool>> = self.pools.read().values().cloned().collect();
        futures::future::join_all(pools.iter().map(|pool| pool.close())).await;
        tracing::info!(pools = pools.len(), "pool registry shut down");
    }
}

impl Drop for PoolRegistry {
    fn drop(&mut self) {
        for task in self.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl std::fmt::Debug for PoolRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("PoolRegistry")
            .field("pools", &self.pool_names())
            .field("tm", &self.tm)
            .field("tasks", &self.tasks.lock().len())
            .finish()
    }
}
