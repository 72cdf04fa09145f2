//! Data source configuration types
//!
//! A [`ConnectionFactoryConfig`] is the immutable bundle of pool bounds,
//! timeouts, sharing mode and validation policy for one logical data source.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::{IsolationLevel, Result, XaPoolError};

/// What happens to the rest of the pool when one connection fails
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PurgePolicy {
    /// Destroy every pooled connection
    #[default]
    EntirePool,
    /// Destroy only the connection that failed
    FailingConnectionOnly,
    /// Validate every remaining connection before it is handed out again
    ValidateAllConnections,
}

/// How a new request decides whether it may share an active managed connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ConnectionSharing {
    /// Share when the original acquisition parameters are identical
    #[default]
    MatchOriginalRequest,
    /// Share when the connection's current live state satisfies the request
    MatchCurrentState,
}

/// What to do with uncommitted local work when a connection is cleaned up
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CleanupAction {
    Commit,
    #[default]
    Rollback,
}

/// Reaction to a configuration check failing at factory construction
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum OnError {
    /// Abort creation of the data source
    Fail,
    /// Log a warning and continue with degraded settings
    #[default]
    Warn,
    /// Continue with degraded settings silently
    Ignore,
}

/// A configuration check that failed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConfigIssue {
    MinExceedsMax { min: usize, max: usize },
    ValidationWithoutPooling,
    UnsupportedUnit { field: String, value: String },
    UnknownValue { field: String, value: String },
}

impl std::fmt::Display for ConfigIssue {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ConfigIssue::MinExceedsMax { min, max } => {
                write!(f, "minPoolSize ({}) cannot exceed maxPoolSize ({})", min, max)
            }
            ConfigIssue::ValidationWithoutPooling => write!(
                f,
                "validationTimeout requires pooling, but agedTimeout=0 disables pooling"
            ),
            ConfigIssue::UnsupportedUnit { field, value } => {
                write!(f, "{} has an unsupported timeout unit: '{}'", field, value)
            }
            ConfigIssue::UnknownValue { field, value } => {
                write!(f, "{} has an unrecognized value: '{}'", field, value)
            }
        }
    }
}

/// Configuration for one logical data source
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionFactoryConfig {
    /// Minimum number of connections the maintenance loop keeps
    min_pool_size: usize,
    /// Maximum number of physical connections, 0 for unbounded
    max_pool_size: usize,
    /// How long an acquisition waits for a free slot, 0 to wait forever
    connection_timeout_ms: u64,
    /// Free connections idle longer than this are reaped down to min_pool_size
    max_idle_time_ms: Option<u64>,
    /// Hard lifetime cap; `Some(0)` disables pooling
    aged_timeout_ms: Option<u64>,
    /// Interval of the maintenance loop, 0 disables it
    reap_time_ms: u64,
    purge_policy: PurgePolicy,
    connection_sharing: ConnectionSharing,
    /// Default statement timeout
    query_timeout_ms: Option<u64>,
    sync_query_timeout_with_transaction_timeout: bool,
    isolation_level: IsolationLevel,
    transactional: bool,
    commit_or_rollback_on_cleanup: CleanupAction,
    /// Bound on the liveness probe; `None` disables validation
    validation_timeout_ms: Option<u64>,
    on_error: OnError,
    recovery_auth_ref: Option<String>,
}

impl ConnectionFactoryConfig {
    /// Create a configuration with the given pool bounds and default timeouts
    pub fn new(min_pool_size: usize, max_pool_size: usize) -> Self {
        Self {
            min_pool_size,
            max_pool_size,
            connection_timeout_ms: 30_000,
            max_idle_time_ms: Some(1_800_000),
            aged_timeout_ms: None,
            reap_time_ms: 180_000,
            purge_policy: PurgePolicy::default(),
            connection_sharing: ConnectionSharing::default(),
            query_timeout_ms: None,
            sync_query_timeout_with_transaction_timeout: false,
            isolation_level: IsolationLevel::default(),
            transactional: true,
            commit_or_rollback_on_cleanup: CleanupAction::default(),
            validation_timeout_ms: None,
            on_error: OnError::default(),
            recovery_auth_ref: None,
        }
    }

    pub fn with_connection_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.connection_timeout_ms = timeout_ms;
        self
    }

    pub fn with_max_idle_time_ms(mut self, idle_ms: Option<u64>) -> Self {
        self.max_idle_time_ms = idle_ms;
        self
    }

    pub fn with_aged_timeout_ms(mut self, aged_ms: Option<u64>) -> Self {
        self.aged_timeout_ms = aged_ms;
        self
    }

    pub fn with_reap_time_ms(mut self, reap_ms: u64) -> Self {
        self.reap_time_ms = reap_ms;
        self
    }

    pub fn with_purge_policy(mut self, policy: PurgePolicy) -> Self {
        self.purge_policy = policy;
        self
    }

    pub fn with_connection_sharing(mut self, sharing: ConnectionSharing) -> Self {
        self.connection_sharing = sharing;
        self
    }

    pub fn with_query_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.query_timeout_ms = timeout_ms;
        self
    }

    pub fn with_sync_query_timeout(mut self, sync: bool) -> Self {
        self.sync_query_timeout_with_transaction_timeout = sync;
        self
    }

    pub fn with_isolation_level(mut self, level: IsolationLevel) -> Self {
        self.isolation_level = level;
        self
    }

    pub fn with_transactional(mut self, transactional: bool) -> Self {
        self.transactional = transactional;
        self
    }

    pub fn with_cleanup_action(mut self, action: CleanupAction) -> Self {
        self.commit_or_rollback_on_cleanup = action;
        self
    }

    pub fn with_validation_timeout_ms(mut self, timeout_ms: Option<u64>) -> Self {
        self.validation_timeout_ms = timeout_ms;
        self
    }

    pub fn with_on_error(mut self, on_error: OnError) -> Self {
        self.on_error = on_error;
        self
    }

    pub fn with_recovery_auth_ref(mut self, auth_ref: impl Into<String>) -> Self {
        self.recovery_auth_ref = Some(auth_ref.into());
        self
    }

    pub fn min_pool_size(&self) -> usize {
        self.min_pool_size
    }

    pub fn max_pool_size(&self) -> usize {
        self.max_pool_size
    }

    /// `None` when acquisitions wait forever
    pub fn connection_timeout(&self) -> Option<Duration> {
        (self.connection_timeout_ms > 0).then(|| Duration::from_millis(self.connection_timeout_ms))
    }

    pub fn max_idle_time(&self) -> Option<Duration> {
        self.max_idle_time_ms.map(Duration::from_millis)
    }

    /// Lifetime cap of pooled connections; zero only when pooling is disabled
    pub fn aged_timeout(&self) -> Option<Duration> {
        self.aged_timeout_ms.map(Duration::from_millis)
    }

    /// Whether released connections may be returned to the free pool
    pub fn pooling_enabled(&self) -> bool {
        self.aged_timeout_ms != Some(0)
    }

    /// `None` when no maintenance loop should run
    pub fn reap_time(&self) -> Option<Duration> {
        (self.reap_time_ms > 0).then(|| Duration::from_millis(self.reap_time_ms))
    }

    pub fn purge_policy(&self) -> PurgePolicy {
        self.purge_policy
    }

    pub fn connection_sharing(&self) -> ConnectionSharing {
        self.connection_sharing
    }

    pub fn query_timeout(&self) -> Option<Duration> {
        self.query_timeout_ms.map(Duration::from_millis)
    }

    pub fn sync_query_timeout_with_transaction_timeout(&self) -> bool {
        self.sync_query_timeout_with_transaction_timeout
    }

    pub fn isolation_level(&self) -> IsolationLevel {
        self.isolation_level
    }

    pub fn transactional(&self) -> bool {
        self.transactional
    }

    pub fn cleanup_action(&self) -> CleanupAction {
        self.commit_or_rollback_on_cleanup
    }

    /// `None` when validation is disabled
    pub fn validation_timeout(&self) -> Option<Duration> {
        self.validation_timeout_ms.map(Duration::from_millis)
    }

    pub fn on_error(&self) -> OnError {
        self.on_error
    }

    pub fn recovery_auth_ref(&self) -> Option<&str> {
        self.recovery_auth_ref.as_deref()
    }

    /// Checks that hold between the configured values
    pub fn issues(&self) -> Vec<ConfigIssue> {
        let mut issues = Vec::new();
        if self.max_pool_size > 0 && self.min_pool_size > self.max_pool_size {
            issues.push(ConfigIssue::MinExceedsMax {
                min: self.min_pool_size,
                max: self.max_pool_size,
            });
        }
        if !self.pooling_enabled() && self.validation_timeout_ms.is_some() {
            issues.push(ConfigIssue::ValidationWithoutPooling);
        }
        issues
    }

    /// Apply `on_error` to the given issues plus the configuration's own checks.
    ///
    /// `Fail` rejects the configuration; `Warn` and `Ignore` return it with the
    /// offending settings degraded to something usable.
    pub fn finish(mut self, factory: &str, mut issues: Vec<ConfigIssue>) -> Result<Self> {
        issues.extend(self.issues());
        if issues.is_empty() {
            return Ok(self);
        }

        if self.on_error == OnError::Fail {
            let check = issues
                .iter()
                .map(ToString::to_string)
                .collect::<Vec<_>>()
                .join("; ");
            return Err(XaPoolError::Configuration {
                factory: factory.to_string(),
                check,
            });
        }

        for issue in &issues {
            if self.on_error == OnError::Warn {
                tracing::warn!(factory = %factory, check = %issue, "continuing with degraded data source settings");
            }
            match issue {
                ConfigIssue::MinExceedsMax { max, .. } => self.min_pool_size = *max,
                ConfigIssue::ValidationWithoutPooling => self.validation_timeout_ms = None,
                // Parse failures already fell back to the field default
                ConfigIssue::UnsupportedUnit { .. } | ConfigIssue::UnknownValue { .. } => {}
            }
        }
        Ok(self)
    }
}

impl Default for ConnectionFactoryConfig {
    /// Defaults:
    /// - min_pool_size: 0
    /// - max_pool_size: 50
    /// - connection_timeout: 30 seconds
    /// - max_idle_time: 30 minutes
    /// - aged_timeout: never
    /// - reap_time: 3 minutes
    fn default() -> Self {
        Self::new(0, 50)
    }
}

/// Configuration of the transaction manager
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Timeout applied to global transactions begun without an explicit one, 0 for none
    default_timeout_ms: u64,
    /// Allow one one-phase-only resource to take part in a two-phase commit
    last_participant_support: bool,
    /// Interval at which unresolved branches are retried by the recovery task
    recovery_interval_ms: u64,
}

impl TransactionConfig {
    pub fn new() -> Self {
        Self {
            default_timeout_ms: 120_000,
            last_participant_support: false,
            recovery_interval_ms: 10_000,
        }
    }

    pub fn with_default_timeout_ms(mut self, timeout_ms: u64) -> Self {
        self.default_timeout_ms = timeout_ms;
        self
    }

    pub fn with_last_participant_support(mut self, enabled: bool) -> Self {
        self.last_participant_support = enabled;
        self
    }

    pub fn with_recovery_interval_ms(mut self, interval_ms: u64) -> Self {
        self.recovery_interval_ms = interval_ms;
        self
    }

    pub fn default_timeout(&self) -> Option<Duration> {
        (self.default_timeout_ms > 0).then(|| Duration::from_millis(self.default_timeout_ms))
    }

    pub fn last_participant_support(&self) -> bool {
        self.last_participant_support
    }

    pub fn recovery_interval(&self) -> Duration {
        Duration::from_millis(self.recovery_interval_ms.max(1))
    }
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self::new()
    }
}
