//! TOML settings for data sources and the transaction manager
//!
//! Durations are written with a unit suffix (`ms`, `s`, `m`, `h`); a bare
//! integer is taken as seconds and `-1` disables the timeout where that makes
//! sense.
//!
//! ```toml
//! [data_sources.orders]
//! max_pool_size = 10
//! connection_timeout = "5s"
//! aged_timeout = -1
//! purge_policy = "ValidateAllConnections"
//! recovery_auth_ref = "recoveryAuth"
//!
//! [auth_data.recoveryAuth]
//! user = "recovery"
//! password = "secret"
//! ```

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    CleanupAction, ConfigIssue, ConnectionFactoryConfig, ConnectionSharing, Credentials,
    IsolationLevel, OnError, PurgePolicy, Result, TransactionConfig,
};

/// A duration as written in settings: a number of seconds or a string with a unit
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DurationSetting {
    Seconds(i64),
    Text(String),
}

/// Parsed form of a [`DurationSetting`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParsedDuration {
    Disabled,
    Millis(u64),
}

impl DurationSetting {
    /// Parse into milliseconds; `Err` carries the offending text
    pub fn parse(&self) -> std::result::Result<ParsedDuration, String> {
        match self {
            DurationSetting::Seconds(secs) if *secs < 0 => Ok(ParsedDuration::Disabled),
            DurationSetting::Seconds(secs) => Ok(ParsedDuration::Millis(*secs as u64 * 1000)),
            DurationSetting::Text(text) => parse_duration_text(text).ok_or_else(|| text.clone()),
        }
    }
}

fn parse_duration_text(text: &str) -> Option<ParsedDuration> {
    let text = text.trim();
    if text == "-1" {
        return Some(ParsedDuration::Disabled);
    }
    let split = text
        .find(|c: char| !c.is_ascii_digit())
        .unwrap_or(text.len());
    let (digits, unit) = text.split_at(split);
    let value: u64 = digits.parse().ok()?;
    let millis = match unit {
        "ms" => value,
        "" | "s" => value.checked_mul(1000)?,
        "m" => value.checked_mul(60_000)?,
        "h" => value.checked_mul(3_600_000)?,
        _ => return None,
    };
    Some(ParsedDuration::Millis(millis))
}

/// Settings for one data source, as read from TOML
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct DataSourceSettings {
    /// Name of the driver that provides physical connections
    pub driver: Option<String>,
    pub min_pool_size: Option<usize>,
    pub max_pool_size: Option<usize>,
    pub connection_timeout: Option<DurationSetting>,
    pub max_idle_time: Option<DurationSetting>,
    pub aged_timeout: Option<DurationSetting>,
    pub reap_time: Option<DurationSetting>,
    pub purge_policy: Option<String>,
    pub connection_sharing: Option<String>,
    pub query_timeout: Option<DurationSetting>,
    pub sync_query_timeout_with_transaction_timeout: Option<bool>,
    pub isolation_level: Option<String>,
    pub transactional: Option<bool>,
    pub commit_or_rollback_on_cleanup: Option<String>,
    pub validation_timeout: Option<DurationSetting>,
    pub on_error: Option<String>,
    pub recovery_auth_ref: Option<String>,
}

/// Settings for the transaction manager
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionSettings {
    pub default_timeout: Option<DurationSetting>,
    pub last_participant_support: Option<bool>,
    pub recovery_interval: Option<DurationSetting>,
}

/// All settings a registry is built from
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RegistrySettings {
    pub data_sources: BTreeMap<String, DataSourceSettings>,
    pub auth_data: BTreeMap<String, Credentials>,
    pub transaction: TransactionSettings,
}

impl RegistrySettings {
    /// Parse settings from TOML text
    pub fn from_toml(text: &str) -> Result<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// Collects parse failures while converting settings
struct Parser<'a> {
    issues: &'a mut Vec<ConfigIssue>,
}

impl Parser<'_> {
    /// Returns `Some(None)` for a disabled timeout, `None` when unset or invalid
    fn duration(&mut self, field: &str, value: &Option<DurationSetting>) -> Option<Option<u64>> {
        let value = value.as_ref()?;
        match value.parse() {
            Ok(ParsedDuration::Disabled) => Some(None),
            Ok(ParsedDuration::Millis(ms)) => Some(Some(ms)),
            Err(text) => {
                self.issues.push(ConfigIssue::UnsupportedUnit {
                    field: field.to_string(),
                    value: text,
                });
                None
            }
        }
    }

    fn named<T>(
        &mut self,
        field: &str,
        value: &Option<String>,
        parse: impl Fn(&str) -> Option<T>,
    ) -> Option<T> {
        let text = value.as_ref()?;
        let parsed = parse(text);
        if parsed.is_none() {
            self.issues.push(ConfigIssue::UnknownValue {
                field: field.to_string(),
                value: text.clone(),
            });
        }
        parsed
    }
}

fn parse_purge_policy(s: &str) -> Option<PurgePolicy> {
    match s {
        "EntirePool" => Some(PurgePolicy::EntirePool),
        "FailingConnectionOnly" => Some(PurgePolicy::FailingConnectionOnly),
        "ValidateAllConnections" => Some(PurgePolicy::ValidateAllConnections),
        _ => None,
    }
}

fn parse_sharing(s: &str) -> Option<ConnectionSharing> {
    match s {
        "MatchOriginalRequest" => Some(ConnectionSharing::MatchOriginalRequest),
        "MatchCurrentState" => Some(ConnectionSharing::MatchCurrentState),
        _ => None,
    }
}

fn parse_cleanup(s: &str) -> Option<CleanupAction> {
    match s.to_ascii_lowercase().as_str() {
        "commit" => Some(CleanupAction::Commit),
        "rollback" => Some(CleanupAction::Rollback),
        _ => None,
    }
}

fn parse_on_error(s: &str) -> Option<OnError> {
    match s.to_ascii_uppercase().as_str() {
        "FAIL" => Some(OnError::Fail),
        "WARN" => Some(OnError::Warn),
        "IGNORE" => Some(OnError::Ignore),
        _ => None,
    }
}

impl DataSourceSettings {
    /// Build the data source configuration, applying `on_error` to any failed check
    pub fn to_config(&self, name: &str) -> Result<ConnectionFactoryConfig> {
        let mut issues = Vec::new();
        let mut p = Parser {
            issues: &mut issues,
        };

        let defaults = ConnectionFactoryConfig::default();
        let mut config = ConnectionFactoryConfig::new(
            self.min_pool_size.unwrap_or(defaults.min_pool_size()),
            self.max_pool_size.unwrap_or(defaults.max_pool_size()),
        );

        if let Some(on_error) = p.named("onError", &self.on_error, parse_on_error) {
            config = config.with_on_error(on_error);
        }
        if let Some(ms) = p.duration("connectionTimeout", &self.connection_timeout) {
            config = config.with_connection_timeout_ms(ms.unwrap_or(0));
        }
        if let Some(ms) = p.duration("maxIdleTime", &self.max_idle_time) {
            config = config.with_max_idle_time_ms(ms);
        }
        if let Some(ms) = p.duration("agedTimeout", &self.aged_timeout) {
            config = config.with_aged_timeout_ms(ms);
        }
        if let Some(ms) = p.duration("reapTime", &self.reap_time) {
            config = config.with_reap_time_ms(ms.unwrap_or(0));
        }
        if let Some(ms) = p.duration("queryTimeout", &self.query_timeout) {
            config = config.with_query_timeout_ms(ms);
        }
        if let Some(ms) = p.duration("validationTimeout", &self.validation_timeout) {
            config = config.with_validation_timeout_ms(ms);
        }
        if let Some(policy) = p.named("purgePolicy", &self.purge_policy, parse_purge_policy) {
            config = config.with_purge_policy(policy);
        }
        if let Some(sharing) = p.named("connectionSharing", &self.connection_sharing, parse_sharing)
        {
            config = config.with_connection_sharing(sharing);
        }
        if let Some(level) = p.named("isolationLevel", &self.isolation_level, IsolationLevel::parse)
        {
            config = config.with_isolation_level(level);
        }
        if let Some(action) = p.named(
            "commitOrRollbackOnCleanup",
            &self.commit_or_rollback_on_cleanup,
            parse_cleanup,
        ) {
            config = config.with_cleanup_action(action);
        }
        if let Some(sync) = self.sync_query_timeout_with_transaction_timeout {
            config = config.with_sync_query_timeout(sync);
        }
        if let Some(transactional) = self.transactional {
            config = config.with_transactional(transactional);
        }
        if let Some(auth_ref) = &self.recovery_auth_ref {
            config = config.with_recovery_auth_ref(auth_ref.clone());
        }

        config.finish(name, issues)
    }
}

impl TransactionSettings {
    pub fn to_config(&self) -> TransactionConfig {
        let mut config = TransactionConfig::new();

        let millis = |setting: &Option<DurationSetting>, field: &str| match setting
            .as_ref()
            .map(DurationSetting::parse)
        {
            Some(Ok(ParsedDuration::Millis(ms))) => Some(ms),
            Some(Ok(ParsedDuration::Disabled)) => Some(0),
            Some(Err(text)) => {
                tracing::warn!(field = %field, value = %text, "ignoring transaction setting with an unsupported unit");
                None
            }
            None => None,
        };

        if let Some(ms) = millis(&self.default_timeout, "defaultTimeout") {
            config = config.with_default_timeout_ms(ms);
        }
        if let Some(ms) = millis(&self.recovery_interval, "recoveryInterval") {
            config = config.with_recovery_interval_ms(ms);
        }
        if let Some(lps) = self.last_participant_support {
            config = config.with_last_participant_support(lps);
        }
        config
    }
}
