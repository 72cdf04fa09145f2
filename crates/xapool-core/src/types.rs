//! Core types for xapool

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// Transaction isolation level of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IsolationLevel {
    ReadUncommitted,
    ReadCommitted,
    RepeatableRead,
    Serializable,
}

impl IsolationLevel {
    /// Parse the isolation level names used in data source settings.
    ///
    /// Both `TRANSACTION_READ_COMMITTED` and `read_committed` spellings are accepted.
    pub fn parse(s: &str) -> Option<Self> {
        let normalized = s.trim().to_ascii_lowercase();
        let name = normalized
            .strip_prefix("transaction_")
            .unwrap_or(normalized.as_str());
        match name {
            "read_uncommitted" => Some(IsolationLevel::ReadUncommitted),
            "read_committed" => Some(IsolationLevel::ReadCommitted),
            "repeatable_read" => Some(IsolationLevel::RepeatableRead),
            "serializable" => Some(IsolationLevel::Serializable),
            _ => None,
        }
    }
}

impl Default for IsolationLevel {
    fn default() -> Self {
        IsolationLevel::ReadCommitted
    }
}

impl std::fmt::Display for IsolationLevel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            IsolationLevel::ReadUncommitted => "READ UNCOMMITTED",
            IsolationLevel::ReadCommitted => "READ COMMITTED",
            IsolationLevel::RepeatableRead => "REPEATABLE READ",
            IsolationLevel::Serializable => "SERIALIZABLE",
        };
        f.write_str(name)
    }
}

/// Whether a handle may share its managed connection with other handles
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SharingScope {
    #[default]
    Shareable,
    Unshareable,
}

/// The parameters an application asks for when acquiring a connection.
///
/// Fields left unset fall back to the data source defaults.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ConnectionRequest {
    pub isolation: Option<IsolationLevel>,
    pub read_only: bool,
    pub client_info: BTreeMap<String, String>,
    pub sharing: SharingScope,
}

impl ConnectionRequest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_isolation(mut self, isolation: IsolationLevel) -> Self {
        self.isolation = Some(isolation);
        self
    }

    pub fn with_read_only(mut self, read_only: bool) -> Self {
        self.read_only = read_only;
        self
    }

    pub fn with_client_info(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.client_info.insert(key.into(), value.into());
        self
    }

    pub fn unshareable(mut self) -> Self {
        self.sharing = SharingScope::Unshareable;
        self
    }

    pub fn is_shareable(&self) -> bool {
        self.sharing == SharingScope::Shareable
    }

    /// Fill in unset fields from the data source default isolation
    pub fn resolve(&self, default_isolation: IsolationLevel) -> ResolvedRequest {
        ResolvedRequest {
            isolation: self.isolation.unwrap_or(default_isolation),
            read_only: self.read_only,
            client_info: self.client_info.clone(),
        }
    }
}

/// A connection request with data source defaults applied.
///
/// Two requests are "the same original request" when their resolved forms are equal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResolvedRequest {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub client_info: BTreeMap<String, String>,
}

/// The live state of a managed connection, which may drift from the request it was opened for
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionState {
    pub isolation: IsolationLevel,
    pub read_only: bool,
    pub auto_commit: bool,
    pub client_info: BTreeMap<String, String>,
}

impl ConnectionState {
    /// The state a freshly opened connection has under the given default isolation
    pub fn initial(isolation: IsolationLevel) -> Self {
        Self {
            isolation,
            read_only: false,
            auto_commit: true,
            client_info: BTreeMap::new(),
        }
    }

    /// Whether this live state satisfies a resolved request
    pub fn satisfies(&self, request: &ResolvedRequest) -> bool {
        self.isolation == request.isolation
            && self.read_only == request.read_only
            && self.client_info == request.client_info
    }
}

/// User name and password used to open a physical connection
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Credentials {
    pub user: String,
    pub password: String,
}

impl Credentials {
    pub fn new(user: impl Into<String>, password: impl Into<String>) -> Self {
        Self {
            user: user.into(),
            password: password.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("user", &self.user)
            .field("password", &"***")
            .finish()
    }
}
