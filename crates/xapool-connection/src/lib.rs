//! xapool Connection - Pooling, sharing and transaction enlistment
//!
//! This crate turns the driver-level traits of `xapool-core` into a managed
//! connection service:
//!
//! - `PoolRegistry` - pools keyed by logical data source name, plus the
//!   maintenance and recovery tasks
//! - `Session` / `ConnectionHandle` - the caller's unit of work and its
//!   connection proxies
//! - `TransactionManager` - enlistment, one-phase and two-phase commit
//! - `RecoveryCoordinator` - resolution of in-doubt branches

mod handle;
pub mod pool;
pub mod recovery;
mod registry;
mod session;
mod sharing;
mod timeout;
pub mod transaction;
pub mod validation;

#[cfg(test)]
mod test_support;

pub use handle::{ConnectionHandle, Statement};
pub use pool::{BranchState, ManagedConnection, McKey, Pool, PoolStats};
pub use recovery::{BackoffStrategy, RecoverableResource, RecoveryCoordinator};
pub use registry::PoolRegistry;
pub use session::Session;
pub use sharing::{ShareCandidate, SharingCoordinator};
pub use timeout::TimeoutSynchronizer;
pub use transaction::{
    BranchStatus, Decision, FaultInjector, FaultPoint, InMemoryTransactionLog, LogEntry,
    ResourceInterceptor, ScopeKind, TransactionBranch, TransactionLog, TransactionManager,
};
pub use validation::{ProbeHealth, ProbeThresholds, ValidationService};
