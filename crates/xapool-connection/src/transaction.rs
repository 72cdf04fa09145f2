//! Transaction enlistment and completion
//!
//! The [`TransactionManager`] enlists managed connections in global (XA) or
//! local transaction branches and drives their completion: one-phase commit
//! for a single participant, two-phase commit with an optional last
//! participant otherwise. Commit decisions go to a [`TransactionLog`] so the
//! recovery coordinator can finish in-doubt branches.

mod branch;
mod fault;
mod local;
mod log;
mod manager;


pub use branch::{BranchStatus, ScopeKind, TransactionBranch};
pub use fault::{FaultInjector, FaultPoint, ResourceInterceptor};
pub use local::LocalTransactionResource;
pub use log::{Decision, InMemoryTransactionLog, LogEntry, TransactionLog};
pub use manager::TransactionManager;
