//! Recovery of in-doubt distributed transactions
//!
//! The [`RecoveryCoordinator`] opens a dedicated connection to every
//! transactional data source, lists the branches its resource manager holds
//! prepared, and finishes each one according to the transaction log. The
//! registry runs it at startup and from a background task that retries with
//! [`BackoffStrategy`] until nothing is left unresolved.

mod backoff;
mod coordinator;


pub use backoff::BackoffStrategy;
pub use coordinator::{RecoverableResource, RecoveryCoordinator};
