//! Connection pooling
//!
//! A [`Pool`] owns the managed connections of one data source in a slot
//! arena. Acquisition is bounded by `max_pool_size` with FIFO waiters, and a
//! periodic [`Pool::maintain`] pass ages out and reaps idle connections.
//!
//! # Example
//!
//! ```ignore
//! use xapool_connection::pool::Pool;
//! use xapool_core::{ConnectionFactoryConfig, ConnectionRequest};
//!
//! let config = ConnectionFactoryConfig::new(1, 10).with_connection_timeout_ms(5000);
//! let pool = Pool::new("orders", config, factory);
//! let key = pool.acquire(&ConnectionRequest::new()).await?;
//! // Use pool.get(key)...
//! pool.release(key).await;
//! ```

mod managed;
mod pool;
mod stats;


pub use managed::{BranchState, ManagedConnection};
pub use pool::{McKey, Pool};
pub use stats::PoolStats;
