//! xapool Core - Core abstractions for the pooled connection manager
//!
//! This crate provides the fundamental traits and types that the pool and
//! transaction crates build on. It defines:
//!
//! - `PhysicalConnection` / `PhysicalConnectionFactory` - driver-level connections
//! - `XaResource` - the two-phase resource of a resource manager
//! - `ConnectionFactoryConfig` - per data source pool and timeout settings
//! - `RegistrySettings` - TOML settings for data sources and transactions
//! - Common types like `Xid`, `ConnectionRequest` and `XaPoolError`

mod config;
mod connection;
mod error;
pub mod settings;
mod types;
mod xid;

pub use config::*;
pub use connection::*;
pub use error::*;
pub use settings::{DataSourceSettings, DurationSetting, RegistrySettings, TransactionSettings};
pub use types::*;
pub use xid::*;
