//! Liveness validation of pooled connections
//!
//! The pool asks the [`ValidationService`] to probe a free connection before
//! handing it out when `validation_timeout` is configured, or when a purge
//! flagged the connection for a pretest.

mod service;
mod status;


pub use service::{ValidationError, ValidationResult, ValidationService};
pub use status::{ProbeHealth, ProbeThresholds};
