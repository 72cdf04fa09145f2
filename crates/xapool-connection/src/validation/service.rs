//! Connection validation service

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use thiserror::Error;
use tokio::time::Instant;

use super::status::{ProbeHealth, ProbeThresholds};
use crate::pool::ManagedConnection;

/// Outcome of a liveness probe: the round trip time on success
pub type ValidationResult = Result<Duration, ValidationError>;

/// Why a connection failed validation
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ValidationError {
    /// The physical connection is closed or was aborted
    #[error("Connection is closed")]
    ConnectionClosed,
    /// The driver probe returned an error
    #[error("Liveness probe failed: {0}")]
    ProbeFailed(String),
    /// The probe did not answer within the validation timeout
    #[error("Liveness probe timed out after {0:?}")]
    Timeout(Duration),
}

/// Runs the driver liveness probe with a bound, counting outcomes
#[derive(Debug, Default)]
pub struct ValidationService {
    thresholds: ProbeThresholds,
    probes: AtomicU64,
    failures: AtomicU64,
}

impl ValidationService {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_thresholds(thresholds: ProbeThresholds) -> Self {
        Self {
            thresholds,
            ..Self::default()
        }
    }

    /// Probe the connection, failing if it does not answer within `timeout`
    pub async fn is_alive(&self, mc: &ManagedConnection, timeout: Duration) -> ValidationResult {
        self.probes.fetch_add(1, Ordering::SeqCst);
        let result = self.probe(mc, timeout).await;
        match &result {
            Ok(latency) => {
                let health = ProbeHealth::classify(*latency, &self.thresholds);
                tracing::trace!(connection_id = %mc.id(), latency = ?latency, health = ?health, "connection validated");
            }
            Err(e) => {
                self.failures.fetch_add(1, Ordering::SeqCst);
                tracing::debug!(connection_id = %mc.id(), error = %e, "connection failed validation");
            }
        }
        result
    }

    async fn probe(&self, mc: &ManagedConnection, timeout: Duration) -> ValidationResult {
        if mc.is_closed() || mc.is_aborted() {
            return Err(ValidationError::ConnectionClosed);
        }
        let start = Instant::now();
        match tokio::time::timeout(timeout, mc.ping()).await {
            Ok(Ok(())) => Ok(start.elapsed()),
            Ok(Err(e)) => Err(ValidationError::ProbeFailed(e.to_string())),
            Err(_) => Err(ValidationError::Timeout(timeout)),
        }
    }

    /// Number of probes run so far
    pub fn probes(&self) -> u64 {
        self.probes.load(Ordering::SeqCst)
    }

    /// Number of probes that failed
    pub fn failures(&self) -> u64 {
        self.failures.load(Ordering::SeqCst)
    }
}
