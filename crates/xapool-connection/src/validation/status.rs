//! Probe latency classification

use serde::{Deserialize, Serialize};
use std::time::Duration;

/// How responsive a connection was to its liveness probe
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProbeHealth {
    #[default]
    Healthy,
    /// Answered, but slower than the healthy threshold
    Degraded,
    /// Answered far too slowly to be trusted under load
    Unhealthy,
}

impl ProbeHealth {
    /// Classify a probe round trip using the given thresholds
    pub fn classify(latency: Duration, thresholds: &ProbeThresholds) -> Self {
        if latency <= thresholds.healthy {
            ProbeHealth::Healthy
        } else if latency <= thresholds.degraded {
            ProbeHealth::Degraded
        } else {
            ProbeHealth::Unhealthy
        }
    }

    pub fn is_healthy(&self) -> bool {
        matches!(self, ProbeHealth::Healthy)
    }
}

/// Latency thresholds for [`ProbeHealth`]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProbeThresholds {
    pub healthy: Duration,
    pub degraded: Duration,
}

impl ProbeThresholds {
    pub fn new(healthy_ms: u64, degraded_ms: u64) -> Self {
        Self {
            healthy: Duration::from_millis(healthy_ms),
            degraded: Duration::from_millis(degraded_ms.max(healthy_ms)),
        }
    }
}

impl Default for ProbeThresholds {
    /// healthy up to 100ms, degraded up to 500ms
    fn default() -> Self {
        Self::new(100, 500)
    }
}
