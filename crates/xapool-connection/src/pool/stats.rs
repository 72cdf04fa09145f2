//! Pool statistics types

use serde::{Deserialize, Serialize};

/// Statistics about a connection pool's current state
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PoolStats {
    /// Number of physical connections owned by the pool (free + in use)
    size: usize,
    /// Number of free connections ready to be handed out
    free: usize,
    /// Number of connections associated with handles or enlisted in a branch
    in_use: usize,
    /// Number of acquisitions queued for a connection
    waiting: usize,
}

impl PoolStats {
    pub fn new(size: usize, free: usize, in_use: usize, waiting: usize) -> Self {
        Self {
            size,
            free,
            in_use,
            waiting,
        }
    }

    pub fn size(&self) -> usize {
        self.size
    }

    pub fn free(&self) -> usize {
        self.free
    }

    pub fn in_use(&self) -> usize {
        self.in_use
    }

    pub fn waiting(&self) -> usize {
        self.waiting
    }

    /// Pool utilization as a fraction (0.0 to 1.0).
    ///
    /// Returns 0.0 for an empty pool.
    pub fn utilization(&self) -> f64 {
        if self.size == 0 {
            0.0
        } else {
            self.in_use as f64 / self.size as f64
        }
    }

    /// Check if every pooled connection is in use
    pub fn is_full(&self) -> bool {
        self.free == 0 && self.size > 0
    }
}

impl Default for PoolStats {
    fn default() -> Self {
        Self::new(0, 0, 0, 0)
    }
}
