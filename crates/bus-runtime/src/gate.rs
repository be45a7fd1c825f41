//! Concurrency gate for receive operations.

use crate::error::BusError;
use std::sync::Arc;
use tokio::sync::{OwnedSemaphorePermit, Semaphore};

/// Bounds the number of receive operations in flight at once
///
/// Callers beyond the limit wait (without busy-spinning) until a permit is
/// returned. Permits are released when the returned [`GatePermit`] drops, so
/// an error or a cancelled future never leaks capacity.
#[derive(Debug, Clone)]
pub struct ConcurrencyGate {
    permits: Arc<Semaphore>,
    capacity: usize,
}

impl ConcurrencyGate {
    /// Create a gate admitting at most `capacity` concurrent holders
    ///
    /// A capacity of zero is raised to one.
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            permits: Arc::new(Semaphore::new(capacity)),
            capacity,
        }
    }

    /// Wait for a free slot
    pub async fn enter(&self) -> Result<GatePermit, BusError> {
        Arc::clone(&self.permits)
            .acquire_owned()
            .await
            .map(|permit| GatePermit { _permit: permit })
            .map_err(|_| BusError::ConnectionFailed {
                message: "concurrency gate is closed".to_string(),
            })
    }

    /// Take a free slot without waiting
    pub fn try_enter(&self) -> Option<GatePermit> {
        Arc::clone(&self.permits)
            .try_acquire_owned()
            .ok()
            .map(|permit| GatePermit { _permit: permit })
    }

    /// Number of free slots
    pub fn available(&self) -> usize {
        self.permits.available_permits()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

/// Slot in a [`ConcurrencyGate`], returned on drop
#[derive(Debug)]
pub struct GatePermit {
    _permit: OwnedSemaphorePermit,
}

#[cfg(test)]
#[path = "gate_tests.rs"]
mod tests;
