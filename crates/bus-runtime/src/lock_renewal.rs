//! Background renewal of message locks.
//!
//! A lock-renewal transport hides a received message under a lock of fixed
//! duration. Handlers that run longer than the lock would let the message
//! reappear for another consumer; a [`LockRenewal`] keeps extending the lock
//! until the receiving transaction resolves.

use crate::error::BusError;
use std::future::Future;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

/// Interval between renewals for a lock of `lock_duration`: 80% of it
pub fn renewal_interval(lock_duration: Duration) -> Duration {
    (lock_duration * 4 / 5).max(Duration::from_millis(1))
}

/// Handle on a background renewal task
///
/// The task stops when [`LockRenewal::stop`] is called or the handle drops.
#[derive(Debug)]
pub enum LockRenewal {
    Active {
        cancel: CancellationToken,
        task: JoinHandle<()>,
    },
    /// Renewal was not requested
    Disabled,
}

impl LockRenewal {
    /// Spawn a task that calls `renew` every `0.8 × lock_duration`
    ///
    /// Failures are logged and the loop carries on, except for a lost lock:
    /// once the broker reports the lock gone there is nothing left to renew.
    pub fn start<F, Fut>(lock_token: String, lock_duration: Duration, renew: F) -> Self
    where
        F: Fn() -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let cancel = CancellationToken::new();
        let period = renewal_interval(lock_duration);

        let task_cancel = cancel.clone();
        let task = tokio::spawn(async move {
            let mut interval = tokio::time::interval(period);
            interval.tick().await; // first tick is immediate

            loop {
                tokio::select! {
                    _ = task_cancel.cancelled() => break,
                    _ = interval.tick() => {
                        let outcome = tokio::select! {
                            _ = task_cancel.cancelled() => break,
                            outcome = renew() => outcome,
                        };
                        match outcome {
                            Ok(()) => {
                                debug!(lock_token = %lock_token, "Renewed message lock");
                            }
                            Err(e @ (BusError::LockLost { .. } | BusError::MessageNotFound { .. })) => {
                                warn!(
                                    lock_token = %lock_token,
                                    error = %e,
                                    "Message lock lost; stopping renewal"
                                );
                                break;
                            }
                            Err(e) => {
                                warn!(
                                    lock_token = %lock_token,
                                    error = %e,
                                    "Lock renewal failed"
                                );
                            }
                        }
                    }
                }
            }
        });

        Self::Active { cancel, task }
    }

    pub fn is_active(&self) -> bool {
        match self {
            Self::Active { task, .. } => !task.is_finished(),
            Self::Disabled => false,
        }
    }

    /// Stop renewing; safe to call more than once
    pub fn stop(&self) {
        if let Self::Active { cancel, .. } = self {
            cancel.cancel();
        }
    }
}

impl Drop for LockRenewal {
    fn drop(&mut self) {
        self.stop();
    }
}

#[cfg(test)]
#[path = "lock_renewal_tests.rs"]
mod tests;
