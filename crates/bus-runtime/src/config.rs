//! Bus configuration types.
//!
//! All settings carry serde defaults so a partially specified file (or no
//! file at all) still yields a usable configuration.

use crate::error::ConfigurationError;
use crate::message::QueueAddress;
use crate::retry::{backoff_waits, Retrier};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Native delivery semantics of a backend
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeliveryModel {
    /// Received messages are hidden under a time-bounded, renewable lock
    LockRenewal,
    /// Received messages stay in flight until acknowledged or rejected
    Acknowledgment,
}

impl DeliveryModel {
    /// Check if receivers of this model hold a lock that can expire
    pub fn uses_locks(&self) -> bool {
        matches!(self, Self::LockRenewal)
    }
}

/// Top-level configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusConfig {
    pub transport: TransportConfig,
    pub retry: RetryConfig,
}

impl BusConfig {
    /// Validate every section
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        self.transport.validate()?;
        self.retry.validate()
    }
}

/// Transport configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct TransportConfig {
    /// Which transport variant to build
    pub delivery_model: DeliveryModel,

    /// Input queue; `None` builds a send-only transport
    pub input_queue: Option<String>,

    /// Lock duration requested on receive (lock-renewal transports)
    pub lock_duration_secs: u64,

    /// Renew locks in the background while the receiving transaction is open
    pub auto_renew_lock: bool,

    /// Maximum number of receive operations in flight at once
    pub max_concurrent_receives: usize,

    /// Longest time a receive waits for a message before returning nothing
    pub receive_poll_window_ms: u64,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            delivery_model: DeliveryModel::LockRenewal,
            input_queue: None,
            lock_duration_secs: 30,
            auto_renew_lock: false,
            max_concurrent_receives: 20,
            receive_poll_window_ms: 1000,
        }
    }
}

impl TransportConfig {
    pub fn lock_duration(&self) -> Duration {
        Duration::from_secs(self.lock_duration_secs)
    }

    pub fn receive_poll_window(&self) -> Duration {
        Duration::from_millis(self.receive_poll_window_ms)
    }

    /// Resolve the configured input queue
    pub fn input_address(&self) -> Result<Option<QueueAddress>, ConfigurationError> {
        self.input_queue
            .as_deref()
            .map(|queue| {
                QueueAddress::new(queue).map_err(|e| ConfigurationError::Invalid {
                    message: format!("transport.input_queue: {}", e),
                })
            })
            .transpose()
    }

    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if self.lock_duration_secs == 0 {
            return Err(ConfigurationError::Invalid {
                message: "transport.lock_duration_secs must be greater than zero".to_string(),
            });
        }

        if self.max_concurrent_receives == 0 {
            return Err(ConfigurationError::Invalid {
                message: "transport.max_concurrent_receives must be greater than zero"
                    .to_string(),
            });
        }

        if self.receive_poll_window_ms == 0 {
            return Err(ConfigurationError::Invalid {
                message: "transport.receive_poll_window_ms must be greater than zero".to_string(),
            });
        }

        self.input_address().map(|_| ())
    }
}

/// Retry configuration for outbound backend calls
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Number of retries after the first attempt
    pub attempts: u32,
    pub initial_delay_ms: u64,
    pub max_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            attempts: 5,
            initial_delay_ms: 100,
            max_delay_ms: 5000,
            multiplier: 2.0,
        }
    }
}

impl RetryConfig {
    pub fn validate(&self) -> Result<(), ConfigurationError> {
        if !self.multiplier.is_finite() || self.multiplier < 1.0 {
            return Err(ConfigurationError::Invalid {
                message: "retry.multiplier must be a finite number of at least 1.0".to_string(),
            });
        }

        if self.max_delay_ms < self.initial_delay_ms {
            return Err(ConfigurationError::Invalid {
                message: "retry.max_delay_ms must not be below retry.initial_delay_ms".to_string(),
            });
        }

        Ok(())
    }

    /// Build the retrier for transient faults described by this configuration
    pub fn retrier(&self) -> Retrier {
        Retrier::transient(backoff_waits(
            self.attempts,
            Duration::from_millis(self.initial_delay_ms),
            Duration::from_millis(self.max_delay_ms),
            self.multiplier,
        ))
    }
}

#[cfg(test)]
#[path = "config_tests.rs"]
mod tests;
