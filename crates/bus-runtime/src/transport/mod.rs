//! Transport contract and its two delivery-model variants.
//!
//! A [`Transport`] sends and receives [`TransportMessage`]s on behalf of one
//! bus. Every call takes the transaction explicitly:
//!
//! - `send` with a context buffers the message until that context commits;
//!   without one it goes out immediately.
//! - `receive` registers settlement of the received message on the context's
//!   ack/nack branch and releases any lock or delivery on dispose.
//!
//! [`LockRenewalTransport`] serves lock-based brokers, [`AckTransport`] serves
//! acknowledgment-based brokers.

use crate::config::{DeliveryModel, TransportConfig};
use crate::error::{BusError, ConfigurationError};
use crate::message::{BusId, QueueAddress, TransportMessage};
use crate::transaction::TransactionContext;
use async_trait::async_trait;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

mod ack;
mod cache;
mod locking;
mod outgoing;

pub use ack::AckTransport;
pub use cache::ClientCache;
pub use locking::LockRenewalTransport;
pub use outgoing::{buffer_key, OutgoingBuffer};

/// Uniform send/receive contract over a broker
#[async_trait]
pub trait Transport: Send + Sync {
    /// Input queue, or `None` for a send-only transport
    fn address(&self) -> Option<&QueueAddress>;

    fn bus_id(&self) -> &BusId;

    fn delivery_model(&self) -> DeliveryModel;

    /// Prepare the transport; creates the input queue. Idempotent.
    async fn initialize(&self) -> Result<(), BusError>;

    /// Create `queue` if it does not exist
    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError>;

    /// Delete every waiting message in the input queue
    async fn purge(&self) -> Result<u64, BusError>;

    /// Send `message` to `destination`
    ///
    /// With a context the message is held until that context commits.
    async fn send(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
        context: Option<&TransactionContext>,
    ) -> Result<(), BusError>;

    /// Receive the next message from the input queue within `context`
    ///
    /// Waits at most the configured poll window and returns `Ok(None)` if no
    /// message arrived, the message had already expired, or `cancel` fired.
    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, BusError>;
}

/// Runtime settings shared by both transport variants
#[derive(Debug, Clone)]
pub struct TransportSettings {
    pub input_queue: Option<QueueAddress>,
    pub lock_duration: Duration,
    pub auto_renew_lock: bool,
    pub max_concurrent_receives: usize,
    pub receive_poll_window: Duration,
}

impl TransportSettings {
    /// Resolve settings from validated configuration
    pub fn from_config(config: &TransportConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self {
            input_queue: config.input_address()?,
            lock_duration: config.lock_duration(),
            auto_renew_lock: config.auto_renew_lock,
            max_concurrent_receives: config.max_concurrent_receives,
            receive_poll_window: config.receive_poll_window(),
        })
    }

    fn require_input(&self) -> Result<&QueueAddress, BusError> {
        self.input_queue
            .as_ref()
            .ok_or_else(|| {
                BusError::Configuration(ConfigurationError::Missing {
                    key: "transport.input_queue".to_string(),
                })
            })
    }
}

impl Default for TransportSettings {
    fn default() -> Self {
        let config = TransportConfig::default();
        Self {
            input_queue: None,
            lock_duration: config.lock_duration(),
            auto_renew_lock: config.auto_renew_lock,
            max_concurrent_receives: config.max_concurrent_receives,
            receive_poll_window: config.receive_poll_window(),
        }
    }
}

#[cfg(test)]
#[path = "mod_tests.rs"]
mod tests;
