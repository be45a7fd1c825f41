//! Broker backends.
//!
//! A backend is the seam to a concrete broker SDK. It hands out per-queue
//! clients which the transports cache and evict. Two families exist, one per
//! native delivery model:
//!
//! - [`LockingBackend`]: received messages are hidden under a time-bounded
//!   lock that can be renewed, completed or abandoned.
//! - [`AckBackend`]: received messages stay in flight on the client until they
//!   are acknowledged or negatively acknowledged.
//!
//! Receive calls signal "nothing arrived within the poll window" with
//! [`BusError::ReceiveTimeout`], the way broker SDKs surface long-poll
//! timeouts; the transports translate that into an empty result.

use crate::error::BusError;
use crate::message::{QueueAddress, TransportMessage};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub mod memory;

/// Operations every broker client supports
#[async_trait]
pub trait SendClient: Send + Sync + 'static {
    /// Queue this client is bound to
    fn queue(&self) -> &QueueAddress;

    /// Transmit one message to the bound queue
    async fn send(&self, message: TransportMessage) -> Result<(), BusError>;
}

// ============================================================================
// Lock-based brokers
// ============================================================================

/// A message received under a broker lock
#[derive(Debug, Clone)]
pub struct LockedMessage {
    pub message: TransportMessage,
    pub lock_token: String,
    /// Number of times the broker has handed this message out, this one included
    pub delivery_count: u32,
}

/// Broker whose receivers hold renewable locks
#[async_trait]
pub trait LockingBackend: Send + Sync + 'static {
    type Client: LockingClient;

    /// Short backend name for logs and errors
    fn name(&self) -> &'static str;

    /// Open a client bound to `queue`
    async fn connect(&self, queue: &QueueAddress) -> Result<Arc<Self::Client>, BusError>;

    /// Create `queue` if it does not exist
    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError>;

    /// Delete every message waiting in `queue`, returning how many were removed
    ///
    /// Messages currently held by a receiver are left alone.
    async fn purge(&self, queue: &QueueAddress) -> Result<u64, BusError>;
}

/// Client bound to one queue of a [`LockingBackend`]
#[async_trait]
pub trait LockingClient: SendClient {
    /// Wait up to `poll_window` for a message and lock it for `lock_duration`
    ///
    /// Returns `Ok(None)` if `cancel` fires first; nothing is consumed then.
    async fn receive(
        &self,
        lock_duration: Duration,
        poll_window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockedMessage>, BusError>;

    /// Delete the locked message
    async fn complete(&self, lock_token: &str) -> Result<(), BusError>;

    /// Release the lock so the message is immediately visible again
    async fn abandon(&self, lock_token: &str) -> Result<(), BusError>;

    /// Extend the lock by `lock_duration` from now
    async fn renew_lock(&self, lock_token: &str, lock_duration: Duration)
        -> Result<(), BusError>;
}

// ============================================================================
// Acknowledgment-based brokers
// ============================================================================

/// A message delivered to a consumer awaiting acknowledgement
#[derive(Debug, Clone)]
pub struct Delivery {
    pub message: TransportMessage,
    pub delivery_tag: u64,
    /// Whether the broker delivered this message before
    pub redelivered: bool,
}

/// Broker whose consumers explicitly acknowledge deliveries
#[async_trait]
pub trait AckBackend: Send + Sync + 'static {
    type Client: AckClient;

    fn name(&self) -> &'static str;

    async fn connect(&self, queue: &QueueAddress) -> Result<Arc<Self::Client>, BusError>;

    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError>;

    async fn purge(&self, queue: &QueueAddress) -> Result<u64, BusError>;
}

/// Client (channel) bound to one queue of an [`AckBackend`]
#[async_trait]
pub trait AckClient: SendClient {
    /// Wait up to `poll_window` for a delivery
    ///
    /// Returns `Ok(None)` if `cancel` fires first; nothing is consumed then.
    async fn receive(
        &self,
        poll_window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, BusError>;

    /// Acknowledge the delivery, removing the message
    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError>;

    /// Reject the delivery, optionally returning it to the queue
    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError>;
}
