//! # Bus Runtime
//!
//! Transport-agnostic message bus runtime with transactional delivery.
//!
//! This library provides:
//! - A transaction context with commit/rollback and ack/nack callback phases
//! - Ambient (task-scoped) transactions with suppression
//! - Transports for lock-based and acknowledgment-based brokers, with
//!   outgoing messages buffered until commit
//! - Background lock renewal and a receive concurrency gate
//! - Deferred message storage with crash-safe batch handling
//! - Retry policies with per-error acceptance predicates
//!
//! ## Module Organization
//!
//! - [`error`] - Error types for all bus operations
//! - [`message`] - Transport messages, header names and queue addresses
//! - [`transaction`] - Transaction context and ambient scope
//! - [`transport`] - Transport contract and the two delivery-model variants
//! - [`backend`] - Broker backend seam and in-memory brokers
//! - [`timeouts`] - Deferred message store
//! - [`retry`] - Retry policy
//! - [`config`] - Serde configuration types
//!
//! ## Example
//!
//! ```
//! use bus_runtime::{BusError, TransactionContext};
//!
//! # tokio_test::block_on(async {
//! let result = TransactionContext::execute(|context| async move {
//!     context.on_commit(|_| async { Ok(()) })?;
//!     Ok::<_, BusError>(())
//! })
//! .await;
//! assert!(result.is_ok());
//! # });
//! ```

pub mod backend;
pub mod config;
pub mod error;
pub mod gate;
pub mod lock_renewal;
pub mod message;
pub mod retry;
pub mod timeouts;
pub mod transaction;
pub mod transport;

pub use backend::memory::{InMemoryAckBroker, InMemoryLockingBroker};
pub use backend::{AckBackend, AckClient, LockingBackend, LockingClient, SendClient};
pub use config::{BusConfig, DeliveryModel, RetryConfig, TransportConfig};
pub use error::{BusError, ConfigurationError, ValidationError};
pub use gate::ConcurrencyGate;
pub use message::{headers, BusId, Headers, MessageId, QueueAddress, TransportMessage};
pub use retry::Retrier;
pub use timeouts::{
    forward_due_messages, Clock, DueMessages, InMemoryTimeoutStore, ManualClock, SystemClock,
    TimeoutStore,
};
pub use transaction::{
    Acknowledgement, Resolution, TransactionContext, TransactionItems, TransactionState,
};
pub use transport::{AckTransport, LockRenewalTransport, Transport, TransportSettings};

#[cfg(test)]
#[path = "lib_tests.rs"]
mod tests;
