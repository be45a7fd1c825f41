//! Common test utilities for bus-runtime integration tests
//!
//! This module provides:
//! - Transport builders over the in-memory brokers
//! - A callback recorder for lifecycle ordering checks
//! - A gauged locking backend that tracks concurrent receives

use async_trait::async_trait;
use bus_runtime::backend::memory::InMemoryLockingClient;
use bus_runtime::backend::LockedMessage;
use bus_runtime::{
    AckTransport, BusError, BusId, InMemoryAckBroker, InMemoryLockingBroker, LockRenewalTransport,
    LockingBackend, LockingClient, QueueAddress, Retrier, SendClient, TransactionContext,
    Transport, TransportMessage, TransportSettings,
};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio_util::sync::CancellationToken;

pub const POLL_WINDOW: Duration = Duration::from_millis(100);

// ============================================================================
// Transport Builders
// ============================================================================

#[allow(dead_code)]
pub fn queue(name: &str) -> QueueAddress {
    QueueAddress::new(name).unwrap()
}

#[allow(dead_code)]
pub fn settings(input: &str) -> TransportSettings {
    TransportSettings {
        input_queue: Some(queue(input)),
        receive_poll_window: POLL_WINDOW,
        ..TransportSettings::default()
    }
}

#[allow(dead_code)]
pub fn retrier() -> Retrier {
    Retrier::transient(vec![Duration::from_millis(10); 3])
}

#[allow(dead_code)]
pub fn lock_transport(
    broker: &InMemoryLockingBroker,
    bus: &str,
    settings: TransportSettings,
) -> LockRenewalTransport<InMemoryLockingBroker> {
    LockRenewalTransport::new(BusId::new(bus), broker.clone(), settings, retrier())
}

#[allow(dead_code)]
pub fn ack_transport(
    broker: &InMemoryAckBroker,
    bus: &str,
    settings: TransportSettings,
) -> AckTransport<InMemoryAckBroker> {
    AckTransport::new(BusId::new(bus), broker.clone(), settings, retrier())
}

/// Send one message in its own committed transaction
#[allow(dead_code)]
pub async fn send_committed<T: Transport>(
    transport: &T,
    destination: &QueueAddress,
    message: TransportMessage,
) {
    TransactionContext::execute(|context| async move {
        transport.send(destination, message, Some(&context)).await
    })
    .await
    .unwrap();
}

/// Receive one message in its own transaction and complete it
#[allow(dead_code)]
pub async fn receive_committed<T: Transport>(transport: &T) -> Option<TransportMessage> {
    let context = TransactionContext::new();
    let received = transport
        .receive(&context, &CancellationToken::new())
        .await
        .unwrap();
    context.complete().await.unwrap();
    context.dispose().await.unwrap();
    received
}

// ============================================================================
// Callback Recorder
// ============================================================================

/// Ordered log of fired lifecycle callbacks
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct CallLog {
    calls: Arc<Mutex<Vec<&'static str>>>,
}

#[allow(dead_code)]
impl CallLog {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn calls(&self) -> Vec<&'static str> {
        self.calls.lock().unwrap().clone()
    }

    fn recorder(
        &self,
        name: &'static str,
    ) -> impl FnOnce(TransactionContext) -> std::future::Ready<Result<(), BusError>> + Send + 'static
    {
        let calls = Arc::clone(&self.calls);
        move |_| {
            calls.lock().unwrap().push(name);
            std::future::ready(Ok(()))
        }
    }

    /// Register a recorder for one lifecycle point by name
    pub fn register(&self, context: &TransactionContext, point: &'static str) {
        let recorder = self.recorder(point);
        match point {
            "commit" => context.on_commit(recorder),
            "rollback" => context.on_rollback(recorder),
            "ack" => context.on_ack(recorder),
            "nack" => context.on_nack(recorder),
            "disposed" => context.on_disposed(recorder),
            other => panic!("unknown lifecycle point {other}"),
        }
        .unwrap();
    }
}

// ============================================================================
// Gauged Backend
// ============================================================================

/// Tracks how many receives are in flight at once
#[derive(Debug, Default)]
#[allow(dead_code)]
pub struct Gauge {
    current: AtomicUsize,
    peak: AtomicUsize,
}

#[allow(dead_code)]
impl Gauge {
    pub fn peak(&self) -> usize {
        self.peak.load(Ordering::SeqCst)
    }

    fn enter(&self) {
        let now = self.current.fetch_add(1, Ordering::SeqCst) + 1;
        self.peak.fetch_max(now, Ordering::SeqCst);
    }

    fn leave(&self) {
        self.current.fetch_sub(1, Ordering::SeqCst);
    }
}

/// Locking backend that measures receive concurrency
#[derive(Clone, Default)]
#[allow(dead_code)]
pub struct GaugedBroker {
    pub inner: InMemoryLockingBroker,
    pub gauge: Arc<Gauge>,
}

#[allow(dead_code)]
pub struct GaugedClient {
    inner: Arc<InMemoryLockingClient>,
    gauge: Arc<Gauge>,
}

#[async_trait]
impl LockingBackend for GaugedBroker {
    type Client = GaugedClient;

    fn name(&self) -> &'static str {
        "gauged"
    }

    async fn connect(&self, queue: &QueueAddress) -> Result<Arc<GaugedClient>, BusError> {
        Ok(Arc::new(GaugedClient {
            inner: self.inner.connect(queue).await?,
            gauge: Arc::clone(&self.gauge),
        }))
    }

    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError> {
        self.inner.create_queue(queue).await
    }

    async fn purge(&self, queue: &QueueAddress) -> Result<u64, BusError> {
        self.inner.purge(queue).await
    }
}

#[async_trait]
impl SendClient for GaugedClient {
    fn queue(&self) -> &QueueAddress {
        self.inner.queue()
    }

    async fn send(&self, message: TransportMessage) -> Result<(), BusError> {
        self.inner.send(message).await
    }
}

#[async_trait]
impl LockingClient for GaugedClient {
    async fn receive(
        &self,
        lock_duration: Duration,
        poll_window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockedMessage>, BusError> {
        self.gauge.enter();
        let result = self.inner.receive(lock_duration, poll_window, cancel).await;
        self.gauge.leave();
        result
    }

    async fn complete(&self, lock_token: &str) -> Result<(), BusError> {
        self.inner.complete(lock_token).await
    }

    async fn abandon(&self, lock_token: &str) -> Result<(), BusError> {
        self.inner.abandon(lock_token).await
    }

    async fn renew_lock(&self, lock_token: &str, lock_duration: Duration) -> Result<(), BusError> {
        self.inner.renew_lock(lock_token, lock_duration).await
    }
}
