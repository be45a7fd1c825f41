//! In-memory broker backends for testing and development.
//!
//! Both brokers keep process-lifetime state behind a mutex and:
//! - Deliver FIFO per queue
//! - Hold back messages until their `bus-deferred-until` instant
//! - Hand out messages exactly as they were sent
//! - Count connections and inject connection faults on request
//!
//! Lock expiry runs on the tokio clock so tests can drive it with paused time.
//! Queues are created on first use.

use crate::backend::{
    AckBackend, AckClient, Delivery, LockedMessage, LockingBackend, LockingClient, SendClient,
};
use crate::error::BusError;
use crate::message::{QueueAddress, TransportMessage};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::debug;

/// Pause between checks while a receive waits for a message
const POLL_INTERVAL: Duration = Duration::from_millis(25);

// ============================================================================
// Shared Storage
// ============================================================================

/// A message waiting in a queue
#[derive(Debug, Clone)]
struct StoredMessage {
    message: TransportMessage,
    visible_at: Instant,
    delivery_count: u32,
}

impl StoredMessage {
    fn new(message: TransportMessage) -> Self {
        let now = Instant::now();
        let visible_at = message
            .deferred_until()
            .and_then(|due| (due - Utc::now()).to_std().ok())
            .map(|delay| now + delay)
            .unwrap_or(now);

        Self {
            message,
            visible_at,
            delivery_count: 0,
        }
    }

    fn is_visible(&self, now: Instant) -> bool {
        self.visible_at <= now
    }

    /// Record one more delivery and produce the copy handed to the receiver
    fn deliver(&mut self) -> TransportMessage {
        self.delivery_count += 1;
        self.message.clone()
    }
}

/// Faults to inject into upcoming operations
#[derive(Debug, Default)]
struct FaultPlan {
    sends: AtomicU32,
    receives: AtomicU32,
    renewals: AtomicU32,
}

impl FaultPlan {
    /// Consume one pending fault from `counter`, if any
    fn trip(counter: &AtomicU32, operation: &str) -> Result<(), BusError> {
        match counter.fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1)) {
            Ok(_) => Err(BusError::ConnectionFailed {
                message: format!("injected {} fault", operation),
            }),
            Err(_) => Ok(()),
        }
    }
}

/// State shared by a broker and all of its clients
#[derive(Debug)]
struct Broker<Q> {
    queues: Mutex<HashMap<QueueAddress, Q>>,
    faults: FaultPlan,
    connections: AtomicU64,
    next_tag: AtomicU64,
}

impl<Q: Default> Broker<Q> {
    fn new() -> Self {
        Self {
            queues: Mutex::new(HashMap::new()),
            faults: FaultPlan::default(),
            connections: AtomicU64::new(0),
            next_tag: AtomicU64::new(1),
        }
    }

    fn queues(&self) -> MutexGuard<'_, HashMap<QueueAddress, Q>> {
        self.queues.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Run `f` against `queue`, creating the queue on first use
    fn with_queue<R>(&self, queue: &QueueAddress, f: impl FnOnce(&mut Q) -> R) -> R {
        let mut queues = self.queues();
        f(queues.entry(queue.clone()).or_default())
    }

    fn register_connection(&self, queue: &QueueAddress) {
        let total = self.connections.fetch_add(1, Ordering::SeqCst) + 1;
        debug!(queue = %queue, connections = total, "Opened in-memory broker client");
    }
}

/// Wait up to `poll_window` for `attempt` to produce a value
///
/// Cancellation is checked before every attempt, so a cancelled receive never
/// takes a message.
async fn poll<T>(
    poll_window: Duration,
    cancel: &CancellationToken,
    mut attempt: impl FnMut() -> Option<T>,
) -> Result<Option<T>, BusError> {
    let deadline = Instant::now() + poll_window;

    loop {
        if cancel.is_cancelled() {
            return Ok(None);
        }
        if let Some(found) = attempt() {
            return Ok(Some(found));
        }

        let now = Instant::now();
        if now >= deadline {
            return Err(BusError::ReceiveTimeout {
                duration: poll_window,
            });
        }

        let nap = POLL_INTERVAL.min(deadline - now);
        tokio::select! {
            _ = cancel.cancelled() => return Ok(None),
            _ = tokio::time::sleep(nap) => {}
        }
    }
}

// ============================================================================
// InMemoryLockingBroker
// ============================================================================

/// A message held under a receiver's lock
#[derive(Debug)]
struct LockedEntry {
    stored: StoredMessage,
    lock_expires_at: Instant,
}

#[derive(Debug, Default)]
struct LockingQueue {
    ready: VecDeque<StoredMessage>,
    locked: HashMap<String, LockedEntry>,
}

impl LockingQueue {
    /// Return messages whose lock lapsed to the head of the queue
    fn reclaim_expired(&mut self, now: Instant) {
        let expired: Vec<String> = self
            .locked
            .iter()
            .filter(|(_, entry)| entry.lock_expires_at <= now)
            .map(|(token, _)| token.clone())
            .collect();

        for token in expired {
            if let Some(entry) = self.locked.remove(&token) {
                debug!(lock_token = %token, "Message lock expired; message visible again");
                self.ready.push_front(entry.stored);
            }
        }
    }

    /// Look up a lock that is still held
    fn held_lock(&mut self, lock_token: &str, now: Instant) -> Result<&mut LockedEntry, BusError> {
        let lapsed = match self.locked.get(lock_token) {
            Some(entry) => entry.lock_expires_at <= now,
            None => {
                return Err(BusError::MessageNotFound {
                    lock_token: lock_token.to_string(),
                })
            }
        };

        if lapsed {
            self.reclaim_expired(now);
            return Err(BusError::LockLost {
                lock_token: lock_token.to_string(),
            });
        }

        self.locked
            .get_mut(lock_token)
            .ok_or_else(|| BusError::MessageNotFound {
                lock_token: lock_token.to_string(),
            })
    }
}

/// In-memory broker with lock/complete/abandon/renew semantics
///
/// Cloning yields another handle to the same broker.
#[derive(Debug, Clone)]
pub struct InMemoryLockingBroker {
    shared: Arc<Broker<LockingQueue>>,
}

impl Default for InMemoryLockingBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryLockingBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Broker::new()),
        }
    }

    /// Make the next `count` sends fail with a connection fault
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.faults.sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail with a connection fault
    pub fn fail_next_receives(&self, count: u32) {
        self.shared.faults.receives.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` lock renewals fail with a connection fault
    pub fn fail_next_renewals(&self, count: u32) {
        self.shared.faults.renewals.store(count, Ordering::SeqCst);
    }

    /// Number of clients opened so far
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Messages in `queue`, waiting or locked
    pub fn message_count(&self, queue: &QueueAddress) -> usize {
        self.shared.with_queue(queue, |q| q.ready.len() + q.locked.len())
    }

    /// Messages in `queue` currently held under a lock that has not lapsed
    pub fn locked_count(&self, queue: &QueueAddress) -> usize {
        let now = Instant::now();
        self.shared.with_queue(queue, |q| {
            q.locked
                .values()
                .filter(|entry| entry.lock_expires_at > now)
                .count()
        })
    }
}

#[async_trait]
impl LockingBackend for InMemoryLockingBroker {
    type Client = InMemoryLockingClient;

    fn name(&self) -> &'static str {
        "in-memory-locking"
    }

    async fn connect(&self, queue: &QueueAddress) -> Result<Arc<Self::Client>, BusError> {
        self.shared.register_connection(queue);
        Ok(Arc::new(InMemoryLockingClient {
            queue: queue.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError> {
        self.shared.with_queue(queue, |_| ());
        Ok(())
    }

    async fn purge(&self, queue: &QueueAddress) -> Result<u64, BusError> {
        let removed = self.shared.with_queue(queue, |q| {
            let removed = q.ready.len();
            q.ready.clear();
            removed
        });
        Ok(removed as u64)
    }
}

/// Client of an [`InMemoryLockingBroker`] bound to one queue
#[derive(Debug)]
pub struct InMemoryLockingClient {
    queue: QueueAddress,
    shared: Arc<Broker<LockingQueue>>,
}

#[async_trait]
impl SendClient for InMemoryLockingClient {
    fn queue(&self) -> &QueueAddress {
        &self.queue
    }

    async fn send(&self, message: TransportMessage) -> Result<(), BusError> {
        FaultPlan::trip(&self.shared.faults.sends, "send")?;
        self.shared.with_queue(&self.queue, |q| {
            q.ready.push_back(StoredMessage::new(message));
        });
        Ok(())
    }
}

#[async_trait]
impl LockingClient for InMemoryLockingClient {
    async fn receive(
        &self,
        lock_duration: Duration,
        poll_window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<LockedMessage>, BusError> {
        FaultPlan::trip(&self.shared.faults.receives, "receive")?;

        poll(poll_window, cancel, || {
            self.shared.with_queue(&self.queue, |q| {
                let now = Instant::now();
                q.reclaim_expired(now);

                let position = q.ready.iter().position(|m| m.is_visible(now))?;
                let mut stored = q.ready.remove(position)?;
                let message = stored.deliver();
                let delivery_count = stored.delivery_count;
                let lock_token = uuid::Uuid::new_v4().to_string();

                q.locked.insert(
                    lock_token.clone(),
                    LockedEntry {
                        stored,
                        lock_expires_at: now + lock_duration,
                    },
                );

                Some(LockedMessage {
                    message,
                    lock_token,
                    delivery_count,
                })
            })
        })
        .await
    }

    async fn complete(&self, lock_token: &str) -> Result<(), BusError> {
        self.shared.with_queue(&self.queue, |q| {
            q.held_lock(lock_token, Instant::now())?;
            q.locked.remove(lock_token);
            Ok(())
        })
    }

    async fn abandon(&self, lock_token: &str) -> Result<(), BusError> {
        self.shared.with_queue(&self.queue, |q| {
            q.held_lock(lock_token, Instant::now())?;
            if let Some(entry) = q.locked.remove(lock_token) {
                q.ready.push_front(entry.stored);
            }
            Ok(())
        })
    }

    async fn renew_lock(&self, lock_token: &str, lock_duration: Duration) -> Result<(), BusError> {
        FaultPlan::trip(&self.shared.faults.renewals, "renewal")?;
        self.shared.with_queue(&self.queue, |q| {
            let now = Instant::now();
            let entry = q.held_lock(lock_token, now)?;
            entry.lock_expires_at = now + lock_duration;
            Ok(())
        })
    }
}

// ============================================================================
// InMemoryAckBroker
// ============================================================================

#[derive(Debug, Default)]
struct AckQueue {
    ready: VecDeque<StoredMessage>,
    unacked: HashMap<u64, StoredMessage>,
}

/// In-memory broker with ack/nack semantics
///
/// Deliveries stay unacknowledged until settled; nothing expires them.
#[derive(Debug, Clone)]
pub struct InMemoryAckBroker {
    shared: Arc<Broker<AckQueue>>,
}

impl Default for InMemoryAckBroker {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryAckBroker {
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Broker::new()),
        }
    }

    /// Make the next `count` sends fail with a connection fault
    pub fn fail_next_sends(&self, count: u32) {
        self.shared.faults.sends.store(count, Ordering::SeqCst);
    }

    /// Make the next `count` receives fail with a connection fault
    pub fn fail_next_receives(&self, count: u32) {
        self.shared.faults.receives.store(count, Ordering::SeqCst);
    }

    /// Number of clients opened so far
    pub fn connections(&self) -> u64 {
        self.shared.connections.load(Ordering::SeqCst)
    }

    /// Messages in `queue`, waiting or unacknowledged
    pub fn message_count(&self, queue: &QueueAddress) -> usize {
        self.shared
            .with_queue(queue, |q| q.ready.len() + q.unacked.len())
    }

    /// Deliveries from `queue` awaiting settlement
    pub fn unacked_count(&self, queue: &QueueAddress) -> usize {
        self.shared.with_queue(queue, |q| q.unacked.len())
    }
}

#[async_trait]
impl AckBackend for InMemoryAckBroker {
    type Client = InMemoryAckClient;

    fn name(&self) -> &'static str {
        "in-memory-ack"
    }

    async fn connect(&self, queue: &QueueAddress) -> Result<Arc<Self::Client>, BusError> {
        self.shared.register_connection(queue);
        Ok(Arc::new(InMemoryAckClient {
            queue: queue.clone(),
            shared: Arc::clone(&self.shared),
        }))
    }

    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError> {
        self.shared.with_queue(queue, |_| ());
        Ok(())
    }

    async fn purge(&self, queue: &QueueAddress) -> Result<u64, BusError> {
        let removed = self.shared.with_queue(queue, |q| {
            let removed = q.ready.len();
            q.ready.clear();
            removed
        });
        Ok(removed as u64)
    }
}

/// Client (channel) of an [`InMemoryAckBroker`] bound to one queue
#[derive(Debug)]
pub struct InMemoryAckClient {
    queue: QueueAddress,
    shared: Arc<Broker<AckQueue>>,
}

impl InMemoryAckClient {
    fn unknown_tag(delivery_tag: u64) -> BusError {
        BusError::MessageNotFound {
            lock_token: delivery_tag.to_string(),
        }
    }
}

#[async_trait]
impl SendClient for InMemoryAckClient {
    fn queue(&self) -> &QueueAddress {
        &self.queue
    }

    async fn send(&self, message: TransportMessage) -> Result<(), BusError> {
        FaultPlan::trip(&self.shared.faults.sends, "send")?;
        self.shared.with_queue(&self.queue, |q| {
            q.ready.push_back(StoredMessage::new(message));
        });
        Ok(())
    }
}

#[async_trait]
impl AckClient for InMemoryAckClient {
    async fn receive(
        &self,
        poll_window: Duration,
        cancel: &CancellationToken,
    ) -> Result<Option<Delivery>, BusError> {
        FaultPlan::trip(&self.shared.faults.receives, "receive")?;

        poll(poll_window, cancel, || {
            self.shared.with_queue(&self.queue, |q| {
                let now = Instant::now();
                let position = q.ready.iter().position(|m| m.is_visible(now))?;
                let mut stored = q.ready.remove(position)?;
                let message = stored.deliver();
                let redelivered = stored.delivery_count > 1;
                let delivery_tag = self.shared.next_tag.fetch_add(1, Ordering::SeqCst);

                q.unacked.insert(delivery_tag, stored);

                Some(Delivery {
                    message,
                    delivery_tag,
                    redelivered,
                })
            })
        })
        .await
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), BusError> {
        self.shared.with_queue(&self.queue, |q| {
            q.unacked
                .remove(&delivery_tag)
                .map(|_| ())
                .ok_or_else(|| Self::unknown_tag(delivery_tag))
        })
    }

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BusError> {
        self.shared.with_queue(&self.queue, |q| {
            let stored = q
                .unacked
                .remove(&delivery_tag)
                .ok_or_else(|| Self::unknown_tag(delivery_tag))?;
            if requeue {
                q.ready.push_front(stored);
            }
            Ok(())
        })
    }
}

#[cfg(test)]
#[path = "memory_tests.rs"]
mod tests;
