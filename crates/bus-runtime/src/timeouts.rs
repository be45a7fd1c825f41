//! Deferred message storage.
//!
//! Messages sent with a due time in the future are parked in a
//! [`TimeoutStore`] until they are due. A poller takes the due records as a
//! [`DueMessages`] batch, forwards them and completes each one it delivered;
//! everything not completed goes back into the store when the batch is
//! aborted or dropped.

use crate::error::BusError;
use crate::message::{headers, Headers, QueueAddress, TransportMessage};
use crate::transaction::TransactionContext;
use crate::transport::Transport;
use async_trait::async_trait;
use bytes::Bytes;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, info, warn};

// ============================================================================
// Clock
// ============================================================================

/// Source of the current time for due-time checks
pub trait Clock: Send + Sync {
    fn now(&self) -> DateTime<Utc>;
}

/// Wall-clock time
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl Clock for SystemClock {
    fn now(&self) -> DateTime<Utc> {
        Utc::now()
    }
}

/// Clock that only moves when told to
///
/// Clones share the same time.
#[derive(Debug, Clone)]
pub struct ManualClock {
    now: Arc<Mutex<DateTime<Utc>>>,
}

impl ManualClock {
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Arc::new(Mutex::new(start)),
        }
    }

    pub fn set(&self, now: DateTime<Utc>) {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner) = now;
    }

    pub fn advance(&self, by: chrono::Duration) {
        let mut now = self.now.lock().unwrap_or_else(PoisonError::into_inner);
        *now += by;
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *self.now.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

// ============================================================================
// Records
// ============================================================================

/// A parked message and the instant it becomes due
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeferredMessage {
    pub message_id: String,
    pub due_time: DateTime<Utc>,
    pub headers: Headers,
    pub body: Bytes,
}

impl DeferredMessage {
    pub fn header(&self, key: &str) -> Option<&str> {
        self.headers.get(key).map(String::as_str)
    }
}

/// One record taken from the store
#[derive(Debug)]
pub struct DueMessage {
    record: DeferredMessage,
    completed: bool,
}

impl DueMessage {
    pub fn record(&self) -> &DeferredMessage {
        &self.record
    }

    /// Mark the record as delivered so it is not returned to the store
    pub fn complete(&mut self) {
        self.completed = true;
    }

    pub fn is_completed(&self) -> bool {
        self.completed
    }
}

type Reinsert = Box<dyn Fn(Vec<DeferredMessage>) + Send + Sync>;

/// Batch of due records taken from a store
///
/// Records not completed by the time the batch is aborted (or dropped) are
/// handed back to the store.
pub struct DueMessages {
    messages: Vec<DueMessage>,
    reinsert: Reinsert,
    settled: bool,
}

impl DueMessages {
    /// Wrap records taken from a store; `reinsert` puts records back
    pub fn new<F>(records: Vec<DeferredMessage>, reinsert: F) -> Self
    where
        F: Fn(Vec<DeferredMessage>) + Send + Sync + 'static,
    {
        Self {
            messages: records
                .into_iter()
                .map(|record| DueMessage {
                    record,
                    completed: false,
                })
                .collect(),
            reinsert: Box::new(reinsert),
            settled: false,
        }
    }

    pub fn len(&self) -> usize {
        self.messages.len()
    }

    pub fn is_empty(&self) -> bool {
        self.messages.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &DueMessage> {
        self.messages.iter()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut DueMessage> {
        self.messages.iter_mut()
    }

    /// Return every record that was not completed to the store
    pub fn abort(mut self) {
        self.return_incomplete();
    }

    fn return_incomplete(&mut self) {
        if self.settled {
            return;
        }
        self.settled = true;

        let incomplete: Vec<DeferredMessage> = std::mem::take(&mut self.messages)
            .into_iter()
            .filter(|message| !message.completed)
            .map(|message| message.record)
            .collect();

        if !incomplete.is_empty() {
            debug!(count = incomplete.len(), "Returning incomplete due messages to store");
            (self.reinsert)(incomplete);
        }
    }
}

impl Drop for DueMessages {
    fn drop(&mut self) {
        self.return_incomplete();
    }
}

impl std::fmt::Debug for DueMessages {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DueMessages")
            .field("messages", &self.messages)
            .field("settled", &self.settled)
            .finish()
    }
}

// ============================================================================
// Store
// ============================================================================

/// Storage for messages that are not due yet
#[async_trait]
pub trait TimeoutStore: Send + Sync {
    /// Park a message until `due_time`
    ///
    /// Records are keyed by the `bus-msg-id` header. Deferring an ID that is
    /// already stored keeps the existing record.
    ///
    /// # Errors
    ///
    /// Returns `BusError::MissingHeader` if `headers` carries no message ID.
    async fn defer(
        &self,
        due_time: DateTime<Utc>,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), BusError>;

    /// Take every record whose due time has passed
    async fn get_due_messages(&self) -> Result<DueMessages, BusError>;
}

type Records = HashMap<String, DeferredMessage>;

/// Process-local timeout store
///
/// Every operation runs in one critical section, so concurrent pollers never
/// take the same record twice.
#[derive(Clone)]
pub struct InMemoryTimeoutStore {
    records: Arc<Mutex<Records>>,
    clock: Arc<dyn Clock>,
}

impl Default for InMemoryTimeoutStore {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryTimeoutStore {
    pub fn new() -> Self {
        Self::with_clock(SystemClock)
    }

    pub fn with_clock(clock: impl Clock + 'static) -> Self {
        Self {
            records: Arc::new(Mutex::new(HashMap::new())),
            clock: Arc::new(clock),
        }
    }

    fn records(&self) -> MutexGuard<'_, Records> {
        self.records.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Number of parked records
    pub fn len(&self) -> usize {
        self.records().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, message_id: &str) -> bool {
        self.records().contains_key(message_id)
    }
}

#[async_trait]
impl TimeoutStore for InMemoryTimeoutStore {
    async fn defer(
        &self,
        due_time: DateTime<Utc>,
        headers: Headers,
        body: Bytes,
    ) -> Result<(), BusError> {
        let message_id = headers
            .get(headers::MESSAGE_ID)
            .cloned()
            .ok_or_else(|| BusError::MissingHeader {
                header: headers::MESSAGE_ID.to_string(),
            })?;

        let mut records = self.records();
        if records.contains_key(&message_id) {
            debug!(message_id = %message_id, "Message already deferred; keeping first record");
            return Ok(());
        }

        debug!(message_id = %message_id, due_time = %due_time, "Deferring message");
        records.insert(
            message_id.clone(),
            DeferredMessage {
                message_id,
                due_time,
                headers,
                body,
            },
        );
        Ok(())
    }

    async fn get_due_messages(&self) -> Result<DueMessages, BusError> {
        let now = self.clock.now();

        let mut due: Vec<DeferredMessage> = {
            let mut records = self.records();
            let ids: Vec<String> = records
                .values()
                .filter(|record| record.due_time <= now)
                .map(|record| record.message_id.clone())
                .collect();
            ids.iter().filter_map(|id| records.remove(id)).collect()
        };
        due.sort_by(|a, b| {
            a.due_time
                .cmp(&b.due_time)
                .then_with(|| a.message_id.cmp(&b.message_id))
        });

        let records = Arc::clone(&self.records);
        Ok(DueMessages::new(due, move |returned| {
            let mut records = records.lock().unwrap_or_else(PoisonError::into_inner);
            for record in returned {
                records.entry(record.message_id.clone()).or_insert(record);
            }
        }))
    }
}

// ============================================================================
// Forwarding
// ============================================================================

/// Forward every due message once
///
/// Each due record is sent to the queue named in its `bus-defer-recipient`
/// header, inside its own transaction, with `bus-deferred-until` removed. A
/// record is completed once its transaction committed, even if disposing the
/// transaction fails afterwards; records that could not be forwarded go back
/// to the store for the next pass.
///
/// Returns the number of messages forwarded.
pub async fn forward_due_messages<S, T>(store: &S, transport: &T) -> Result<usize, BusError>
where
    S: TimeoutStore + ?Sized,
    T: Transport + ?Sized,
{
    let mut due = store.get_due_messages().await?;
    let mut forwarded = 0;

    for message in due.iter_mut() {
        let record = message.record();

        let recipient = match record
            .header(headers::DEFER_RECIPIENT)
            .map(QueueAddress::new)
        {
            Some(Ok(recipient)) => recipient,
            Some(Err(e)) => {
                warn!(
                    message_id = %record.message_id,
                    error = %e,
                    "Deferred message names an invalid recipient; keeping it"
                );
                continue;
            }
            None => {
                warn!(
                    message_id = %record.message_id,
                    "Deferred message has no recipient; keeping it"
                );
                continue;
            }
        };

        let outgoing = TransportMessage::new(record.headers.clone(), record.body.clone())
            .without_header(headers::DEFERRED_UNTIL);

        let context = TransactionContext::new();
        let sent = match transport.send(&recipient, outgoing, Some(&context)).await {
            Ok(()) => context.complete().await,
            Err(e) => Err(e),
        };
        if let Err(e) = context.dispose().await {
            // The send already committed; keeping the record would forward it twice.
            warn!(
                message_id = %record.message_id,
                error = %e,
                "Dispose failed after forwarding due message"
            );
        }

        match sent {
            Ok(()) => {
                debug!(
                    message_id = %record.message_id,
                    recipient = %recipient,
                    "Forwarded due message"
                );
                message.complete();
                forwarded += 1;
            }
            Err(e) => {
                warn!(
                    message_id = %record.message_id,
                    recipient = %recipient,
                    error = %e,
                    "Failed to forward due message; it will be retried"
                );
            }
        }
    }

    if forwarded > 0 {
        info!(forwarded, "Forwarded due messages");
    }
    Ok(forwarded)
}

#[cfg(test)]
#[path = "timeouts_tests.rs"]
mod tests;
