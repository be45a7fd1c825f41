//! Transactional send buffering.
//!
//! Sends made inside a transaction are held in an [`OutgoingBuffer`] stored in
//! the transaction's item bag. The first send registers one commit callback
//! that flushes the buffer; nothing is transmitted unless the transaction
//! commits.

use crate::backend::SendClient;
use crate::error::BusError;
use crate::message::{BusId, QueueAddress, TransportMessage};
use crate::retry::Retrier;
use crate::transaction::TransactionContext;
use crate::transport::cache::ClientCache;
use async_trait::async_trait;
use std::future::Future;
use std::sync::{Arc, Mutex, PoisonError};
use tracing::debug;

/// Messages waiting for commit, grouped by destination
///
/// Destinations keep the order of their first use and messages keep the
/// order they were sent in.
#[derive(Debug, Default)]
pub struct OutgoingBuffer {
    batches: Mutex<Vec<(QueueAddress, Vec<TransportMessage>)>>,
}

impl OutgoingBuffer {
    pub fn push(&self, destination: &QueueAddress, message: TransportMessage) {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        match batches.iter_mut().find(|(queue, _)| queue == destination) {
            Some((_, messages)) => messages.push(message),
            None => batches.push((destination.clone(), vec![message])),
        }
    }

    /// Remove and return everything buffered so far
    pub fn take(&self) -> Vec<(QueueAddress, Vec<TransportMessage>)> {
        let mut batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        std::mem::take(&mut *batches)
    }

    /// Number of buffered messages across all destinations
    pub fn len(&self) -> usize {
        let batches = self.batches.lock().unwrap_or_else(PoisonError::into_inner);
        batches.iter().map(|(_, messages)| messages.len()).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Item-bag key of the buffer owned by `bus`
pub fn buffer_key(bus: &BusId) -> String {
    format!("bus-runtime.outgoing.{}", bus)
}

/// Immediate delivery half of a transport
#[async_trait]
pub(crate) trait Dispatch: Send + Sync + 'static {
    fn bus_id(&self) -> &BusId;

    /// Send `message` to `destination` now, with retries
    async fn dispatch(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
    ) -> Result<(), BusError>;
}

/// Send directly, or buffer inside `context` until it commits
pub(crate) async fn send_or_enlist<D: Dispatch>(
    dispatcher: &Arc<D>,
    destination: &QueueAddress,
    message: TransportMessage,
    context: Option<&TransactionContext>,
) -> Result<(), BusError> {
    let Some(context) = context else {
        return dispatcher.dispatch(destination, message).await;
    };

    context.enlist(dispatcher.bus_id())?;

    let key = buffer_key(dispatcher.bus_id());
    let (buffer, created) = context.items().entry(&key, OutgoingBuffer::default)?;

    if created {
        let flusher = Arc::clone(dispatcher);
        let pending = Arc::clone(&buffer);
        let registered = context.on_commit(move |tx| async move {
            debug!(
                transaction_id = %tx.id(),
                messages = pending.len(),
                "Flushing outgoing messages"
            );
            flush(flusher.as_ref(), &pending).await
        });

        if let Err(e) = registered {
            context.items().remove(&key);
            return Err(e);
        }
    }

    buffer.push(destination, message);
    Ok(())
}

async fn flush<D: Dispatch>(dispatcher: &D, buffer: &OutgoingBuffer) -> Result<(), BusError> {
    for (destination, messages) in buffer.take() {
        for message in messages {
            dispatcher.dispatch(&destination, message).await?;
        }
    }
    Ok(())
}

/// Send one message through the cached client for `destination`
///
/// Each attempt runs under `retrier`; a failure that warrants it evicts the
/// client so the next attempt connects afresh.
pub(crate) async fn deliver<C, F, Fut>(
    clients: &ClientCache<C>,
    retrier: &Retrier,
    destination: &QueueAddress,
    message: TransportMessage,
    connect: F,
) -> Result<(), BusError>
where
    C: SendClient,
    F: Fn() -> Fut,
    Fut: Future<Output = Result<Arc<C>, BusError>>,
{
    let message = &message;
    let connect = &connect;

    retrier
        .execute(move || async move {
            let client = clients.get_or_connect(destination, connect).await?;
            match client.send(message.clone()).await {
                Ok(()) => Ok(()),
                Err(e) => {
                    if e.should_evict_client() {
                        clients.evict(destination, &client).await;
                    }
                    Err(e)
                }
            }
        })
        .await
}

#[cfg(test)]
#[path = "outgoing_tests.rs"]
mod tests;
