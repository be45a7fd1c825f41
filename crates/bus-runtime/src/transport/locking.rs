//! Transport over lock-based brokers.
//!
//! A received message stays hidden under a broker lock while the receiving
//! transaction runs. Settlement is tied to the transaction:
//!
//! | Lifecycle point   | Effect on the received message            |
//! |-------------------|-------------------------------------------|
//! | commit / rollback | stop lock renewal                         |
//! | ack               | complete (delete)                         |
//! | nack              | abandon (visible again immediately)       |
//! | dispose           | stop renewal, drop any unsettled handle   |
//!
//! An unsettled handle dropped on dispose leaves the message to reappear once
//! its lock lapses.

use crate::backend::{LockingBackend, LockingClient};
use crate::config::{BusConfig, DeliveryModel};
use crate::error::BusError;
use crate::gate::ConcurrencyGate;
use crate::lock_renewal::LockRenewal;
use crate::message::{BusId, QueueAddress, TransportMessage};
use crate::retry::Retrier;
use crate::transaction::TransactionContext;
use crate::transport::cache::ClientCache;
use crate::transport::outgoing::{deliver, send_or_enlist, Dispatch};
use crate::transport::{Transport, TransportSettings};
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex, PoisonError};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Lock on a received message, owned by the receiving transaction
struct LockHandle<C> {
    client: Arc<C>,
    lock_token: String,
    renewal: LockRenewal,
}

type SharedHandle<C> = Arc<Mutex<Option<LockHandle<C>>>>;

fn take_handle<C>(handle: &SharedHandle<C>) -> Option<LockHandle<C>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner).take()
}

fn stop_renewal<C>(handle: &SharedHandle<C>) {
    if let Some(held) = handle.lock().unwrap_or_else(PoisonError::into_inner).as_ref() {
        held.renewal.stop();
    }
}

struct Shared<B: LockingBackend> {
    backend: B,
    bus_id: BusId,
    settings: TransportSettings,
    clients: ClientCache<B::Client>,
    gate: ConcurrencyGate,
    retrier: Retrier,
}

#[async_trait]
impl<B: LockingBackend> Dispatch for Shared<B> {
    fn bus_id(&self) -> &BusId {
        &self.bus_id
    }

    async fn dispatch(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
    ) -> Result<(), BusError> {
        deliver(&self.clients, &self.retrier, destination, message, || {
            self.backend.connect(destination)
        })
        .await
    }
}

/// Transport for brokers that lock received messages
///
/// Cloning yields another handle to the same transport.
pub struct LockRenewalTransport<B: LockingBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: LockingBackend> Clone for LockRenewalTransport<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: LockingBackend> LockRenewalTransport<B> {
    pub fn new(bus_id: BusId, backend: B, settings: TransportSettings, retrier: Retrier) -> Self {
        let gate = ConcurrencyGate::new(settings.max_concurrent_receives);
        Self {
            shared: Arc::new(Shared {
                backend,
                bus_id,
                settings,
                clients: ClientCache::new(),
                gate,
                retrier,
            }),
        }
    }

    /// Build a transport with a generated bus identity from configuration
    pub fn from_config(backend: B, config: &BusConfig) -> Result<Self, BusError> {
        config.validate()?;
        Ok(Self::new(
            BusId::generate(),
            backend,
            TransportSettings::from_config(&config.transport)?,
            config.retry.retrier(),
        ))
    }

    pub fn backend(&self) -> &B {
        &self.shared.backend
    }

    pub fn settings(&self) -> &TransportSettings {
        &self.shared.settings
    }

    pub fn gate(&self) -> &ConcurrencyGate {
        &self.shared.gate
    }

    /// Number of cached broker clients
    pub async fn cached_clients(&self) -> usize {
        self.shared.clients.len().await
    }

    async fn client(&self, queue: &QueueAddress) -> Result<Arc<B::Client>, BusError> {
        let shared = &self.shared;
        shared
            .clients
            .get_or_connect(queue, || shared.backend.connect(queue))
            .await
    }

    fn start_renewal(&self, client: &Arc<B::Client>, lock_token: &str) -> LockRenewal {
        if !self.shared.settings.auto_renew_lock {
            return LockRenewal::Disabled;
        }

        let lock_duration = self.shared.settings.lock_duration;
        let client = Arc::clone(client);
        let token = lock_token.to_string();
        LockRenewal::start(lock_token.to_string(), lock_duration, move || {
            let client = Arc::clone(&client);
            let token = token.clone();
            async move { client.renew_lock(&token, lock_duration).await }
        })
    }

    /// Tie settlement of the received message to `context`
    fn register_settlement(
        context: &TransactionContext,
        handle: &SharedHandle<B::Client>,
    ) -> Result<(), BusError> {
        let h = Arc::clone(handle);
        context.on_commit(move |_| async move {
            stop_renewal(&h);
            Ok(())
        })?;

        let h = Arc::clone(handle);
        context.on_rollback(move |_| async move {
            stop_renewal(&h);
            Ok(())
        })?;

        let h = Arc::clone(handle);
        context.on_ack(move |_| async move {
            match take_handle(&h) {
                Some(held) => {
                    held.renewal.stop();
                    debug!(lock_token = %held.lock_token, "Completing received message");
                    held.client.complete(&held.lock_token).await
                }
                None => Ok(()),
            }
        })?;

        let h = Arc::clone(handle);
        context.on_nack(move |_| async move {
            match take_handle(&h) {
                Some(held) => {
                    held.renewal.stop();
                    debug!(lock_token = %held.lock_token, "Abandoning received message");
                    held.client.abandon(&held.lock_token).await
                }
                None => Ok(()),
            }
        })?;

        let h = Arc::clone(handle);
        context.on_disposed(move |_| async move {
            if let Some(held) = take_handle(&h) {
                warn!(
                    lock_token = %held.lock_token,
                    "Dropping unsettled message lock; message reappears when the lock lapses"
                );
            }
            Ok(())
        })?;

        Ok(())
    }
}

#[async_trait]
impl<B: LockingBackend> Transport for LockRenewalTransport<B> {
    fn address(&self) -> Option<&QueueAddress> {
        self.shared.settings.input_queue.as_ref()
    }

    fn bus_id(&self) -> &BusId {
        &self.shared.bus_id
    }

    fn delivery_model(&self) -> DeliveryModel {
        DeliveryModel::LockRenewal
    }

    async fn initialize(&self) -> Result<(), BusError> {
        if let Some(input) = self.address() {
            self.create_queue(input).await?;
        }
        Ok(())
    }

    async fn create_queue(&self, queue: &QueueAddress) -> Result<(), BusError> {
        self.shared.backend.create_queue(queue).await?;
        info!(
            queue = %queue,
            backend = self.shared.backend.name(),
            "Ensured queue exists"
        );
        Ok(())
    }

    async fn purge(&self) -> Result<u64, BusError> {
        let input = self.shared.settings.require_input()?;
        let removed = self.shared.backend.purge(input).await?;
        info!(queue = %input, removed, "Purged input queue");
        Ok(removed)
    }

    async fn send(
        &self,
        destination: &QueueAddress,
        message: TransportMessage,
        context: Option<&TransactionContext>,
    ) -> Result<(), BusError> {
        send_or_enlist(&self.shared, destination, message, context).await
    }

    async fn receive(
        &self,
        context: &TransactionContext,
        cancel: &CancellationToken,
    ) -> Result<Option<TransportMessage>, BusError> {
        let settings = &self.shared.settings;
        let input = settings.require_input()?;
        context.enlist(&self.shared.bus_id)?;

        let (client, locked) = {
            let _permit = tokio::select! {
                permit = self.shared.gate.enter() => permit?,
                _ = cancel.cancelled() => return Ok(None),
            };

            let client = self.client(input).await?;
            let received = client
                .receive(settings.lock_duration, settings.receive_poll_window, cancel)
                .await;

            match received {
                Ok(Some(locked)) => (client, locked),
                Ok(None) => return Ok(None),
                Err(e) if e.is_empty_poll() => return Ok(None),
                Err(e) => {
                    if e.should_evict_client() {
                        self.shared.clients.evict(input, &client).await;
                    }
                    return Err(e);
                }
            }
        };

        debug!(
            queue = %input,
            lock_token = %locked.lock_token,
            delivery_count = locked.delivery_count,
            "Received message under lock"
        );

        if locked.message.is_expired_at(Utc::now()) {
            debug!(
                queue = %input,
                message_id = locked.message.message_id().unwrap_or("unknown"),
                "Discarding expired message"
            );
            if let Err(e) = client.complete(&locked.lock_token).await {
                warn!(
                    queue = %input,
                    error = %e,
                    "Failed to discard expired message; it will be redelivered"
                );
            }
            return Ok(None);
        }

        let renewal = self.start_renewal(&client, &locked.lock_token);
        let handle: SharedHandle<B::Client> = Arc::new(Mutex::new(Some(LockHandle {
            client,
            lock_token: locked.lock_token,
            renewal,
        })));

        if let Err(e) = Self::register_settlement(context, &handle) {
            if let Some(held) = take_handle(&handle) {
                held.renewal.stop();
                held.client.abandon(&held.lock_token).await?;
            }
            return Err(e);
        }

        Ok(Some(locked.message))
    }
}

#[cfg(test)]
#[path = "locking_tests.rs"]
mod tests;
