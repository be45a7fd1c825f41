//! Transport over acknowledgment-based brokers.
//!
//! Deliveries stay in flight on the receiving client until the transaction
//! settles them: ack acknowledges, nack rejects with requeue, and dispose
//! rejects anything still unsettled so no delivery is left dangling.

use crate::backend::{AckBackend, AckClient};
use crate::config::{BusConfig, DeliveryModel};
use crate::error::BusError;
use crate::gate::ConcurrencyGate;
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

struct DeliveryHandle<C> {
    client: Arc<C>,
    delivery_tag: u64,
}

type SharedHandle<C> = Arc<Mutex<Option<DeliveryHandle<C>>>>;

fn take_handle<C>(handle: &SharedHandle<C>) -> Option<DeliveryHandle<C>> {
    handle.lock().unwrap_or_else(PoisonError::into_inner).take()
}

struct Shared<B: AckBackend> {
    backend: B,
    bus_id: BusId,
    settings: TransportSettings,
    clients: ClientCache<B::Client>,
    gate: ConcurrencyGate,
    retrier: Retrier,
}

#[async_trait]
impl<B: AckBackend> Dispatch for Shared<B> {
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

/// Transport for brokers that track explicit acknowledgements
///
/// Lock duration and renewal settings do not apply; deliveries never expire
/// while the client holds them.
pub struct AckTransport<B: AckBackend> {
    shared: Arc<Shared<B>>,
}

impl<B: AckBackend> Clone for AckTransport<B> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<B: AckBackend> AckTransport<B> {
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

    fn register_settlement(
        context: &TransactionContext,
        handle: &SharedHandle<B::Client>,
    ) -> Result<(), BusError> {
        let h = Arc::clone(handle);
        context.on_ack(move |_| async move {
            match take_handle(&h) {
                Some(held) => {
                    debug!(delivery_tag = held.delivery_tag, "Acknowledging delivery");
                    held.client.ack(held.delivery_tag).await
                }
                None => Ok(()),
            }
        })?;

        let h = Arc::clone(handle);
        context.on_nack(move |_| async move {
            match take_handle(&h) {
                Some(held) => {
                    debug!(delivery_tag = held.delivery_tag, "Rejecting delivery for redelivery");
                    held.client.nack(held.delivery_tag, true).await
                }
                None => Ok(()),
            }
        })?;

        let h = Arc::clone(handle);
        context.on_disposed(move |_| async move {
            match take_handle(&h) {
                Some(held) => {
                    warn!(
                        delivery_tag = held.delivery_tag,
                        "Delivery unsettled at dispose; rejecting it"
                    );
                    held.client.nack(held.delivery_tag, true).await
                }
                None => Ok(()),
            }
        })?;

        Ok(())
    }
}

#[async_trait]
impl<B: AckBackend> Transport for AckTransport<B> {
    fn address(&self) -> Option<&QueueAddress> {
        self.shared.settings.input_queue.as_ref()
    }

    fn bus_id(&self) -> &BusId {
        &self.shared.bus_id
    }

    fn delivery_model(&self) -> DeliveryModel {
        DeliveryModel::Acknowledgment
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

        let (client, delivery) = {
            let _permit = tokio::select! {
                permit = self.shared.gate.enter() => permit?,
                _ = cancel.cancelled() => return Ok(None),
            };

            let client = self.client(input).await?;
            match client.receive(settings.receive_poll_window, cancel).await {
                Ok(Some(delivery)) => (client, delivery),
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
            delivery_tag = delivery.delivery_tag,
            redelivered = delivery.redelivered,
            "Received delivery"
        );

        if delivery.message.is_expired_at(Utc::now()) {
            debug!(
                queue = %input,
                message_id = delivery.message.message_id().unwrap_or("unknown"),
                "Discarding expired message"
            );
            if let Err(e) = client.ack(delivery.delivery_tag).await {
                warn!(
                    queue = %input,
                    error = %e,
                    "Failed to discard expired message; it will be redelivered"
                );
            }
            return Ok(None);
        }

        let handle: SharedHandle<B::Client> = Arc::new(Mutex::new(Some(DeliveryHandle {
            client,
            delivery_tag: delivery.delivery_tag,
        })));

        if let Err(e) = Self::register_settlement(context, &handle) {
            if let Some(held) = take_handle(&handle) {
                held.client.nack(held.delivery_tag, true).await?;
            }
            return Err(e);
        }

        Ok(Some(delivery.message))
    }
}

#[cfg(test)]
#[path = "ack_tests.rs"]
mod tests;
