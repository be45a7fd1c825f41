//! In-memory soak run.
//!
//! Sends a batch of messages in committed transactions, then drains them with
//! concurrent receive loops while injecting connection faults and rejecting
//! deliveries. The run fails if any sent message never arrived.

use crate::CliError;
use bus_runtime::{
    AckTransport, BusConfig, BusError, BusId, DeliveryModel, InMemoryAckBroker,
    InMemoryLockingBroker, LockRenewalTransport, QueueAddress, TransactionContext, Transport,
    TransportMessage, TransportSettings,
};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

/// Input queue used when the configuration names none
const DEFAULT_SOAK_QUEUE: &str = "soak";

/// Parameters of a soak run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SoakOptions {
    pub messages: usize,
    pub workers: usize,
    /// Inject a fault and reject a delivery every this many processed messages
    pub fail_every: Option<u32>,
    pub timeout: Duration,
}

impl SoakOptions {
    pub fn validate(&self) -> Result<(), CliError> {
        if self.workers == 0 {
            return Err(CliError::InvalidArgument {
                arg: "--workers".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        if self.fail_every == Some(0) {
            return Err(CliError::InvalidArgument {
                arg: "--fail-every".to_string(),
                message: "must be at least 1".to_string(),
            });
        }

        Ok(())
    }

    fn fails_at(&self, count: u64) -> bool {
        self.fail_every
            .is_some_and(|every| count % u64::from(every) == 0)
    }
}

/// Outcome of a completed soak run
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SoakReport {
    pub delivery_model: DeliveryModel,
    pub sent: u64,
    /// Distinct messages received and completed
    pub received: u64,
    /// Deliveries rejected so the broker had to deliver them again
    pub redelivered: u64,
    /// Messages completed more than once
    pub duplicates: u64,
    pub faults_injected: u64,
}

/// Broker handle used to inject faults
#[derive(Clone)]
enum SoakBroker {
    Locking(InMemoryLockingBroker),
    Ack(InMemoryAckBroker),
}

impl SoakBroker {
    fn fail_next_send(&self) {
        match self {
            Self::Locking(broker) => broker.fail_next_sends(1),
            Self::Ack(broker) => broker.fail_next_sends(1),
        }
    }

    fn fail_next_receive(&self) {
        match self {
            Self::Locking(broker) => broker.fail_next_receives(1),
            Self::Ack(broker) => broker.fail_next_receives(1),
        }
    }
}

#[derive(Default)]
struct SoakState {
    seen: Mutex<HashSet<String>>,
    processed: AtomicU64,
    redelivered: AtomicU64,
    duplicates: AtomicU64,
    faults: AtomicU64,
}

/// Run a soak against the configured delivery model
///
/// # Errors
///
/// Returns `CliError::SoakFailed` if some messages did not arrive before the
/// timeout, and `CliError::Bus` if sending failed after retries.
pub async fn run_soak(config: &BusConfig, options: &SoakOptions) -> Result<SoakReport, CliError> {
    options.validate()?;
    config.validate().map_err(BusError::from)?;

    let mut settings = TransportSettings::from_config(&config.transport)?;
    if settings.input_queue.is_none() {
        settings.input_queue = Some(QueueAddress::new(DEFAULT_SOAK_QUEUE).map_err(BusError::from)?);
    }
    let retrier = config.retry.retrier();

    match config.transport.delivery_model {
        DeliveryModel::LockRenewal => {
            let broker = InMemoryLockingBroker::new();
            let transport =
                LockRenewalTransport::new(BusId::generate(), broker.clone(), settings, retrier);
            drive(transport, SoakBroker::Locking(broker), options).await
        }
        DeliveryModel::Acknowledgment => {
            let broker = InMemoryAckBroker::new();
            let transport = AckTransport::new(BusId::generate(), broker.clone(), settings, retrier);
            drive(transport, SoakBroker::Ack(broker), options).await
        }
    }
}

async fn drive<T>(
    transport: T,
    broker: SoakBroker,
    options: &SoakOptions,
) -> Result<SoakReport, CliError>
where
    T: Transport + Clone + 'static,
{
    transport.initialize().await?;
    let input = transport
        .address()
        .cloned()
        .ok_or_else(|| CliError::SoakFailed {
            message: "transport has no input queue".to_string(),
        })?;

    let state = Arc::new(SoakState::default());

    for index in 0..options.messages {
        if options.fails_at(index as u64 + 1) {
            broker.fail_next_send();
            state.faults.fetch_add(1, Ordering::SeqCst);
        }

        let message = TransportMessage::from_body(format!("soak-{}", index));
        let transport = &transport;
        let input = &input;
        TransactionContext::execute(|context| async move {
            transport.send(input, message, Some(&context)).await
        })
        .await?;
    }
    info!(sent = options.messages, queue = %input, "Soak messages sent");

    let done = CancellationToken::new();
    if options.messages == 0 {
        done.cancel();
    }

    let mut workers = JoinSet::new();
    for worker in 0..options.workers {
        workers.spawn(receive_loop(
            worker,
            transport.clone(),
            broker.clone(),
            Arc::clone(&state),
            options.clone(),
            done.clone(),
        ));
    }

    let drained = tokio::time::timeout(options.timeout, async {
        while let Some(joined) = workers.join_next().await {
            if let Err(e) = joined {
                warn!(error = %e, "Soak worker stopped unexpectedly");
            }
        }
    })
    .await;

    if drained.is_err() {
        warn!(timeout_secs = options.timeout.as_secs(), "Soak run timed out");
        done.cancel();
        while workers.join_next().await.is_some() {}
    }

    let received = state
        .seen
        .lock()
        .unwrap_or_else(PoisonError::into_inner)
        .len() as u64;
    let report = SoakReport {
        delivery_model: transport.delivery_model(),
        sent: options.messages as u64,
        received,
        redelivered: state.redelivered.load(Ordering::SeqCst),
        duplicates: state.duplicates.load(Ordering::SeqCst),
        faults_injected: state.faults.load(Ordering::SeqCst),
    };

    if report.received < report.sent {
        return Err(CliError::SoakFailed {
            message: format!(
                "{} of {} messages were never received",
                report.sent - report.received,
                report.sent
            ),
        });
    }

    info!(
        sent = report.sent,
        received = report.received,
        redelivered = report.redelivered,
        "Soak run complete"
    );
    Ok(report)
}

async fn receive_loop<T: Transport>(
    worker: usize,
    transport: T,
    broker: SoakBroker,
    state: Arc<SoakState>,
    options: SoakOptions,
    done: CancellationToken,
) {
    while !done.is_cancelled() {
        let context = TransactionContext::new();
        let processed =
            process_one(&transport, &broker, &state, &options, &context, &done).await;
        let disposed = context.dispose().await;

        if let Err(e) = processed.and(disposed) {
            warn!(worker, error = %e, "Soak receive failed; continuing");
        }
    }
    debug!(worker, "Soak worker finished");
}

async fn process_one<T: Transport>(
    transport: &T,
    broker: &SoakBroker,
    state: &SoakState,
    options: &SoakOptions,
    context: &TransactionContext,
    done: &CancellationToken,
) -> Result<(), BusError> {
    let Some(message) = transport.receive(context, done).await? else {
        return Ok(());
    };

    let count = state.processed.fetch_add(1, Ordering::SeqCst) + 1;
    if options.fails_at(count) {
        broker.fail_next_receive();
        state.faults.fetch_add(1, Ordering::SeqCst);
        state.redelivered.fetch_add(1, Ordering::SeqCst);
        debug!(
            message_id = message.message_id().unwrap_or("unknown"),
            "Rejecting delivery"
        );
        context.set_result(false, false)?;
        return context.complete().await;
    }

    context.complete().await?;

    let message_id = message.message_id().unwrap_or_default().to_string();
    let mut seen = state.seen.lock().unwrap_or_else(PoisonError::into_inner);
    if !seen.insert(message_id) {
        state.duplicates.fetch_add(1, Ordering::SeqCst);
    }
    if seen.len() >= options.messages {
        done.cancel();
    }
    Ok(())
}

#[cfg(test)]
#[path = "soak_tests.rs"]
mod tests;
