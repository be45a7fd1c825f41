//! Transaction context lifecycle.
//!
//! A [`TransactionContext`] collects asynchronous callbacks for five lifecycle
//! points and fires them in a fixed order:
//!
//! 1. commit **or** rollback, chosen by the commit flag
//! 2. ack **or** nack, chosen by the ack flag
//! 3. disposed, always, exactly once
//!
//! The context moves through `Open → Completing → Completed → Disposed` and
//! never moves backwards. Dispose takes the rollback or nack side of any
//! branch that has not fired yet, whether `complete()` never ran or its
//! future was dropped part way, before its dispose callbacks run.

use crate::error::BusError;
use crate::message::BusId;
use crate::transaction::items::TransactionItems;
use std::future::Future;
use std::pin::Pin;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::{debug, error, warn};

/// Future returned by a lifecycle callback
pub type CallbackFuture = Pin<Box<dyn Future<Output = Result<(), BusError>> + Send>>;

type Callback = Box<dyn FnOnce(TransactionContext) -> CallbackFuture + Send>;

/// Outcome of the commit decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Resolution {
    Commit,
    Rollback,
}

/// Outcome of the acknowledgement decision
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Acknowledgement {
    Ack,
    Nack,
}

/// Lifecycle state of a transaction context
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransactionState {
    /// Accepting work and callbacks
    Open,
    /// `complete()` is firing callbacks
    Completing,
    /// Commit/rollback and ack/nack have fired
    Completed,
    /// Dispose callbacks have fired
    Disposed,
}

impl TransactionState {
    fn name(&self) -> &'static str {
        match self {
            Self::Open => "open",
            Self::Completing => "completing",
            Self::Completed => "completed",
            Self::Disposed => "disposed",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Commit,
    Rollback,
    Ack,
    Nack,
    Disposed,
}

impl Phase {
    fn name(&self) -> &'static str {
        match self {
            Self::Commit => "commit",
            Self::Rollback => "rollback",
            Self::Ack => "ack",
            Self::Nack => "nack",
            Self::Disposed => "disposed",
        }
    }

    /// Whether the remaining callbacks still run after one fails
    ///
    /// Rollback and dispose release resources, so one failure must not
    /// strand the callbacks queued behind it.
    fn continues_after_failure(&self) -> bool {
        matches!(self, Self::Rollback | Self::Disposed)
    }
}

impl From<Resolution> for Phase {
    fn from(resolution: Resolution) -> Self {
        match resolution {
            Resolution::Commit => Phase::Commit,
            Resolution::Rollback => Phase::Rollback,
        }
    }
}

impl From<Acknowledgement> for Phase {
    fn from(acknowledgement: Acknowledgement) -> Self {
        match acknowledgement {
            Acknowledgement::Ack => Phase::Ack,
            Acknowledgement::Nack => Phase::Nack,
        }
    }
}

struct Lifecycle {
    state: TransactionState,
    resolution: Resolution,
    acknowledgement: Acknowledgement,
    resolution_fired: Option<Resolution>,
    acknowledgement_fired: Option<Acknowledgement>,
    disposed_fired: bool,
    owner: Option<BusId>,
    on_commit: Vec<Callback>,
    on_rollback: Vec<Callback>,
    on_ack: Vec<Callback>,
    on_nack: Vec<Callback>,
    on_disposed: Vec<Callback>,
}

impl Lifecycle {
    fn new() -> Self {
        Self {
            state: TransactionState::Open,
            resolution: Resolution::Commit,
            acknowledgement: Acknowledgement::Ack,
            resolution_fired: None,
            acknowledgement_fired: None,
            disposed_fired: false,
            owner: None,
            on_commit: Vec::new(),
            on_rollback: Vec::new(),
            on_ack: Vec::new(),
            on_nack: Vec::new(),
            on_disposed: Vec::new(),
        }
    }

    fn is_closed(&self, phase: Phase) -> bool {
        match phase {
            Phase::Commit | Phase::Rollback => self.resolution_fired.is_some(),
            Phase::Ack | Phase::Nack => self.acknowledgement_fired.is_some(),
            Phase::Disposed => self.disposed_fired,
        }
    }

    fn callbacks_mut(&mut self, phase: Phase) -> &mut Vec<Callback> {
        match phase {
            Phase::Commit => &mut self.on_commit,
            Phase::Rollback => &mut self.on_rollback,
            Phase::Ack => &mut self.on_ack,
            Phase::Nack => &mut self.on_nack,
            Phase::Disposed => &mut self.on_disposed,
        }
    }

    /// Mark the commit decision as fired and hand out its callbacks
    ///
    /// The losing branch is cleared so its callbacks are released too.
    fn fire_resolution(&mut self, resolution: Resolution) -> Vec<Callback> {
        self.resolution_fired = Some(resolution);
        let (fired, dropped) = match resolution {
            Resolution::Commit => (&mut self.on_commit, &mut self.on_rollback),
            Resolution::Rollback => (&mut self.on_rollback, &mut self.on_commit),
        };
        dropped.clear();
        std::mem::take(fired)
    }

    fn fire_acknowledgement(&mut self, acknowledgement: Acknowledgement) -> Vec<Callback> {
        self.acknowledgement_fired = Some(acknowledgement);
        let (fired, dropped) = match acknowledgement {
            Acknowledgement::Ack => (&mut self.on_ack, &mut self.on_nack),
            Acknowledgement::Nack => (&mut self.on_nack, &mut self.on_ack),
        };
        dropped.clear();
        std::mem::take(fired)
    }
}

struct Inner {
    id: String,
    lifecycle: Mutex<Lifecycle>,
    items: TransactionItems,
    /// Set on the context rebuilt by the drop safety net so it never respawns
    orphan: bool,
}

impl Drop for Inner {
    fn drop(&mut self) {
        let lifecycle = self
            .lifecycle
            .get_mut()
            .unwrap_or_else(PoisonError::into_inner);
        if lifecycle.disposed_fired {
            return;
        }
        if self.orphan {
            error!(
                transaction_id = %self.id,
                "Background dispose of dropped transaction never ran"
            );
            return;
        }

        warn!(
            transaction_id = %self.id,
            state = lifecycle.state.name(),
            "Transaction context dropped without dispose; running abort in the background"
        );

        // Callbacks receive a context handle, so move the remaining state into
        // a fresh context and dispose that one instead.
        let orphan = TransactionContext {
            inner: Arc::new(Inner {
                id: self.id.clone(),
                lifecycle: Mutex::new(std::mem::replace(lifecycle, Lifecycle::new())),
                items: std::mem::take(&mut self.items),
                orphan: true,
            }),
        };

        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                handle.spawn(async move {
                    if let Err(e) = orphan.dispose().await {
                        error!(
                            transaction_id = %orphan.id(),
                            error = %e,
                            "Background dispose of dropped transaction failed"
                        );
                    }
                });
            }
            Err(_) => {
                // Without a runtime nothing can be awaited; the callbacks are
                // dropped and any broker locks lapse on their own.
                // The orphan logs the failure as it drops.
                drop(orphan);
            }
        }
    }
}

/// Unit-of-work scope with ordered commit/rollback/ack/nack/dispose callbacks
///
/// Cloning yields another handle to the same transaction.
///
/// # Examples
///
/// ```rust
/// use bus_runtime::transaction::TransactionContext;
/// use std::sync::atomic::{AtomicBool, Ordering};
/// use std::sync::Arc;
///
/// # tokio_test::block_on(async {
/// let committed = Arc::new(AtomicBool::new(false));
/// let context = TransactionContext::new();
///
/// let flag = committed.clone();
/// context.on_commit(move |_| async move {
///     flag.store(true, Ordering::SeqCst);
///     Ok(())
/// })?;
///
/// context.complete().await?;
/// context.dispose().await?;
/// assert!(committed.load(Ordering::SeqCst));
/// # Ok::<(), bus_runtime::BusError>(())
/// # });
/// ```
#[derive(Clone)]
pub struct TransactionContext {
    inner: Arc<Inner>,
}

impl Default for TransactionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl TransactionContext {
    /// Create a new open transaction
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Inner {
                id: uuid::Uuid::new_v4().to_string(),
                lifecycle: Mutex::new(Lifecycle::new()),
                items: TransactionItems::new(),
                orphan: false,
            }),
        }
    }

    /// Unique identifier, for logging
    pub fn id(&self) -> &str {
        &self.inner.id
    }

    /// Bag of per-transaction items
    pub fn items(&self) -> &TransactionItems {
        &self.inner.items
    }

    pub fn state(&self) -> TransactionState {
        self.lifecycle().state
    }

    /// Outcome pair `(commit, ack)` that `complete()` will act on
    pub fn result(&self) -> (bool, bool) {
        let lifecycle = self.lifecycle();
        (
            lifecycle.resolution == Resolution::Commit,
            lifecycle.acknowledgement == Acknowledgement::Ack,
        )
    }

    /// Branches that have fired so far
    pub fn fired(&self) -> (Option<Resolution>, Option<Acknowledgement>) {
        let lifecycle = self.lifecycle();
        (lifecycle.resolution_fired, lifecycle.acknowledgement_fired)
    }

    /// Check whether two handles refer to the same transaction
    pub fn same_as(&self, other: &TransactionContext) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }

    fn lifecycle(&self) -> MutexGuard<'_, Lifecycle> {
        self.inner
            .lifecycle
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // ------------------------------------------------------------------------
    // Callback registration
    // ------------------------------------------------------------------------

    /// Register a callback run when the transaction commits
    pub fn on_commit<F, Fut>(&self, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.register(Phase::Commit, callback)
    }

    /// Register a callback run when the transaction rolls back
    pub fn on_rollback<F, Fut>(&self, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.register(Phase::Rollback, callback)
    }

    /// Register a callback run when the received message is acknowledged
    pub fn on_ack<F, Fut>(&self, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.register(Phase::Ack, callback)
    }

    /// Register a callback run when the received message is rejected
    pub fn on_nack<F, Fut>(&self, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.register(Phase::Nack, callback)
    }

    /// Register a callback run when the transaction is disposed
    pub fn on_disposed<F, Fut>(&self, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        self.register(Phase::Disposed, callback)
    }

    fn register<F, Fut>(&self, phase: Phase, callback: F) -> Result<(), BusError>
    where
        F: FnOnce(TransactionContext) -> Fut + Send + 'static,
        Fut: Future<Output = Result<(), BusError>> + Send + 'static,
    {
        let mut lifecycle = self.lifecycle();
        if lifecycle.is_closed(phase) {
            return Err(BusError::CallbackPhaseClosed {
                phase: phase.name(),
            });
        }

        let boxed: Callback = Box::new(move |context| Box::pin(callback(context)));
        lifecycle.callbacks_mut(phase).push(boxed);
        Ok(())
    }

    // ------------------------------------------------------------------------
    // Outcome
    // ------------------------------------------------------------------------

    /// Override the outcome `complete()` acts on
    ///
    /// `set_result(true, false)` commits the work but rejects the received
    /// message so it is redelivered; `set_result(false, true)` discards the
    /// work but consumes the message.
    pub fn set_result(&self, commit: bool, ack: bool) -> Result<(), BusError> {
        let mut lifecycle = self.lifecycle();
        if lifecycle.state != TransactionState::Open {
            return Err(BusError::TransactionClosed {
                state: lifecycle.state.name(),
                operation: "set_result",
            });
        }

        lifecycle.resolution = if commit {
            Resolution::Commit
        } else {
            Resolution::Rollback
        };
        lifecycle.acknowledgement = if ack {
            Acknowledgement::Ack
        } else {
            Acknowledgement::Nack
        };
        Ok(())
    }

    /// Enlist work on behalf of `bus`
    ///
    /// The first bus to enlist owns the transaction.
    ///
    /// # Errors
    ///
    /// Returns `BusError::TransactionConflict` when a different bus already
    /// owns the transaction; commit ordering across independent transports is
    /// undefined, so they may not share one.
    pub fn enlist(&self, bus: &BusId) -> Result<(), BusError> {
        let mut lifecycle = self.lifecycle();
        match &lifecycle.owner {
            Some(owner) if owner != bus => Err(BusError::TransactionConflict {
                owner: owner.to_string(),
                intruder: bus.to_string(),
            }),
            Some(_) => Ok(()),
            None => {
                lifecycle.owner = Some(bus.clone());
                Ok(())
            }
        }
    }

    /// Bus that owns the transaction, if any work was enlisted
    pub fn owner(&self) -> Option<BusId> {
        self.lifecycle().owner.clone()
    }

    /// Fire commit-or-rollback, then ack-or-nack
    ///
    /// A second call is a no-op. If a commit callback fails, the remaining
    /// commit callbacks are skipped, the ack decision is switched to nack so
    /// the received message is redelivered, and the commit error is returned.
    pub async fn complete(&self) -> Result<(), BusError> {
        let (resolution, callbacks) = {
            let mut lifecycle = self.lifecycle();
            match lifecycle.state {
                TransactionState::Open => {}
                TransactionState::Completing | TransactionState::Completed => return Ok(()),
                TransactionState::Disposed => {
                    return Err(BusError::TransactionClosed {
                        state: lifecycle.state.name(),
                        operation: "complete",
                    })
                }
            }
            lifecycle.state = TransactionState::Completing;
            let resolution = lifecycle.resolution;
            (resolution, lifecycle.fire_resolution(resolution))
        };

        debug!(
            transaction_id = %self.id(),
            resolution = ?resolution,
            callbacks = callbacks.len(),
            "Completing transaction"
        );
        let resolution_result = self.run_callbacks(resolution.into(), callbacks).await;

        let pending = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.acknowledgement_fired.is_some() {
                // A concurrent dispose already took the nack branch.
                None
            } else {
                let acknowledgement = match (&resolution_result, resolution) {
                    (Err(_), Resolution::Commit) => Acknowledgement::Nack,
                    _ => lifecycle.acknowledgement,
                };
                Some((acknowledgement, lifecycle.fire_acknowledgement(acknowledgement)))
            }
        };
        let acknowledgement_result = match pending {
            Some((acknowledgement, callbacks)) => {
                self.run_callbacks(acknowledgement.into(), callbacks).await
            }
            None => Ok(()),
        };

        {
            let mut lifecycle = self.lifecycle();
            if lifecycle.state == TransactionState::Completing {
                lifecycle.state = TransactionState::Completed;
            }
        }

        resolution_result.and(acknowledgement_result)
    }

    /// Release the transaction
    ///
    /// Any branch that has not fired yet takes its abort side first: rollback
    /// if no commit decision fired, nack if no acknowledgement fired. This
    /// covers a context that was never completed as well as one whose
    /// `complete()` future was dropped part way. Dispose callbacks then run
    /// exactly once; a second call is a no-op. Every dispose callback runs
    /// even if an earlier one fails; the first failure is returned.
    pub async fn dispose(&self) -> Result<(), BusError> {
        let (rollback, nack) = {
            let mut lifecycle = self.lifecycle();
            if lifecycle.disposed_fired {
                return Ok(());
            }

            let rollback = lifecycle
                .resolution_fired
                .is_none()
                .then(|| lifecycle.fire_resolution(Resolution::Rollback));
            let nack = lifecycle
                .acknowledgement_fired
                .is_none()
                .then(|| lifecycle.fire_acknowledgement(Acknowledgement::Nack));
            if lifecycle.state == TransactionState::Open {
                lifecycle.state = TransactionState::Completing;
            }
            (rollback, nack)
        };

        let mut first_error = None;
        if rollback.is_some() || nack.is_some() {
            debug!(
                transaction_id = %self.id(),
                rollback = rollback.is_some(),
                nack = nack.is_some(),
                "Disposing unfinished transaction; aborting pending branches"
            );
        }
        if let Some(rollback) = rollback {
            if let Err(e) = self.run_callbacks(Phase::Rollback, rollback).await {
                first_error.get_or_insert(e);
            }
        }
        if let Some(nack) = nack {
            if let Err(e) = self.run_callbacks(Phase::Nack, nack).await {
                first_error.get_or_insert(e);
            }
        }

        let callbacks = {
            let mut lifecycle = self.lifecycle();
            lifecycle.disposed_fired = true;
            std::mem::take(&mut lifecycle.on_disposed)
        };
        if let Err(e) = self.run_callbacks(Phase::Disposed, callbacks).await {
            first_error.get_or_insert(e);
        }

        self.lifecycle().state = TransactionState::Disposed;

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    async fn run_callbacks(&self, phase: Phase, callbacks: Vec<Callback>) -> Result<(), BusError> {
        let mut first_error = None;

        for callback in callbacks {
            if let Err(e) = callback(self.clone()).await {
                error!(
                    transaction_id = %self.id(),
                    phase = phase.name(),
                    error = %e,
                    "Transaction callback failed"
                );
                if !phase.continues_after_failure() {
                    return Err(e);
                }
                first_error.get_or_insert(e);
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    /// Run `work` in a fresh ambient transaction
    ///
    /// The transaction is completed when `work` succeeds and disposed on every
    /// path, so a failing `work` rolls back and rejects.
    pub async fn execute<T, F, Fut>(work: F) -> Result<T, BusError>
    where
        F: FnOnce(TransactionContext) -> Fut,
        Fut: Future<Output = Result<T, BusError>>,
    {
        let context = TransactionContext::new();
        let outcome = context.scope(work(context.clone())).await;

        let completed = match outcome {
            Ok(value) => context.complete().await.map(|_| value),
            Err(e) => Err(e),
        };
        let disposed = context.dispose().await;

        match (completed, disposed) {
            (Ok(value), Ok(())) => Ok(value),
            (Err(e), _) => Err(e),
            (Ok(_), Err(e)) => Err(e),
        }
    }
}

impl std::fmt::Debug for TransactionContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let lifecycle = self.lifecycle();
        f.debug_struct("TransactionContext")
            .field("id", &self.inner.id)
            .field("state", &lifecycle.state)
            .field("owner", &lifecycle.owner)
            .field("items", &self.inner.items)
            .finish()
    }
}

#[cfg(test)]
#[path = "context_tests.rs"]
mod tests;
