//! Ambient transaction tracking.
//!
//! The ambient transaction follows the logical flow of a task across `.await`
//! points. Spawned tasks do not inherit it; callers that hand work to another
//! task pass the context explicitly and re-enter it with
//! [`TransactionContext::scope`].

use crate::transaction::TransactionContext;
use std::future::Future;

tokio::task_local! {
    static CURRENT: Option<TransactionContext>;
}

/// Transaction in effect for the current task, if any
pub fn current() -> Option<TransactionContext> {
    CURRENT.try_with(|current| current.clone()).ok().flatten()
}

/// Run `fut` with no ambient transaction
///
/// Callers inside that resolve their transaction through [`current`] get
/// `None`, so a send they pass it to goes out immediately instead of joining
/// the surrounding transaction.
pub async fn suppress<F>(fut: F) -> F::Output
where
    F: Future,
{
    CURRENT.scope(None, fut).await
}

/// Synchronous counterpart of [`suppress`]
pub fn suppress_sync<R>(f: impl FnOnce() -> R) -> R {
    CURRENT.sync_scope(None, f)
}

impl TransactionContext {
    /// Transaction in effect for the current task, if any
    pub fn current() -> Option<TransactionContext> {
        current()
    }

    /// Run `fut` with this context as the ambient transaction
    ///
    /// The previous ambient transaction is restored when `fut` finishes,
    /// including when it is dropped early.
    pub async fn scope<F>(&self, fut: F) -> F::Output
    where
        F: Future,
    {
        CURRENT.scope(Some(self.clone()), fut).await
    }

    /// Synchronous counterpart of [`TransactionContext::scope`]
    pub fn sync_scope<R>(&self, f: impl FnOnce() -> R) -> R {
        CURRENT.sync_scope(Some(self.clone()), f)
    }

    /// Check whether this context is the ambient transaction
    pub fn is_current(&self) -> bool {
        current().is_some_and(|current| current.same_as(self))
    }
}

#[cfg(test)]
#[path = "ambient_tests.rs"]
mod tests;
