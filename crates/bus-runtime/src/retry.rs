//! # Retry Module
//!
//! Masks transient backend faults by re-running an operation according to a
//! fixed sequence of waits.
//!
//! A [`Retrier`] carries an ordered list of wait durations and a set of
//! acceptors. An error is retried only when an acceptor recognizes it, and
//! each retry consumes the next wait in the list. Waits are never recomputed
//! and never reset within one [`Retrier::execute`] call, so a retrier with
//! three waits makes at most four attempts.

use crate::error::BusError;
use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tracing::warn;

/// Recognizes one kind of retryable error
pub struct Acceptor<E> {
    kind: &'static str,
    predicate: Arc<dyn Fn(&E) -> bool + Send + Sync>,
}

impl<E> Acceptor<E> {
    /// Label of the error kind this acceptor recognizes
    pub fn kind(&self) -> &'static str {
        self.kind
    }

    fn accepts(&self, error: &E) -> bool {
        (self.predicate)(error)
    }
}

impl<E> Clone for Acceptor<E> {
    fn clone(&self) -> Self {
        Self {
            kind: self.kind,
            predicate: Arc::clone(&self.predicate),
        }
    }
}

/// Retry helper with an ordered wait sequence and an error allow-list
///
/// # Examples
///
/// ```rust
/// use bus_runtime::error::BusError;
/// use bus_runtime::retry::Retrier;
/// use std::time::Duration;
///
/// let retrier = Retrier::<BusError>::new(vec![Duration::from_millis(10); 3])
///     .accept("connection", |e| matches!(e, BusError::ConnectionFailed { .. }));
///
/// assert_eq!(retrier.max_attempts(), 4);
/// ```
pub struct Retrier<E = BusError> {
    waits: Vec<Duration>,
    acceptors: Vec<Acceptor<E>>,
}

impl<E> Clone for Retrier<E> {
    fn clone(&self) -> Self {
        Self {
            waits: self.waits.clone(),
            acceptors: self.acceptors.clone(),
        }
    }
}

impl<E> std::fmt::Debug for Retrier<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Retrier")
            .field("waits", &self.waits)
            .field(
                "acceptors",
                &self.acceptors.iter().map(|a| a.kind).collect::<Vec<_>>(),
            )
            .finish()
    }
}

impl<E> Retrier<E> {
    /// Create a retrier with the given waits and no acceptors
    pub fn new(waits: Vec<Duration>) -> Self {
        Self {
            waits,
            acceptors: Vec::new(),
        }
    }

    /// Create a retrier that never retries
    pub fn none() -> Self {
        Self::new(Vec::new())
    }

    /// Add an acceptor for one kind of error
    pub fn accept<P>(mut self, kind: &'static str, predicate: P) -> Self
    where
        P: Fn(&E) -> bool + Send + Sync + 'static,
    {
        self.acceptors.push(Acceptor {
            kind,
            predicate: Arc::new(predicate),
        });
        self
    }

    pub fn waits(&self) -> &[Duration] {
        &self.waits
    }

    /// Upper bound on attempts made by one `execute` call
    pub fn max_attempts(&self) -> usize {
        self.waits.len() + 1
    }

    /// Run `operation`, retrying accepted errors until the waits run out
    pub async fn execute<T, F, Fut>(&self, mut operation: F) -> Result<T, E>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = Result<T, E>>,
        E: Display,
    {
        let mut waits = self.waits.iter();
        let mut attempt: u32 = 1;

        loop {
            let error = match operation().await {
                Ok(value) => return Ok(value),
                Err(error) => error,
            };

            let Some(acceptor) = self.acceptors.iter().find(|a| a.accepts(&error)) else {
                return Err(error);
            };

            let Some(wait) = waits.next() else {
                warn!(
                    attempt = attempt,
                    kind = acceptor.kind,
                    error = %error,
                    "Retries exhausted"
                );
                return Err(error);
            };

            warn!(
                attempt = attempt,
                kind = acceptor.kind,
                delay_ms = wait.as_millis() as u64,
                error = %error,
                "Retrying after accepted failure"
            );
            drop(error);

            tokio::time::sleep(*wait).await;
            attempt += 1;
        }
    }
}

impl Retrier<BusError> {
    /// Create a retrier accepting every error that reports itself as transient
    pub fn transient(waits: Vec<Duration>) -> Self {
        Self::new(waits).accept("transient", BusError::is_transient)
    }
}

/// Precompute an exponential wait sequence
///
/// Wait `n` (0-based) is `initial * multiplier^n`, capped at `max`.
///
/// # Examples
///
/// ```rust
/// use bus_runtime::retry::backoff_waits;
/// use std::time::Duration;
///
/// let waits = backoff_waits(4, Duration::from_millis(100), Duration::from_millis(300), 2.0);
/// assert_eq!(
///     waits,
///     vec![
///         Duration::from_millis(100),
///         Duration::from_millis(200),
///         Duration::from_millis(300),
///         Duration::from_millis(300),
///     ]
/// );
/// ```
pub fn backoff_waits(count: u32, initial: Duration, max: Duration, multiplier: f64) -> Vec<Duration> {
    (0..count)
        .map(|attempt| {
            let secs = initial.as_secs_f64() * multiplier.powi(attempt as i32);
            // NaN and infinity fail `secs < max` and land on `max`.
            if !(secs < max.as_secs_f64()) {
                max
            } else {
                Duration::try_from_secs_f64(secs).unwrap_or(Duration::ZERO)
            }
        })
        .collect()
}

#[cfg(test)]
#[path = "retry_tests.rs"]
mod tests;
