//! Per-queue client cache.

use crate::error::BusError;
use crate::message::QueueAddress;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, warn};

/// Caches one broker client per queue
///
/// Clients that fail with a connection-level fault are evicted so the next
/// operation on that queue connects afresh.
pub struct ClientCache<C> {
    clients: RwLock<HashMap<QueueAddress, Arc<C>>>,
}

impl<C> Default for ClientCache<C> {
    fn default() -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
        }
    }
}

impl<C> ClientCache<C> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the cached client for `queue`, connecting if there is none
    ///
    /// `connect` runs under the write lock, so concurrent callers for the same
    /// queue share one connection attempt.
    pub async fn get_or_connect<F, Fut>(
        &self,
        queue: &QueueAddress,
        connect: F,
    ) -> Result<Arc<C>, BusError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<Arc<C>, BusError>>,
    {
        // First check with read lock
        {
            let clients = self.clients.read().await;
            if let Some(client) = clients.get(queue) {
                return Ok(Arc::clone(client));
            }
        }

        let mut clients = self.clients.write().await;

        // Double-check: another task might have connected meanwhile
        if let Some(client) = clients.get(queue) {
            return Ok(Arc::clone(client));
        }

        let client = connect().await?;
        debug!(queue = %queue, "Cached new broker client");
        clients.insert(queue.clone(), Arc::clone(&client));
        Ok(client)
    }

    /// Drop `failed` from the cache if it is still the client for `queue`
    ///
    /// Returns whether an entry was removed. A client that was already
    /// replaced by a fresh connection is left alone.
    pub async fn evict(&self, queue: &QueueAddress, failed: &Arc<C>) -> bool {
        let mut clients = self.clients.write().await;
        match clients.get(queue) {
            Some(current) if Arc::ptr_eq(current, failed) => {
                clients.remove(queue);
                warn!(queue = %queue, "Evicted faulty broker client");
                true
            }
            _ => false,
        }
    }

    pub async fn contains(&self, queue: &QueueAddress) -> bool {
        self.clients.read().await.contains_key(queue)
    }

    pub async fn len(&self) -> usize {
        self.clients.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.len().await == 0
    }
}

#[cfg(test)]
#[path = "cache_tests.rs"]
mod tests;
