//! Per-transaction item bag.

use crate::error::{BusError, ValidationError};
use std::any::Any;
use std::collections::HashMap;
use std::sync::{Arc, Mutex, PoisonError};

type Item = Arc<dyn Any + Send + Sync>;

/// Typed key/value bag scoped to one transaction
///
/// Collaborators use it to stash per-transaction state exactly once without
/// threading it through every call. Values are shared as `Arc<T>`; interior
/// mutability is up to the stored type.
#[derive(Default)]
pub struct TransactionItems {
    items: Mutex<HashMap<String, Item>>,
}

impl TransactionItems {
    pub fn new() -> Self {
        Self::default()
    }

    /// Get the item stored under `key`, creating it if absent
    ///
    /// Also reports whether this call created the item, which lets the caller
    /// perform one-time setup (such as registering a callback) exactly once.
    ///
    /// # Errors
    ///
    /// Returns `BusError::Validation` if an item of a different type is
    /// already stored under `key`.
    pub fn entry<T, F>(&self, key: &str, create: F) -> Result<(Arc<T>, bool), BusError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);

        if let Some(existing) = items.get(key) {
            let typed = Arc::clone(existing)
                .downcast::<T>()
                .map_err(|_| Self::type_mismatch(key))?;
            return Ok((typed, false));
        }

        let created = Arc::new(create());
        items.insert(key.to_string(), Arc::clone(&created) as Item);
        Ok((created, true))
    }

    /// Get the item stored under `key`, creating it if absent
    pub fn get_or_add<T, F>(&self, key: &str, create: F) -> Result<Arc<T>, BusError>
    where
        T: Any + Send + Sync,
        F: FnOnce() -> T,
    {
        self.entry(key, create).map(|(item, _)| item)
    }

    /// Get the item stored under `key` if it exists and has type `T`
    pub fn get<T>(&self, key: &str) -> Option<Arc<T>>
    where
        T: Any + Send + Sync,
    {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items
            .get(key)
            .and_then(|item| Arc::clone(item).downcast::<T>().ok())
    }

    /// Store `value` under `key`, replacing any previous item
    pub fn insert<T>(&self, key: &str, value: T)
    where
        T: Any + Send + Sync,
    {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.insert(key.to_string(), Arc::new(value));
    }

    /// Remove the item stored under `key`, reporting whether one existed
    pub fn remove(&self, key: &str) -> bool {
        let mut items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.remove(key).is_some()
    }

    pub fn contains(&self, key: &str) -> bool {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.contains_key(key)
    }

    pub fn len(&self) -> usize {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn type_mismatch(key: &str) -> BusError {
        BusError::Validation(ValidationError::InvalidFormat {
            field: key.to_string(),
            message: "transaction item exists with a different type".to_string(),
        })
    }
}

impl std::fmt::Debug for TransactionItems {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let items = self.items.lock().unwrap_or_else(PoisonError::into_inner);
        let mut keys: Vec<&String> = items.keys().collect();
        keys.sort();
        f.debug_struct("TransactionItems").field("keys", &keys).finish()
    }
}

#[cfg(test)]
#[path = "items_tests.rs"]
mod tests;
