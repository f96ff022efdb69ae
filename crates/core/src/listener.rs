//! Subscriber registry shared by tasks, services and monitors.

use crate::id::ListenerId;
use std::any::Any;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tracing::error;

/// Callback stored in a [`Listeners`] registry.
pub type Callback<E> = Arc<dyn Fn(&E) + Send + Sync>;

/// Ordered set of subscriber callbacks.
///
/// Callbacks run in subscription order. A panicking callback is caught and
/// logged; the remaining callbacks still run.
pub struct Listeners<E> {
    entries: Mutex<Vec<(ListenerId, Callback<E>)>>,
}

impl<E> Listeners<E> {
    /// Create an empty registry.
    pub fn new() -> Self {
        Self {
            entries: Mutex::new(Vec::new()),
        }
    }

    fn entries(&self) -> MutexGuard<'_, Vec<(ListenerId, Callback<E>)>> {
        self.entries.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a callback.
    pub fn add<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&E) + Send + Sync + 'static,
    {
        let id = ListenerId::next();
        self.entries().push((id, Arc::new(callback)));
        id
    }

    /// Remove a callback. Returns false if it was not registered.
    pub fn remove(&self, id: ListenerId) -> bool {
        let mut entries = self.entries();
        let before = entries.len();
        entries.retain(|(entry, _)| *entry != id);
        entries.len() != before
    }

    /// Number of registered callbacks.
    pub fn len(&self) -> usize {
        self.entries().len()
    }

    /// Whether no callback is registered.
    pub fn is_empty(&self) -> bool {
        self.entries().is_empty()
    }

    /// Deliver `event` to every callback. Returns the number that panicked.
    ///
    /// The registry lock is not held while callbacks run, so a callback may
    /// subscribe or unsubscribe.
    pub fn emit(&self, event: &E) -> usize {
        let snapshot: Vec<(ListenerId, Callback<E>)> = self.entries().clone();
        let mut failures = 0;
        for (id, callback) in snapshot {
            if let Err(payload) = catch_unwind(AssertUnwindSafe(|| callback(event))) {
                failures += 1;
                error!("Listener {} panicked: {}", id, panic_message(payload.as_ref()));
            }
        }
        failures
    }
}

impl<E> Default for Listeners<E> {
    fn default() -> Self {
        Self::new()
    }
}

impl<E> std::fmt::Debug for Listeners<E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Listeners").field("len", &self.len()).finish()
    }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
