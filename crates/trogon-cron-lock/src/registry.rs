use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tokio::sync::oneshot;

/// Cancellation side of one running watchdog.
///
/// Sending on (or dropping) `cancel` stops the loop.
struct RenewalHandle {
    token: String,
    cancel: oneshot::Sender<()>,
}

#[derive(Default)]
struct Inner {
    handles: HashMap<String, RenewalHandle>,
    closed: bool,
}

/// Leases this process is currently renewing, keyed by lock name.
///
/// This is a process-local view: it knows nothing about locks held by other
/// scheduler instances in the fleet.
#[derive(Clone, Default)]
pub struct LockRegistry {
    inner: Arc<Mutex<Inner>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Track a watchdog for `name`. Returns `false` once the registry is closed,
    /// in which case the sender is dropped and the loop ends immediately.
    ///
    /// A previous handle under the same name is replaced and its loop cancelled.
    pub(crate) fn register(&self, name: &str, token: &str, cancel: oneshot::Sender<()>) -> bool {
        let mut inner = self.lock();
        if inner.closed {
            return false;
        }
        let previous = inner.handles.insert(
            name.to_string(),
            RenewalHandle {
                token: token.to_string(),
                cancel,
            },
        );
        if let Some(previous) = previous {
            let _ = previous.cancel.send(());
        }
        true
    }

    /// Stop and forget the watchdog for `name`. Returns `true` if one was running.
    pub(crate) fn cancel(&self, name: &str) -> bool {
        let handle = self.lock().handles.remove(name);
        match handle {
            Some(handle) => {
                let _ = handle.cancel.send(());
                true
            }
            None => false,
        }
    }

    /// Forget `name` only if it is still registered for `token`.
    ///
    /// Used when a lease is found gone or cannot be released; a newer lease for
    /// the same name must not be touched.
    pub(crate) fn forget_if_owned(&self, name: &str, token: &str) -> bool {
        let mut inner = self.lock();
        if inner.handles.get(name).is_some_and(|h| h.token == token) {
            inner.handles.remove(name);
            true
        } else {
            false
        }
    }

    /// Refuse further registrations.
    pub(crate) fn close(&self) {
        self.lock().closed = true;
    }

    pub fn is_closed(&self) -> bool {
        self.lock().closed
    }

    /// Cancel every remaining watchdog.
    pub(crate) fn cancel_all(&self) -> usize {
        let handles: Vec<RenewalHandle> = self.lock().handles.drain().map(|(_, h)| h).collect();
        let count = handles.len();
        for handle in handles {
            let _ = handle.cancel.send(());
        }
        count
    }

    /// Names with a running watchdog, sorted.
    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.lock().handles.keys().cloned().collect();
        names.sort();
        names
    }

    pub fn len(&self) -> usize {
        self.lock().handles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.lock().handles.is_empty()
    }
}
