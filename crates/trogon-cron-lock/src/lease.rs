use std::time::Duration;

use tokio::sync::oneshot;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::{owner::owner_token, registry::LockRegistry, traits::LockBackend};

/// Fraction of the TTL after which the watchdog renews a lease.
const RENEW_RATIO: f64 = 0.8;
const MIN_RENEW_INTERVAL: Duration = Duration::from_millis(10);

/// Ownership of one named lock.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Lease {
    pub name: String,
    pub token: String,
    pub ttl: Duration,
}

/// Outcome of [`LeaseLock::try_acquire`].
#[derive(Debug)]
pub enum Acquisition {
    Acquired(Lease),
    /// Someone else holds the lock. Expected, not an error.
    Contended,
    /// The backend could not be reached or the lock is shut down.
    Unavailable(String),
}

impl Acquisition {
    pub fn into_lease(self) -> Option<Lease> {
        match self {
            Self::Acquired(lease) => Some(lease),
            Self::Contended | Self::Unavailable(_) => None,
        }
    }
}

/// Distributed mutex with a per-lease renewal loop ("watchdog").
///
/// Every successful acquisition spawns a Tokio task that re-extends the TTL
/// at `0.8 × ttl` for as long as the stored value is still this lease's
/// token. Release or delete cancels the loop.
#[derive(Clone)]
pub struct LeaseLock<B: LockBackend> {
    backend: B,
    registry: LockRegistry,
}

impl<B: LockBackend> LeaseLock<B> {
    pub fn new(backend: B) -> Self {
        Self {
            backend,
            registry: LockRegistry::new(),
        }
    }

    /// Take `name` for `ttl`. `None` when held elsewhere or the backend is down.
    pub async fn acquire(&self, name: &str, ttl: Duration) -> Option<Lease> {
        self.try_acquire(name, ttl).await.into_lease()
    }

    /// Like [`acquire`](Self::acquire), but tells contention apart from an
    /// unreachable backend.
    pub async fn try_acquire(&self, name: &str, ttl: Duration) -> Acquisition {
        if self.registry.is_closed() {
            return Acquisition::Unavailable("lock is shut down".to_string());
        }
        if ttl.is_zero() {
            return Acquisition::Unavailable("lease ttl must be non-zero".to_string());
        }

        let token = owner_token();
        match self.backend.set_if_absent(name, &token, ttl).await {
            Ok(true) => {}
            Ok(false) => return Acquisition::Contended,
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock backend unavailable during acquire");
                return Acquisition::Unavailable(e.to_string());
            }
        }

        let lease = Lease {
            name: name.to_string(),
            token,
            ttl,
        };
        let (cancel_tx, cancel_rx) = oneshot::channel();
        if !self.registry.register(name, &lease.token, cancel_tx) {
            // Shut down between the backend write and registration.
            let _ = self.backend.compare_delete(name, &lease.token).await;
            return Acquisition::Unavailable("lock is shut down".to_string());
        }
        tokio::spawn(watchdog(
            self.backend.clone(),
            self.registry.clone(),
            lease.clone(),
            cancel_rx,
        ));
        debug!(lock = %name, owner = %lease.token, ttl_ms = ttl.as_millis(), "Lock acquired");
        Acquisition::Acquired(lease)
    }

    /// Delete `name` if `token` still owns it, stopping its watchdog.
    ///
    /// The watchdog of `token` stops even when the delete fails, so an
    /// undeletable lease runs out on its own.
    pub async fn release(&self, name: &str, token: &str) -> bool {
        match self.backend.compare_delete(name, token).await {
            Ok(true) => {
                self.registry.cancel(name);
                debug!(lock = %name, "Lock released");
                true
            }
            Ok(false) => {
                self.registry.forget_if_owned(name, token);
                false
            }
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock backend unavailable during release");
                self.registry.forget_if_owned(name, token);
                false
            }
        }
    }

    /// Delete `name` whoever holds it.
    ///
    /// Built on the compare-and-delete primitive: the value observed by `get`
    /// is the one deleted, so a lock re-taken in between survives and this
    /// returns `false`.
    pub async fn delete(&self, name: &str) -> bool {
        let current = match self.backend.get(name).await {
            Ok(Some(current)) => current,
            Ok(None) => return false,
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock backend unavailable during delete");
                return false;
            }
        };
        match self.backend.compare_delete(name, &current).await {
            Ok(true) => {
                self.registry.cancel(name);
                debug!(lock = %name, owner = %current, "Lock deleted");
                true
            }
            Ok(false) => false,
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock backend unavailable during delete");
                false
            }
        }
    }

    /// Raw owner value stored under `name`.
    pub async fn peek(&self, name: &str) -> Option<String> {
        match self.backend.get(name).await {
            Ok(value) => value,
            Err(e) => {
                warn!(lock = %name, error = %e, "Lock backend unavailable during peek");
                None
            }
        }
    }

    /// Locks whose watchdog runs in this process. Not a fleet-wide view.
    pub fn list(&self) -> Vec<String> {
        self.registry.names()
    }

    /// Stop taking new leases, delete every lock this process renews and
    /// cancel any watchdog left over.
    pub async fn shutdown(&self) {
        self.registry.close();
        for name in self.registry.names() {
            if !self.delete(&name).await {
                warn!(lock = %name, "Failed to delete lock during shutdown");
            }
        }
        let leftover = self.registry.cancel_all();
        if leftover > 0 {
            debug!(count = leftover, "Cancelled remaining watchdogs");
        }
    }
}

fn renew_interval(ttl: Duration) -> Duration {
    ttl.mul_f64(RENEW_RATIO).max(MIN_RENEW_INTERVAL)
}

async fn watchdog<B: LockBackend>(
    backend: B,
    registry: LockRegistry,
    lease: Lease,
    mut cancel: oneshot::Receiver<()>,
) {
    let period = renew_interval(lease.ttl);
    let mut ticker = tokio::time::interval_at(Instant::now() + period, period);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    loop {
        tokio::select! {
            biased;
            // A dropped sender counts as cancellation too.
            _ = &mut cancel => return,
            _ = ticker.tick() => {}
        }

        let renewed = tokio::select! {
            biased;
            _ = &mut cancel => return,
            renewed = backend.compare_extend(&lease.name, &lease.token, lease.ttl) => renewed,
        };

        match renewed {
            Ok(true) => debug!(lock = %lease.name, "Lease renewed"),
            Ok(false) => {
                info!(lock = %lease.name, owner = %lease.token, "Lease no longer held, stopping watchdog");
                registry.forget_if_owned(&lease.name, &lease.token);
                return;
            }
            Err(e) => warn!(lock = %lease.name, error = %e, "Lease renewal failed"),
        }
    }
}
