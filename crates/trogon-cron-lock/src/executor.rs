use std::any::Any;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde_json::Value;

use crate::{
    lease::{Acquisition, LeaseLock},
    results::ResultCache,
    task::Task,
    traits::LockBackend,
};

/// Everything one firing needs, cloned into every spawned firing.
pub(crate) struct Firing<B: LockBackend> {
    pub task: Arc<Task>,
    pub lock: Option<LeaseLock<B>>,
    pub results: ResultCache,
    /// Cleared by `Scheduler::stop`; late firings then leave no trace.
    pub active: Arc<AtomicBool>,
}

impl<B: LockBackend> Clone for Firing<B> {
    fn clone(&self) -> Self {
        Self {
            task: Arc::clone(&self.task),
            lock: self.lock.clone(),
            results: self.results.clone(),
            active: Arc::clone(&self.active),
        }
    }
}

impl<B: LockBackend> Firing<B> {
    fn is_active(&self) -> bool {
        self.active.load(Ordering::SeqCst)
    }

    /// Run one firing: lock if required, execute, release, keep the result.
    ///
    /// Never panics and never returns an error: executor panics are logged,
    /// a contended lock skips the firing.
    pub async fn run(self) {
        let task = &self.task;
        if !self.is_active() {
            return;
        }

        let output = match (&self.lock, task.should_lock) {
            (Some(lock), true) => match lock.try_acquire(&task.name, task.lock_expire).await {
                Acquisition::Acquired(lease) => {
                    let output = run_executor(task).await;
                    if !lock.release(&lease.name, &lease.token).await {
                        tracing::warn!(task = %task.name, owner = %lease.token, "Failed to release task lock");
                    }
                    output
                }
                Acquisition::Contended => {
                    tracing::debug!(task = %task.name, "Skipping firing, lock held by another instance");
                    return;
                }
                Acquisition::Unavailable(reason) => {
                    tracing::warn!(task = %task.name, reason = %reason, "Skipping firing, lock unavailable");
                    return;
                }
            },
            _ => run_executor(task).await,
        };

        if let Some(value) = output {
            if task.result_capacity > 0 && self.is_active() {
                self.results.push(&task.name, value, task.result_capacity);
            }
        }
    }
}

async fn run_executor(task: &Task) -> Option<Value> {
    let executor = Arc::clone(&task.executor);
    match tokio::task::spawn_blocking(move || executor()).await {
        Ok(output) => output,
        Err(e) if e.is_panic() => {
            tracing::error!(task = %task.name, panic = %panic_message(e.into_panic().as_ref()), "Cron task panicked");
            None
        }
        Err(e) => {
            tracing::error!(task = %task.name, error = %e, "Cron task was cancelled");
            None
        }
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(msg) = payload.downcast_ref::<&str>() {
        (*msg).to_string()
    } else if let Some(msg) = payload.downcast_ref::<String>() {
        msg.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
