use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;

const NAME_PREFIX: &str = "cron:";

/// Default lease for exclusive tasks when none is given.
pub const DEFAULT_LOCK_EXPIRE: Duration = Duration::from_secs(30);

/// Body of a task. Runs on Tokio's blocking pool; may block or panic.
pub type Executor = Arc<dyn Fn() -> Option<Value> + Send + Sync>;

/// Namespaced form of a task name, used as lock key and result key.
pub fn decorate_name(name: &str) -> String {
    format!("{NAME_PREFIX}{name}")
}

/// A periodic task definition.
#[derive(Clone)]
pub struct Task {
    pub name: String,
    /// Schedule spec understood by [`Trigger`](crate::Trigger).
    pub spec: String,
    pub executor: Executor,
    /// How many non-`None` results to keep. Zero keeps none.
    pub result_capacity: usize,
    /// Run on at most one scheduler instance per firing.
    pub should_lock: bool,
    pub lock_expire: Duration,
}

impl Task {
    pub fn new<F>(name: impl Into<String>, spec: impl Into<String>, executor: F) -> Self
    where
        F: Fn() -> Option<Value> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            spec: spec.into(),
            executor: Arc::new(executor),
            result_capacity: 0,
            should_lock: false,
            lock_expire: DEFAULT_LOCK_EXPIRE,
        }
    }

    pub fn with_result_capacity(mut self, capacity: usize) -> Self {
        self.result_capacity = capacity;
        self
    }

    /// Make the task exclusive across the fleet with a lease of `expire_sec` seconds.
    pub fn with_lock(mut self, expire_sec: u64) -> Self {
        self.should_lock = true;
        self.lock_expire = Duration::from_secs(expire_sec);
        self
    }
}

impl std::fmt::Debug for Task {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Task")
            .field("name", &self.name)
            .field("spec", &self.spec)
            .field("result_capacity", &self.result_capacity)
            .field("should_lock", &self.should_lock)
            .field("lock_expire", &self.lock_expire)
            .finish_non_exhaustive()
    }
}
