use std::collections::HashSet;
use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use futures::FutureExt;
use serde_json::Value;

use crate::{
    backend::Backend,
    config::CronConfig,
    error::CronError,
    executor::Firing,
    lease::LeaseLock,
    results::ResultCache,
    task::{Task, decorate_name},
    traits::LockBackend,
    trigger::{Job, Trigger, TriggerEngine},
};

/// Lifecycle of a [`Scheduler`]. `Stopped` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    Created,
    Running,
    Stopped,
}

/// Runs periodic tasks, optionally guarding each firing with a distributed lease.
///
/// Every instance in a fleet registers the same tasks; for tasks built with
/// [`Task::with_lock`] only the instance that wins the lease runs a firing.
pub struct Scheduler<B: LockBackend = Backend> {
    state: SchedulerState,
    tasks: Vec<Task>,
    engine: Option<TriggerEngine>,
    lock: Option<LeaseLock<B>>,
    results: ResultCache,
    active: Arc<AtomicBool>,
    count: usize,
}

impl Scheduler<Backend> {
    /// Scheduler without a lock backend: exclusive tasks run unconditionally.
    pub fn new() -> Self {
        Self::build(None)
    }

    /// Scheduler configured from `config`, connecting to the lock backend if one is set.
    pub async fn connect(config: &CronConfig) -> Result<Self, CronError> {
        let lock = match &config.lock_backend {
            Some(backend) => Some(LeaseLock::new(Backend::connect(backend).await?)),
            None => None,
        };
        Ok(Self::build(lock))
    }
}

impl Default for Scheduler<Backend> {
    fn default() -> Self {
        Self::new()
    }
}

impl<B: LockBackend> Scheduler<B> {
    pub fn with_lock(lock: LeaseLock<B>) -> Self {
        Self::build(Some(lock))
    }

    fn build(lock: Option<LeaseLock<B>>) -> Self {
        Self {
            state: SchedulerState::Created,
            tasks: Vec::new(),
            engine: Some(TriggerEngine::new()),
            lock,
            results: ResultCache::new(),
            active: Arc::new(AtomicBool::new(false)),
            count: 0,
        }
    }

    pub fn state(&self) -> SchedulerState {
        self.state
    }

    /// Register a task. Only allowed before [`start`](Self::start).
    pub fn add_task(&mut self, mut task: Task) -> Result<(), CronError> {
        self.expect_state(SchedulerState::Created, "add a task to")?;
        task.name = decorate_name(&task.name);
        self.tasks.push(task);
        Ok(())
    }

    /// Validate every task, bind them to the trigger engine and start dispatching.
    ///
    /// Any configuration error leaves no task bound and makes the instance
    /// unusable; build a new one.
    pub fn start(&mut self) -> Result<(), CronError> {
        self.expect_state(SchedulerState::Created, "start")?;

        let triggers = match self.validate() {
            Ok(triggers) => triggers,
            Err(e) => {
                self.state = SchedulerState::Stopped;
                tracing::error!(error = %e, "Scheduler rejected its task list");
                return Err(e);
            }
        };

        let Some(engine) = self.engine.as_mut() else {
            return Err(CronError::InvalidState {
                operation: "start",
                state: self.state,
            });
        };

        self.active.store(true, Ordering::SeqCst);
        for (task, trigger) in self.tasks.iter().zip(triggers) {
            let firing = Firing {
                task: Arc::new(task.clone()),
                lock: self.lock.clone(),
                results: self.results.clone(),
                active: Arc::clone(&self.active),
            };
            let job: Job = Arc::new(move || firing.clone().run().boxed());
            engine.add_trigger(&task.name, trigger, job);
            self.count += 1;
        }
        engine.start();
        self.state = SchedulerState::Running;

        tracing::info!(
            task_count = self.count,
            locking = self.lock.is_some(),
            "Cron scheduler started"
        );
        Ok(())
    }

    fn validate(&self) -> Result<Vec<Trigger>, CronError> {
        let mut names = HashSet::new();
        for task in &self.tasks {
            if !names.insert(task.name.as_str()) {
                return Err(CronError::DuplicateTask {
                    name: task.name.clone(),
                });
            }
        }

        self.tasks
            .iter()
            .map(|task| {
                if task.should_lock && task.lock_expire.is_zero() {
                    return Err(CronError::InvalidTaskConfig {
                        task: task.name.clone(),
                        reason: "lock_expire must be >= 1s for a locked task".to_string(),
                    });
                }
                task.spec.parse::<Trigger>()
            })
            .collect()
    }

    /// Number of tasks bound by [`start`](Self::start).
    pub fn count(&self) -> usize {
        self.count
    }

    /// Retained results of `name` (undecorated), oldest first.
    pub fn results(&self, name: &str) -> Vec<Value> {
        self.results.get(&decorate_name(name))
    }

    /// Locks held by this process. Empty without a lock backend or after stop.
    pub fn locked_tasks(&self) -> Vec<String> {
        self.lock.as_ref().map(LeaseLock::list).unwrap_or_default()
    }

    /// Stop dispatching, delete this process's locks and drop all state.
    ///
    /// Firings already running finish on their own but leave no results behind.
    pub async fn stop(&mut self) {
        self.active.store(false, Ordering::SeqCst);
        if let Some(mut engine) = self.engine.take() {
            engine.stop().await;
        }
        if let Some(lock) = self.lock.take() {
            lock.shutdown().await;
        }
        self.tasks.clear();
        self.results.close();
        self.count = 0;
        if self.state != SchedulerState::Stopped {
            tracing::info!("Cron scheduler stopped");
        }
        self.state = SchedulerState::Stopped;
    }

    /// Start, run until Ctrl-C or SIGTERM, then stop and release every lock.
    pub async fn run(mut self) -> Result<(), CronError> {
        self.start()?;
        shutdown_signal().await;
        tracing::info!("Shutdown signal received, stopping cron scheduler");
        self.stop().await;
        Ok(())
    }

    fn expect_state(&self, expected: SchedulerState, operation: &'static str) -> Result<(), CronError> {
        if self.state == expected {
            Ok(())
        } else {
            Err(CronError::InvalidState {
                operation,
                state: self.state,
            })
        }
    }
}

/// Resolves on Ctrl-C (SIGINT) or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c  => {}
        _ = sigterm => {}
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::time::Duration;

    use serde_json::json;

    use super::*;
    use crate::mocks::InMemoryBackend;

    const EVERY_SECOND: &str = "* * * * * ?";

    fn locked_scheduler(backend: &InMemoryBackend) -> Scheduler<InMemoryBackend> {
        Scheduler::with_lock(LeaseLock::new(backend.clone()))
    }

    #[tokio::test(start_paused = true)]
    async fn runs_multiple_tasks() {
        let mut cron = Scheduler::new();
        cron.add_task(
            Task::new("taskOne", EVERY_SECOND, || Some(json!("task one"))).with_result_capacity(1),
        )
        .unwrap();
        cron.add_task(
            Task::new("taskTwo", EVERY_SECOND, || Some(json!("task two"))).with_result_capacity(1),
        )
        .unwrap();

        cron.start().unwrap();
        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(cron.count(), 2);
        assert_eq!(cron.state(), SchedulerState::Running);
        assert!(cron.results("taskOne").contains(&json!("task one")));
        assert!(cron.results("taskTwo").contains(&json!("task two")));
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn result_length_never_exceeds_capacity() {
        let mut cron = Scheduler::new();
        cron.add_task(
            Task::new("taskOne", EVERY_SECOND, || Some(json!("task one"))).with_result_capacity(1),
        )
        .unwrap();
        cron.start().unwrap();

        tokio::time::sleep(Duration::from_secs(5)).await;

        assert_eq!(cron.results("taskOne").len(), 1);
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn keeps_the_latest_results_in_order() {
        let calls = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&calls);
        let mut cron = Scheduler::new();
        cron.add_task(
            Task::new("build", "@every 1s", move || {
                let n = counter.fetch_add(1, Ordering::SeqCst) + 1;
                Some(json!(format!("v{n}")))
            })
            .with_result_capacity(2),
        )
        .unwrap();
        cron.start().unwrap();

        tokio::time::sleep(Duration::from_millis(3500)).await;

        assert_eq!(cron.results("build"), vec![json!("v2"), json!("v3")]);
        cron.stop().await;
    }

    #[tokio::test]
    async fn duplicate_names_prevent_startup() {
        let mut cron = Scheduler::new();
        cron.add_task(Task::new("taskOne", EVERY_SECOND, || None)).unwrap();
        cron.add_task(Task::new("taskOne", EVERY_SECOND, || None)).unwrap();

        let err = cron.start().unwrap_err();

        assert!(matches!(err, CronError::DuplicateTask { ref name } if name == "cron:taskOne"));
        assert_eq!(cron.count(), 0);
        assert_eq!(cron.state(), SchedulerState::Stopped);
        assert!(cron.start().is_err());
        cron.stop().await;
    }

    #[tokio::test]
    async fn invalid_schedule_prevents_startup() {
        let mut cron = Scheduler::new();
        cron.add_task(Task::new("good", EVERY_SECOND, || None)).unwrap();
        cron.add_task(Task::new("bad", "every tuesday", || None)).unwrap();

        let err = cron.start().unwrap_err();

        assert!(matches!(err, CronError::InvalidCronExpression { .. }));
        assert_eq!(cron.count(), 0);
    }

    #[tokio::test]
    async fn locked_task_needs_a_positive_lease() {
        let mut cron = Scheduler::new();
        cron.add_task(Task::new("job", EVERY_SECOND, || None).with_lock(0)).unwrap();

        assert!(matches!(cron.start(), Err(CronError::InvalidTaskConfig { .. })));
        assert_eq!(cron.count(), 0);
    }

    #[tokio::test]
    async fn lifecycle_misuse_is_rejected() {
        let mut cron = Scheduler::new();
        cron.start().unwrap();

        assert!(matches!(
            cron.add_task(Task::new("late", EVERY_SECOND, || None)),
            Err(CronError::InvalidState { state: SchedulerState::Running, .. })
        ));
        assert!(cron.start().is_err());

        cron.stop().await;
        assert!(matches!(
            cron.start(),
            Err(CronError::InvalidState { state: SchedulerState::Stopped, .. })
        ));
        // Stopping twice is harmless.
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn panicking_task_does_not_stop_others() {
        let mut cron = Scheduler::new();
        cron.add_task(Task::new("f", EVERY_SECOND, || panic!("panic")).with_result_capacity(1))
            .unwrap();
        cron.add_task(Task::new("g", EVERY_SECOND, || Some(json!("fine"))).with_result_capacity(1))
            .unwrap();
        cron.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert!(cron.results("f").is_empty());
        assert_eq!(cron.results("g"), vec![json!("fine")]);
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn removes_all_locks_after_stop() {
        let backend = InMemoryBackend::new();
        let (started_tx, mut started_rx) = tokio::sync::mpsc::unbounded_channel();
        let (gate_tx, gate_rx) = std::sync::mpsc::channel::<()>();
        let gate_rx = std::sync::Mutex::new(gate_rx);

        let mut cron = locked_scheduler(&backend);
        cron.add_task(
            Task::new("test", EVERY_SECOND, move || {
                let _ = started_tx.send(());
                let _ = gate_rx.lock().unwrap().recv();
                None
            })
            .with_lock(3)
            .with_result_capacity(1),
        )
        .unwrap();
        cron.start().unwrap();

        // The first firing is now blocked inside the executor, holding the lease.
        started_rx.recv().await.unwrap();
        assert_eq!(cron.locked_tasks(), vec![decorate_name("test")]);

        cron.stop().await;

        assert!(cron.locked_tasks().is_empty());
        assert!(backend.live_keys().is_empty());
        drop(gate_tx);
        let extends = backend.extend_count();
        tokio::time::sleep(Duration::from_secs(10)).await;
        assert_eq!(backend.extend_count(), extends);
    }

    #[tokio::test(start_paused = true)]
    async fn exclusive_task_never_overlaps_across_instances() {
        let backend = InMemoryBackend::new();
        let in_flight = Arc::new(AtomicUsize::new(0));
        let max_in_flight = Arc::new(AtomicUsize::new(0));
        let runs = Arc::new(AtomicUsize::new(0));

        let mut fleet = Vec::new();
        for _ in 0..3 {
            let in_flight = Arc::clone(&in_flight);
            let max_in_flight = Arc::clone(&max_in_flight);
            let runs = Arc::clone(&runs);
            let mut cron = locked_scheduler(&backend);
            cron.add_task(
                Task::new("report", EVERY_SECOND, move || {
                    let now = in_flight.fetch_add(1, Ordering::SeqCst) + 1;
                    max_in_flight.fetch_max(now, Ordering::SeqCst);
                    std::thread::sleep(Duration::from_millis(20));
                    in_flight.fetch_sub(1, Ordering::SeqCst);
                    runs.fetch_add(1, Ordering::SeqCst);
                    Some(json!("done"))
                })
                .with_lock(3),
            )
            .unwrap();
            cron.start().unwrap();
            fleet.push(cron);
        }

        tokio::time::sleep(Duration::from_secs(5)).await;
        for cron in &mut fleet {
            cron.stop().await;
        }

        assert!(runs.load(Ordering::SeqCst) >= 1);
        assert_eq!(max_in_flight.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn lock_held_elsewhere_skips_every_firing() {
        let backend = InMemoryBackend::new();
        backend.force_set("cron:job", "another-host", Duration::from_secs(3600));
        let runs = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&runs);

        let mut cron = locked_scheduler(&backend);
        cron.add_task(
            Task::new("job", EVERY_SECOND, move || {
                counter.fetch_add(1, Ordering::SeqCst);
                Some(json!(1))
            })
            .with_lock(3)
            .with_result_capacity(1),
        )
        .unwrap();
        cron.start().unwrap();

        tokio::time::sleep(Duration::from_secs(3)).await;

        assert_eq!(runs.load(Ordering::SeqCst), 0);
        assert!(cron.results("job").is_empty());
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn without_backend_locked_tasks_run_unconditionally() {
        let mut cron = Scheduler::new();
        cron.add_task(
            Task::new("job", EVERY_SECOND, || Some(json!("ran")))
                .with_lock(3)
                .with_result_capacity(1),
        )
        .unwrap();
        cron.start().unwrap();

        tokio::time::sleep(Duration::from_secs(2)).await;

        assert_eq!(cron.results("job"), vec![json!("ran")]);
        assert!(cron.locked_tasks().is_empty());
        cron.stop().await;
    }

    #[tokio::test(start_paused = true)]
    async fn stop_clears_results_and_count() {
        let mut cron = Scheduler::new();
        cron.add_task(Task::new("job", "@every 1s", || Some(json!(1))).with_result_capacity(3))
            .unwrap();
        cron.start().unwrap();
        tokio::time::sleep(Duration::from_millis(2500)).await;
        assert!(!cron.results("job").is_empty());

        cron.stop().await;

        assert_eq!(cron.count(), 0);
        assert!(cron.results("job").is_empty());
        assert_eq!(cron.state(), SchedulerState::Stopped);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cron.results("job").is_empty());
    }
}
