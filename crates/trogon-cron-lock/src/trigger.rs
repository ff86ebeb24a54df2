use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, TimeDelta, Utc};
use futures::future::BoxFuture;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::error::CronError;

const EVERY_PREFIX: &str = "@every ";

/// When a task fires.
#[derive(Debug, Clone)]
pub enum Trigger {
    /// 6/7-field cron expression: "0 */5 * * * *" (sec min hour dom month dow [year]).
    Cron(Box<cron::Schedule>),
    /// `@every 30s`: fixed interval, first firing one interval after start.
    Every(Duration),
}

impl FromStr for Trigger {
    type Err = CronError;

    fn from_str(spec: &str) -> Result<Self, CronError> {
        let spec = spec.trim();
        if let Some(raw) = spec.strip_prefix(EVERY_PREFIX) {
            return parse_every(raw)
                .map(Trigger::Every)
                .ok_or_else(|| CronError::InvalidCronExpression {
                    expr: spec.to_string(),
                    reason: "expected a positive duration like 500ms, 10s, 5m or 1h".to_string(),
                });
        }
        cron::Schedule::from_str(spec)
            .map(|s| Trigger::Cron(Box::new(s)))
            .map_err(|e| CronError::InvalidCronExpression {
                expr: spec.to_string(),
                reason: e.to_string(),
            })
    }
}

fn parse_every(raw: &str) -> Option<Duration> {
    let raw = raw.trim();
    let split = raw.find(|c: char| !c.is_ascii_digit())?;
    let (amount, unit) = raw.split_at(split);
    let amount: u64 = amount.parse().ok()?;
    let duration = match unit.trim() {
        "ms" => Duration::from_millis(amount),
        "s" => Duration::from_secs(amount),
        "m" => Duration::from_secs(amount.checked_mul(60)?),
        "h" => Duration::from_secs(amount.checked_mul(3600)?),
        _ => return None,
    };
    (!duration.is_zero()).then_some(duration)
}

impl Trigger {
    /// Next firing strictly after `from`, `None` if the schedule is exhausted.
    pub fn next_after(&self, from: DateTime<Utc>) -> Option<DateTime<Utc>> {
        match self {
            Trigger::Cron(schedule) => schedule.after(&from).next(),
            Trigger::Every(interval) => {
                let step = TimeDelta::from_std(*interval).ok()?;
                from.checked_add_signed(step)
            }
        }
    }
}

/// Work started on every firing. Each call produces one independent future.
pub type Job = Arc<dyn Fn() -> BoxFuture<'static, ()> + Send + Sync>;

struct Entry {
    name: String,
    trigger: Trigger,
    job: Job,
    next_fire: Option<DateTime<Utc>>,
}

/// Wall clock derived from a monotonic anchor.
///
/// Keeps cron arithmetic in `DateTime<Utc>` while all sleeping goes through
/// `tokio::time`, so the loop also runs under a paused test clock.
struct Clock {
    wall: DateTime<Utc>,
    mono: Instant,
}

impl Clock {
    fn start() -> Self {
        Self {
            wall: Utc::now(),
            mono: Instant::now(),
        }
    }

    fn now(&self) -> DateTime<Utc> {
        let elapsed = TimeDelta::from_std(self.mono.elapsed()).unwrap_or(TimeDelta::MAX);
        self.wall.checked_add_signed(elapsed).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    fn deadline(&self, at: DateTime<Utc>) -> Instant {
        self.mono + (at - self.wall).to_std().unwrap_or_default()
    }
}

/// Drives registered jobs from their triggers on a single dispatch task.
///
/// Every due firing is spawned as its own Tokio task, so slow jobs never delay
/// other jobs and successive firings of one job may overlap.
#[derive(Default)]
pub struct TriggerEngine {
    entries: Vec<Entry>,
    stop: Option<oneshot::Sender<()>>,
    handle: Option<JoinHandle<()>>,
}

impl TriggerEngine {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `job` under `spec`. Only valid before [`start`](Self::start).
    pub fn add(&mut self, name: &str, spec: &str, job: Job) -> Result<(), CronError> {
        let trigger = spec.parse()?;
        self.add_trigger(name, trigger, job);
        Ok(())
    }

    pub fn add_trigger(&mut self, name: &str, trigger: Trigger, job: Job) {
        self.entries.push(Entry {
            name: name.to_string(),
            trigger,
            job,
            next_fire: None,
        });
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn is_running(&self) -> bool {
        self.handle.is_some()
    }

    /// Spawn the dispatch loop. Must be called inside a Tokio runtime.
    pub fn start(&mut self) {
        if self.handle.is_some() {
            return;
        }
        let (stop_tx, stop_rx) = oneshot::channel();
        let entries = std::mem::take(&mut self.entries);
        self.stop = Some(stop_tx);
        self.handle = Some(tokio::spawn(dispatch(entries, stop_rx)));
    }

    /// Stop dispatching and wait for the loop to exit. Jobs already spawned keep running.
    pub async fn stop(&mut self) {
        if let Some(stop) = self.stop.take() {
            let _ = stop.send(());
        }
        if let Some(handle) = self.handle.take() {
            if let Err(e) = handle.await {
                tracing::error!(error = %e, "Trigger dispatch loop ended abnormally");
            }
        }
        self.entries.clear();
    }
}

async fn dispatch(mut entries: Vec<Entry>, mut stop: oneshot::Receiver<()>) {
    let clock = Clock::start();
    let started = clock.now();
    for entry in &mut entries {
        entry.next_fire = entry.trigger.next_after(started);
        if entry.next_fire.is_none() {
            tracing::warn!(task = %entry.name, "Schedule never fires");
        }
    }

    loop {
        let now = clock.now();
        for entry in &mut entries {
            if entry.next_fire.is_some_and(|t| now >= t) {
                tracing::trace!(task = %entry.name, "Firing");
                tokio::spawn((entry.job)());
                entry.next_fire = entry.trigger.next_after(now);
            }
        }

        let deadline = entries
            .iter()
            .filter_map(|e| e.next_fire)
            .min()
            .map(|t| clock.deadline(t));

        tokio::select! {
            biased;
            _ = &mut stop => break,
            _ = sleep_until(deadline) => {}
        }
    }
    tracing::debug!("Trigger dispatch loop stopped");
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}
