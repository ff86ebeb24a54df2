//! # trogon-cron-lock
//!
//! Periodic task scheduler for TrogonStack fleets, with lease-based
//! distributed locks so an exclusive task runs on one instance per firing.
//!
//! ## Features
//!
//! - Cron expressions (6/7 fields, seconds first) and `@every <n>ms|s|m|h` schedules.
//! - Optional per-task exclusivity through a [`LeaseLock`] backed by Redis or
//!   NATS JetStream KV. A watchdog keeps the lease alive while the task runs.
//! - Panicking tasks are contained; other tasks keep firing.
//! - Bounded per-task result history (FIFO eviction).
//! - Stopping a scheduler deletes every lock it holds.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use serde_json::json;
//! use trogon_cron_lock::{CronConfig, Scheduler, SystemEnv, Task};
//!
//! #[tokio::main]
//! async fn main() {
//!     let config = CronConfig::from_env(&SystemEnv);
//!     let mut cron = Scheduler::connect(&config).await.unwrap();
//!     cron.add_task(
//!         Task::new("report", "0 0 8 * * *", || Some(json!("sent")))
//!             .with_lock(60)
//!             .with_result_capacity(10),
//!     )
//!     .unwrap();
//!     cron.run().await.unwrap();
//! }
//! ```
//!
//! ## Task file used by the `trogon-cron-lock` binary
//!
//! ```json
//! [
//!   {
//!     "name": "report",
//!     "schedule": "0 0 8 * * *",
//!     "command": { "bin": "/usr/bin/report", "args": ["--format", "pdf"] },
//!     "result_capacity": 5,
//!     "should_lock": true,
//!     "lock_expire_sec": 120
//!   }
//! ]
//! ```

pub mod backend;
mod command;
pub mod config;
pub mod error;
mod executor;
pub mod kv;
pub mod lease;
pub mod nats_impls;
pub mod owner;
pub mod redis_impls;
pub mod registry;
pub mod results;
pub mod scheduler;
pub mod task;
pub mod traits;
pub mod trigger;

#[cfg(any(test, feature = "test-support"))]
pub mod mocks;

pub use backend::Backend;
pub use config::{CommandConfig, CronConfig, LockBackendConfig, ReadEnv, SystemEnv, TaskConfig};
pub use error::CronError;
pub use lease::{Acquisition, Lease, LeaseLock};
pub use nats_impls::NatsKvBackend;
pub use owner::owner_token;
pub use redis_impls::RedisBackend;
pub use registry::LockRegistry;
pub use results::ResultCache;
pub use scheduler::{Scheduler, SchedulerState};
pub use task::{Task, decorate_name};
pub use traits::LockBackend;
pub use trigger::{Trigger, TriggerEngine};
