use thiserror::Error;

use crate::scheduler::SchedulerState;

#[derive(Debug, Error)]
pub enum CronError {
    #[error("KV error: {0}")]
    Kv(String),

    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    #[error("Connection error: {0}")]
    Connect(String),

    #[error("Serialization error: {0}")]
    Serde(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Invalid cron expression '{expr}': {reason}")]
    InvalidCronExpression { expr: String, reason: String },

    #[error("Invalid task '{task}': {reason}")]
    InvalidTaskConfig { task: String, reason: String },

    #[error("{name} duplication")]
    DuplicateTask { name: String },

    #[error("cannot {operation} a scheduler in state {state:?}")]
    InvalidState {
        operation: &'static str,
        state: SchedulerState,
    },
}
