use std::env;
use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::{command, error::CronError, kv::LOCK_BUCKET, task::Task};

pub const ENV_REDIS_URL: &str = "CRON_LOCK_REDIS_URL";
pub const ENV_NATS_URL: &str = "CRON_LOCK_NATS_URL";
pub const ENV_LOCK_BUCKET: &str = "CRON_LOCK_BUCKET";
pub const ENV_TASKS_FILE: &str = "CRON_TASKS_FILE";
pub const DEFAULT_TASKS_FILE: &str = "cron-tasks.json";

/// Source of environment variables, so configuration can be read without
/// touching the process environment in tests.
pub trait ReadEnv {
    fn var(&self, key: &str) -> Result<String, env::VarError>;
}

/// Delegates to `std::env`.
pub struct SystemEnv;

impl ReadEnv for SystemEnv {
    #[inline]
    fn var(&self, key: &str) -> Result<String, env::VarError> {
        env::var(key)
    }
}

/// Where distributed locks live.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum LockBackendConfig {
    Redis { url: String },
    Nats {
        url: String,
        #[serde(default = "default_bucket")]
        bucket: String,
    },
}

fn default_bucket() -> String {
    LOCK_BUCKET.to_string()
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CronConfig {
    /// `None` disables exclusivity: locked tasks run on every instance.
    #[serde(default)]
    pub lock_backend: Option<LockBackendConfig>,
}

impl CronConfig {
    /// Redis wins over NATS when both URLs are set; neither means no lock backend.
    pub fn from_env<E: ReadEnv>(env: &E) -> Self {
        let lock_backend = if let Some(url) = non_empty(env, ENV_REDIS_URL) {
            Some(LockBackendConfig::Redis { url })
        } else {
            non_empty(env, ENV_NATS_URL).map(|url| LockBackendConfig::Nats {
                url,
                bucket: non_empty(env, ENV_LOCK_BUCKET).unwrap_or_else(default_bucket),
            })
        };
        Self { lock_backend }
    }
}

fn non_empty<E: ReadEnv>(env: &E, key: &str) -> Option<String> {
    env.var(key)
        .ok()
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

/// Path of the runner's task file.
pub fn tasks_file<E: ReadEnv>(env: &E) -> String {
    non_empty(env, ENV_TASKS_FILE).unwrap_or_else(|| DEFAULT_TASKS_FILE.to_string())
}

/// Process run on every firing of a file-defined task.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommandConfig {
    pub bin: String,
    #[serde(default)]
    pub args: Vec<String>,
}

/// One entry of the runner's task file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TaskConfig {
    pub name: String,
    pub schedule: String,
    pub command: CommandConfig,
    #[serde(default)]
    pub result_capacity: usize,
    #[serde(default)]
    pub should_lock: bool,
    #[serde(default = "default_lock_expire_sec")]
    pub lock_expire_sec: u64,
}

fn default_lock_expire_sec() -> u64 {
    30
}

impl TaskConfig {
    /// Build a runnable [`Task`] whose executor spawns the configured command.
    pub fn into_task(self) -> Result<Task, CronError> {
        command::validate(&self.name, &self.command)?;
        let TaskConfig {
            name,
            schedule,
            command: cmd,
            result_capacity,
            should_lock,
            lock_expire_sec,
        } = self;

        let task_name = name.clone();
        let mut task = Task::new(name, schedule, move || command::run(&task_name, &cmd))
            .with_result_capacity(result_capacity);
        if should_lock {
            task = task.with_lock(lock_expire_sec);
        }
        Ok(task)
    }
}

/// Parse a JSON array of task definitions.
pub fn parse_tasks(json: &str) -> Result<Vec<TaskConfig>, CronError> {
    Ok(serde_json::from_str(json)?)
}

pub fn load_tasks(path: impl AsRef<Path>) -> Result<Vec<TaskConfig>, CronError> {
    let content = std::fs::read_to_string(path)?;
    parse_tasks(&content)
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use super::*;

    #[derive(Default)]
    struct InMemoryEnv(HashMap<String, String>);

    impl InMemoryEnv {
        fn with(mut self, key: &str, value: &str) -> Self {
            self.0.insert(key.to_string(), value.to_string());
            self
        }
    }

    impl ReadEnv for InMemoryEnv {
        fn var(&self, key: &str) -> Result<String, env::VarError> {
            self.0.get(key).cloned().ok_or(env::VarError::NotPresent)
        }
    }

    #[test]
    fn no_urls_means_no_backend() {
        assert_eq!(CronConfig::from_env(&InMemoryEnv::default()).lock_backend, None);
    }

    #[test]
    fn redis_url_selects_redis() {
        let env = InMemoryEnv::default().with(ENV_REDIS_URL, "redis://127.0.0.1:6379");
        assert_eq!(
            CronConfig::from_env(&env).lock_backend,
            Some(LockBackendConfig::Redis {
                url: "redis://127.0.0.1:6379".to_string()
            })
        );
    }

    #[test]
    fn redis_takes_precedence_over_nats() {
        let env = InMemoryEnv::default()
            .with(ENV_NATS_URL, "nats://localhost:4222")
            .with(ENV_REDIS_URL, "redis://localhost");
        assert!(matches!(
            CronConfig::from_env(&env).lock_backend,
            Some(LockBackendConfig::Redis { .. })
        ));
    }

    #[test]
    fn nats_uses_default_bucket_unless_overridden() {
        let env = InMemoryEnv::default().with(ENV_NATS_URL, "nats://localhost:4222");
        assert_eq!(
            CronConfig::from_env(&env).lock_backend,
            Some(LockBackendConfig::Nats {
                url: "nats://localhost:4222".to_string(),
                bucket: LOCK_BUCKET.to_string(),
            })
        );

        let env = env.with(ENV_LOCK_BUCKET, "team_locks");
        assert!(matches!(
            CronConfig::from_env(&env).lock_backend,
            Some(LockBackendConfig::Nats { ref bucket, .. }) if bucket == "team_locks"
        ));
    }

    #[test]
    fn blank_url_is_ignored() {
        let env = InMemoryEnv::default().with(ENV_REDIS_URL, "  ");
        assert_eq!(CronConfig::from_env(&env).lock_backend, None);
    }

    #[test]
    fn tasks_file_defaults() {
        assert_eq!(tasks_file(&InMemoryEnv::default()), DEFAULT_TASKS_FILE);
        let env = InMemoryEnv::default().with(ENV_TASKS_FILE, "/etc/cron/tasks.json");
        assert_eq!(tasks_file(&env), "/etc/cron/tasks.json");
    }

    #[test]
    fn task_file_applies_defaults() {
        let tasks = parse_tasks(
            r#"[
                {"name": "report", "schedule": "0 0 8 * * *", "command": {"bin": "/usr/bin/report"}},
                {"name": "sync", "schedule": "@every 5m",
                 "command": {"bin": "/usr/bin/sync", "args": ["--all"]},
                 "result_capacity": 3, "should_lock": true, "lock_expire_sec": 60}
            ]"#,
        )
        .unwrap();

        assert_eq!(tasks.len(), 2);
        assert_eq!(tasks[0].result_capacity, 0);
        assert!(!tasks[0].should_lock);
        assert_eq!(tasks[0].lock_expire_sec, 30);
        assert!(tasks[0].command.args.is_empty());
        assert_eq!(tasks[1].command.args, vec!["--all"]);
        assert!(tasks[1].should_lock);
        assert_eq!(tasks[1].lock_expire_sec, 60);
    }

    #[test]
    fn malformed_task_file_is_a_serde_error() {
        assert!(matches!(parse_tasks("{not json"), Err(CronError::Serde(_))));
    }

    #[test]
    fn missing_task_file_is_an_io_error() {
        assert!(matches!(
            load_tasks("/nonexistent/cron-tasks.json"),
            Err(CronError::Io(_))
        ));
    }

    #[test]
    fn backend_config_round_trips_through_serde_tag() {
        let cfg: CronConfig = serde_json::from_str(
            r#"{"lock_backend": {"type": "nats", "url": "nats://localhost:4222"}}"#,
        )
        .unwrap();
        assert_eq!(
            cfg.lock_backend,
            Some(LockBackendConfig::Nats {
                url: "nats://localhost:4222".to_string(),
                bucket: LOCK_BUCKET.to_string(),
            })
        );
    }

    #[cfg(unix)]
    #[test]
    fn into_task_carries_lock_settings() {
        let config = TaskConfig {
            name: "hello".to_string(),
            schedule: "@every 1s".to_string(),
            command: CommandConfig {
                bin: "/bin/sh".to_string(),
                args: vec!["-c".to_string(), "echo hi".to_string()],
            },
            result_capacity: 2,
            should_lock: true,
            lock_expire_sec: 7,
        };

        let task = config.into_task().unwrap();

        assert_eq!(task.name, "hello");
        assert!(task.should_lock);
        assert_eq!(task.lock_expire, std::time::Duration::from_secs(7));
        assert_eq!(task.result_capacity, 2);
    }

    #[test]
    fn into_task_rejects_relative_bin() {
        let config = TaskConfig {
            name: "hello".to_string(),
            schedule: "@every 1s".to_string(),
            command: CommandConfig {
                bin: "echo".to_string(),
                args: vec![],
            },
            result_capacity: 0,
            should_lock: false,
            lock_expire_sec: 30,
        };
        assert!(matches!(
            config.into_task(),
            Err(CronError::InvalidTaskConfig { .. })
        ));
    }
}
