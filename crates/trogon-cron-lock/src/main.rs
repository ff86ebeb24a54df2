use trogon_cron_lock::{CronConfig, Scheduler, SystemEnv, config};

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let tasks_file = config::tasks_file(&SystemEnv);
    tracing::info!(tasks_file = %tasks_file, "Loading cron tasks");

    let tasks = config::load_tasks(&tasks_file).unwrap_or_else(|e| {
        tracing::error!(tasks_file = %tasks_file, error = %e, "Failed to load task file");
        std::process::exit(1);
    });

    let cron_config = CronConfig::from_env(&SystemEnv);
    if cron_config.lock_backend.is_none() {
        tracing::warn!("No lock backend configured, exclusive tasks run on every instance");
    }

    let mut scheduler = Scheduler::connect(&cron_config).await.unwrap_or_else(|e| {
        tracing::error!(error = %e, "Failed to connect to lock backend");
        std::process::exit(1);
    });

    for task_config in tasks {
        let name = task_config.name.clone();
        let added = task_config
            .into_task()
            .and_then(|task| scheduler.add_task(task));
        if let Err(e) = added {
            tracing::error!(task = %name, error = %e, "Invalid task definition");
            std::process::exit(1);
        }
    }

    tracing::info!("Starting cron scheduler");

    if let Err(e) = scheduler.run().await {
        tracing::error!(error = %e, "Scheduler exited with error");
        std::process::exit(1);
    }
}
