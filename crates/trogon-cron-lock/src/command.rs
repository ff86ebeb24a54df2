use std::path::Path;

use chrono::Utc;
use serde_json::Value;
use tokio::process::Command;
use tokio::runtime::Handle;

use crate::{config::CommandConfig, error::CronError};

/// Reject commands that can never run: relative or non-executable `bin`,
/// arguments with interior NUL bytes.
pub(crate) fn validate(task: &str, command: &CommandConfig) -> Result<(), CronError> {
    let invalid = |reason: String| CronError::InvalidTaskConfig {
        task: task.to_string(),
        reason,
    };

    let path = Path::new(&command.bin);
    if !path.is_absolute() {
        return Err(invalid(format!(
            "bin must be an absolute path, got: {}",
            command.bin
        )));
    }

    #[cfg(unix)]
    {
        use std::os::unix::fs::PermissionsExt;
        let meta = std::fs::metadata(path)
            .map_err(|e| invalid(format!("cannot access bin '{}': {e}", command.bin)))?;
        if meta.permissions().mode() & 0o111 == 0 {
            return Err(invalid(format!("bin '{}' is not executable", command.bin)));
        }
    }

    if let Some(arg) = command.args.iter().find(|a| a.contains('\0')) {
        return Err(invalid(format!("argument contains null byte: {arg:?}")));
    }
    Ok(())
}

/// Run `command` to completion. Trimmed stdout of a successful run is the result.
///
/// Called from the blocking pool: the child is driven by the surrounding
/// runtime and killed if the wait is abandoned.
pub(crate) fn run(task: &str, command: &CommandConfig) -> Option<Value> {
    let handle = match Handle::try_current() {
        Ok(handle) => handle,
        Err(e) => {
            tracing::error!(task, bin = %command.bin, error = %e, "No runtime to spawn process on");
            return None;
        }
    };

    let output = handle.block_on(
        Command::new(&command.bin)
            .args(&command.args)
            .env("CRON_TASK_NAME", task)
            .env("CRON_FIRED_AT", Utc::now().to_rfc3339())
            .kill_on_drop(true)
            .output(),
    );

    let output = match output {
        Ok(output) => output,
        Err(e) => {
            tracing::error!(task, bin = %command.bin, error = %e, "Failed to spawn process");
            return None;
        }
    };

    if !output.status.success() {
        tracing::warn!(
            task,
            bin = %command.bin,
            status = %output.status,
            stderr = %String::from_utf8_lossy(&output.stderr).trim(),
            "Process exited with non-zero status"
        );
        return None;
    }

    tracing::debug!(task, bin = %command.bin, "Process completed");
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stdout = stdout.trim();
    (!stdout.is_empty()).then(|| Value::String(stdout.to_string()))
}
