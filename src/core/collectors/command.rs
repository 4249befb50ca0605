//! Running external programs with a deadline.

use std::{process::Output, time::Duration};

use tokio::process::Command;

use super::{error::CollectorError, types::CollectorResult};

/// Runs `program args...`, killing it after `timeout`.
///
/// The exit status is not checked.
pub async fn run(program: &str, args: &[&str], timeout: Duration) -> CollectorResult<Output> {
    let mut command = Command::new(program);
    command.args(args).kill_on_drop(true);
    spawn_with_deadline(command, program, timeout).await
}

/// Runs `command` through `sh -c`.
pub async fn run_shell(command_line: &str, timeout: Duration) -> CollectorResult<Output> {
    let mut command = Command::new("sh");
    command.arg("-c").arg(command_line).kill_on_drop(true);
    spawn_with_deadline(command, command_line, timeout).await
}

/// Like [`run`], but a non-zero exit is an error carrying stderr.
pub async fn run_checked(
    program: &str,
    args: &[&str],
    timeout: Duration,
) -> CollectorResult<String> {
    let output = run(program, args, timeout).await?;
    if !output.status.success() {
        return Err(CollectorError::CommandFailed {
            command: program.to_string(),
            status: output.status.to_string(),
            stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
        });
    }
    Ok(String::from_utf8_lossy(&output.stdout).into_owned())
}

async fn spawn_with_deadline(
    mut command: Command,
    label: &str,
    timeout: Duration,
) -> CollectorResult<Output> {
    match tokio::time::timeout(timeout, command.output()).await {
        Ok(Ok(output)) => Ok(output),
        Ok(Err(source)) => Err(CollectorError::CommandExecution {
            command: label.to_string(),
            source,
        }),
        Err(_) => Err(CollectorError::Timeout {
            command: label.to_string(),
            seconds: timeout.as_secs_f64(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_shell_captures_stdout() {
        let output = run_shell("echo 42", Duration::from_secs(5)).await.unwrap();
        assert!(output.status.success());
        assert_eq!(String::from_utf8_lossy(&output.stdout).trim(), "42");
    }

    #[tokio::test]
    async fn test_timeout() {
        let err = run_shell("sleep 5", Duration::from_millis(100))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::Timeout { .. }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let err = run("definitely-not-a-real-binary", &[], Duration::from_secs(1))
            .await
            .unwrap_err();
        assert!(matches!(err, CollectorError::CommandExecution { .. }));
    }

    #[tokio::test]
    async fn test_checked_failure() {
        let err = run_checked("sh", &["-c", "echo nope >&2; exit 3"], Duration::from_secs(5))
            .await
            .unwrap_err();
        assert!(err.to_string().contains("nope"));
    }
}
