//! Asynchronous utilities for use with Tokio.

use std::sync::LazyLock;

use regex::Regex;

use crate::prelude::*;

/// A default error regex for checking command output.
pub static DEFAULT_ERROR_REGEX: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?i)error").expect("failed to compile regex"));

/// Report any command failures, and include any error output.
///
/// Standard output is logged at `debug`, and standard error at `warn` if it
/// isn't empty. If `is_error_line` is supplied, a successful exit status whose
/// standard error contains a matching line is still treated as a failure.
pub fn check_for_command_failure(
    command_name: &str,
    output: &std::process::Output,
    is_error_line: Option<&dyn Fn(&str) -> bool>,
) -> Result<()> {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    debug!(
        command_name = command_name,
        output = %stdout,
        "Standard output from command"
    );
    if !stderr.trim().is_empty() {
        warn!(
            command_name = command_name,
            output = %stderr,
            "Standard error from command",
        );
    }

    if output.status.success() {
        if let Some(is_error_line) = is_error_line
            && stderr.lines().any(is_error_line)
        {
            return Err(anyhow!(
                "{} printed error output:\n{}",
                command_name,
                stderr,
            ));
        }
        Ok(())
    } else if let Some(exit_code) = output.status.code() {
        Err(anyhow!(
            "{} failed with exit code {} and error output:\n{}",
            command_name,
            exit_code,
            stderr,
        ))
    } else {
        Err(anyhow!(
            "{} failed with error output:\n{}",
            command_name,
            stderr,
        ))
    }
}

/// Does this line of tool output look like an error?
pub fn matches_default_error_regex(line: &str) -> bool {
    DEFAULT_ERROR_REGEX.is_match(line)
}

/// Wrapper around [`tokio::task::spawn_blocking`] that propagates panics from
/// the background task.
pub async fn spawn_blocking_propagating_panics<F, T>(f: F) -> T
where
    F: FnOnce() -> T + Send + 'static,
    T: Send + 'static,
{
    match tokio::task::spawn_blocking(f).await {
        Ok(value) => value,
        Err(err) => std::panic::resume_unwind(err.into_panic()),
    }
}

#[cfg(test)]
mod tests {
    use std::process::{ExitStatus, Output};

    use super::*;

    #[cfg(unix)]
    fn output(code: i32, stderr: &str) -> Output {
        use std::os::unix::process::ExitStatusExt as _;
        Output {
            status: ExitStatus::from_raw(code << 8),
            stdout: vec![],
            stderr: stderr.as_bytes().to_vec(),
        }
    }

    #[cfg(unix)]
    #[test]
    fn nonzero_exit_is_failure() {
        let err = check_for_command_failure("gs", &output(1, "boom"), None)
            .unwrap_err()
            .to_string();
        assert!(err.contains("exit code 1"), "{err}");
    }

    #[cfg(unix)]
    #[test]
    fn error_lines_fail_successful_commands() {
        let out = output(0, "Syntax Error: bad xref\n");
        assert!(check_for_command_failure("pdftocairo", &out, None).is_ok());
        assert!(
            check_for_command_failure(
                "pdftocairo",
                &out,
                Some(&matches_default_error_regex)
            )
            .is_err()
        );
    }

    #[tokio::test]
    async fn blocking_tasks_return_values() {
        let value = spawn_blocking_propagating_panics(|| 6 * 7).await;
        assert_eq!(value, 42);
    }
}
