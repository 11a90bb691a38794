//! External command execution
//!
//! Thin async wrapper around `tokio::process::Command` used by the git and
//! podman collaborators. Child processes are killed when the future running
//! them is dropped, so a cancelled stage never leaves a build or push running.

use anyhow::{Context, Result};
use std::ffi::OsStr;
use std::path::Path;
use std::process::Stdio;
use tokio::process::Command;
use tracing::debug;

/// Captured result of a finished command
#[derive(Debug, Clone)]
pub struct CommandOutput {
    pub stdout: Vec<u8>,
    pub stderr: String,
    pub exit_code: i32,
}

impl CommandOutput {
    pub fn success(&self) -> bool {
        self.exit_code == 0
    }

    pub fn stdout_str(&self) -> String {
        String::from_utf8_lossy(&self.stdout).trim().to_string()
    }

    /// One-line description for error messages
    pub fn describe(&self) -> String {
        format!("exit_code={}, stderr='{}'", self.exit_code, self.stderr.trim())
    }
}

/// Runs a program to completion and captures its output
///
/// A non-zero exit status is not an error here; callers classify failures
/// themselves. Only a failure to spawn the process is reported as `Err`.
pub async fn run<I, S>(program: &str, args: I, cwd: Option<&Path>) -> Result<CommandOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    if let Some(dir) = cwd {
        command.current_dir(dir);
    }

    debug!("Running command: {:?}", command.as_std());

    let output = command
        .output()
        .await
        .with_context(|| format!("Failed to execute '{}'. Is it installed?", program))?;

    let result = CommandOutput {
        stdout: output.stdout,
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
        exit_code: output.status.code().unwrap_or(-1),
    };

    if !result.success() {
        debug!("{} failed: {}", program, result.describe());
    }

    Ok(result)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let output = run("sh", ["-c", "echo hello"], None).await.unwrap();
        assert!(output.success());
        assert_eq!(output.stdout_str(), "hello");
    }

    #[tokio::test]
    async fn test_run_reports_exit_code() {
        let output = run("sh", ["-c", "echo oops >&2; exit 3"], None)
            .await
            .unwrap();
        assert!(!output.success());
        assert_eq!(output.exit_code, 3);
        assert!(output.describe().contains("oops"));
    }

    #[tokio::test]
    async fn test_run_missing_program_is_error() {
        let result = run("definitely-not-a-real-program", ["--version"], None).await;
        assert!(result.is_err());
    }
}
