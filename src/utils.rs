//! Shared helpers for shelling out to system tools

use std::ffi::OsStr;
use std::process::Output;

use tokio::process::Command;

/// Captured result of a finished child process
#[derive(Debug)]
pub struct CmdOutput {
    /// Whether the process exited with status 0
    pub success: bool,
    /// Trimmed stdout
    pub stdout: String,
    /// Combined stdout + stderr, trimmed (for error reporting)
    pub detail: String,
}

/// Run a command to completion and capture its output.
///
/// Spawn failures (binary missing, permissions) surface as `io::Error`;
/// a non-zero exit is reported through `CmdOutput::success` so callers can
/// attach their own error context.
pub async fn run<I, S>(program: &str, args: I) -> std::io::Result<CmdOutput>
where
    I: IntoIterator<Item = S>,
    S: AsRef<OsStr>,
{
    let output = Command::new(program).args(args).output().await?;
    Ok(CmdOutput {
        success: output.status.success(),
        stdout: String::from_utf8_lossy(&output.stdout).trim().to_string(),
        detail: combined_output(&output),
    })
}

/// Merge stdout and stderr into one diagnostic string
pub fn combined_output(output: &Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    let mut detail = String::with_capacity(stdout.len() + stderr.len() + 1);
    detail.push_str(stdout.trim());
    if !stdout.trim().is_empty() && !stderr.trim().is_empty() {
        detail.push('\n');
    }
    detail.push_str(stderr.trim());
    detail
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_run_captures_stdout() {
        let out = run("echo", ["hello"]).await.unwrap();
        assert!(out.success);
        assert_eq!(out.stdout, "hello");
    }

    #[tokio::test]
    async fn test_run_reports_failure() {
        let out = run("false", Vec::<String>::new()).await.unwrap();
        assert!(!out.success);
    }

    #[tokio::test]
    async fn test_run_missing_binary() {
        assert!(run("/nonexistent/binary", ["x"]).await.is_err());
    }
}
