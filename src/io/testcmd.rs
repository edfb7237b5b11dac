//! Execution of the configured test command after file application.
//!
//! The command is a shell-free argv list run with the workspace root as cwd.
//! Output is captured concurrently with bounded buffers so a chatty test
//! suite can neither deadlock the pipes nor exhaust memory. Test failure is
//! recorded, never fatal to the run.

use std::io::Read;
use std::path::PathBuf;
use std::process::{Command, Stdio};
use std::thread;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Wall-clock bound for one test command invocation.
const TEST_TIMEOUT: Duration = Duration::from_secs(600);

/// Classified result of a test command run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TestStatus {
    Passed,
    Failed,
    TimedOut,
    /// The runner itself failed (spawn error, missing binary, ...).
    Error,
}

/// Captured outcome written to `test_result.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestReport {
    pub status: TestStatus,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
    /// Bytes dropped beyond the capture cap.
    pub stdout_truncated: usize,
    pub stderr_truncated: usize,
}

/// Parameters for one test command invocation.
#[derive(Debug, Clone)]
pub struct TestRequest {
    pub workdir: PathBuf,
    /// Shell-free argv; first element is the program.
    pub command: Vec<String>,
    /// Per-stream capture cap in bytes.
    pub capture_cap_bytes: usize,
}

/// Abstraction over test execution backends; tests use scripted doubles.
pub trait TestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport>;
}

/// Runner that spawns the configured argv.
pub struct CommandTestRunner;

impl TestRunner for CommandTestRunner {
    fn run(&self, request: &TestRequest) -> Result<TestReport> {
        let program = request
            .command
            .first()
            .filter(|p| !p.trim().is_empty())
            .ok_or_else(|| anyhow!("test_command is empty"))?;

        debug!(command = ?request.command, "running test command");
        let mut child = Command::new(program)
            .args(&request.command[1..])
            .current_dir(&request.workdir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()
            .with_context(|| format!("spawn test command '{program}'"))?;

        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("stdout was not piped"))?;
        let stderr = child
            .stderr
            .take()
            .ok_or_else(|| anyhow!("stderr was not piped"))?;

        let cap = request.capture_cap_bytes;
        let stdout_handle = thread::spawn(move || read_stream_limited(stdout, cap));
        let stderr_handle = thread::spawn(move || read_stream_limited(stderr, cap));

        let mut timed_out = false;
        let status = match child
            .wait_timeout(TEST_TIMEOUT)
            .context("wait for test command")?
        {
            Some(status) => status,
            None => {
                warn!(timeout_secs = TEST_TIMEOUT.as_secs(), "test command timed out");
                timed_out = true;
                child.kill().context("kill test command")?;
                child.wait().context("wait test command after kill")?
            }
        };

        let (stdout, stdout_truncated) = join_capture(stdout_handle).context("join stdout")?;
        let (stderr, stderr_truncated) = join_capture(stderr_handle).context("join stderr")?;

        let test_status = if timed_out {
            TestStatus::TimedOut
        } else if status.success() {
            TestStatus::Passed
        } else {
            TestStatus::Failed
        };

        Ok(TestReport {
            status: test_status,
            exit_code: status.code(),
            stdout: String::from_utf8_lossy(&stdout).into_owned(),
            stderr: String::from_utf8_lossy(&stderr).into_owned(),
            stdout_truncated,
            stderr_truncated,
        })
    }
}

fn join_capture(handle: thread::JoinHandle<Result<(Vec<u8>, usize)>>) -> Result<(Vec<u8>, usize)> {
    match handle.join() {
        Ok(result) => result,
        Err(_) => Err(anyhow!("capture thread panicked")),
    }
}

/// Drain a stream fully while keeping at most `limit` bytes in memory.
fn read_stream_limited<R: Read>(mut reader: R, limit: usize) -> Result<(Vec<u8>, usize)> {
    let mut buf = Vec::new();
    let mut truncated = 0usize;
    let mut chunk = [0u8; 8192];

    loop {
        let n = reader.read(&mut chunk).context("read output")?;
        if n == 0 {
            break;
        }
        let remaining = limit.saturating_sub(buf.len());
        if remaining > 0 {
            let keep = n.min(remaining);
            buf.extend_from_slice(&chunk[..keep]);
            truncated += n.saturating_sub(keep);
        } else {
            truncated += n;
        }
    }

    Ok((buf, truncated))
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(command: &[&str], cap: usize) -> TestRequest {
        TestRequest {
            workdir: std::env::temp_dir(),
            command: command.iter().map(|s| s.to_string()).collect(),
            capture_cap_bytes: cap,
        }
    }

    #[test]
    #[cfg(unix)]
    fn passing_command_is_classified_passed() {
        let report = CommandTestRunner.run(&request(&["true"], 1000)).expect("run");
        assert_eq!(report.status, TestStatus::Passed);
        assert_eq!(report.exit_code, Some(0));
    }

    #[test]
    #[cfg(unix)]
    fn failing_command_is_classified_failed() {
        let report = CommandTestRunner.run(&request(&["false"], 1000)).expect("run");
        assert_eq!(report.status, TestStatus::Failed);
        assert_eq!(report.exit_code, Some(1));
    }

    #[test]
    #[cfg(unix)]
    fn stdout_is_captured_and_capped() {
        let report = CommandTestRunner
            .run(&request(&["echo", "hello test output"], 5))
            .expect("run");
        assert_eq!(report.status, TestStatus::Passed);
        assert_eq!(report.stdout, "hello");
        assert!(report.stdout_truncated > 0);
    }

    #[test]
    fn empty_command_is_an_error() {
        let err = CommandTestRunner.run(&request(&[], 1000)).unwrap_err();
        assert!(err.to_string().contains("test_command is empty"));
    }

    #[test]
    fn missing_binary_is_an_error() {
        let err = CommandTestRunner
            .run(&request(&["definitely-not-a-real-binary-xyz"], 1000))
            .unwrap_err();
        assert!(err.to_string().contains("spawn test command"));
    }
}
