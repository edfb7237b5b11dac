//! Long-lived app-server subprocess transport.
//!
//! One transport owns one assistant subprocess. A dedicated reader thread
//! drains the child's stdout, parsing one JSON message per line into a
//! bounded queue; the scheduler thread is the only writer. Inbound lines
//! that do not parse as JSON are dropped with a warning and never reach the
//! classifier. Raw parsed messages are also appended to the role's
//! `events.jsonl` for auditability.

use std::env;
use std::fmt;
use std::fs::{File, OpenOptions};
use std::io::{self, BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::process::{Child, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::mpsc::{self, Receiver, RecvTimeoutError, SyncSender};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, warn};
use wait_timeout::ChildExt;

/// Env var overriding assistant binary lookup.
pub const ASSISTANT_BINARY_ENV: &str = "ASSISTANT_BINARY_PATH";

/// Queue capacity for inbound messages per transport.
const INBOUND_QUEUE_CAPACITY: usize = 1024;
/// Grace between closing stdin and killing the child.
const STOP_GRACE: Duration = Duration::from_secs(2);

/// Error raised when the assistant subprocess is gone. Callers branch on it
/// via `err.downcast_ref::<TransportClosed>()`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportClosed;

impl fmt::Display for TransportClosed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "transport closed: assistant subprocess is gone")
    }
}

impl std::error::Error for TransportClosed {}

/// Outcome of waiting for the next inbound message.
#[derive(Debug, Clone, PartialEq)]
pub enum NextMessage {
    Message(Value),
    TimedOut,
    Closed,
}

/// Seam between the turn runner and an assistant subprocess. Production uses
/// [`AppServerTransport`]; tests use scripted implementations.
pub trait RoleTransport {
    /// Serialise `message` as one JSON line and flush it to the child.
    fn send(&mut self, message: &Value) -> Result<()>;
    /// Dequeue the next inbound message, blocking up to `timeout`.
    fn next(&mut self, timeout: Duration) -> NextMessage;
    /// Graceful shutdown: close stdin, wait briefly, then kill.
    fn stop(&mut self);
}

/// How to locate and spawn the assistant binary for one role.
#[derive(Debug, Clone)]
pub struct SpawnOptions {
    /// Binary name probed on PATH (after the env override).
    pub binary: String,
    /// Paths tried when the PATH probe fails.
    pub fallbacks: Vec<PathBuf>,
    /// Child cwd; also the root file proposals are applied under.
    pub workspace_root: PathBuf,
    /// Per-role stderr sink (append-only).
    pub stderr_log: PathBuf,
    /// Per-role raw inbound event log (append-only JSONL).
    pub events_log: PathBuf,
}

/// Transport over a spawned `<assistant> app-server` child process.
#[derive(Debug)]
pub struct AppServerTransport {
    role_name: String,
    child: Child,
    stdin: Option<ChildStdin>,
    inbound: Receiver<Value>,
    reader: Option<JoinHandle<()>>,
}

impl AppServerTransport {
    /// Locate the binary, spawn the app-server, and start the reader worker.
    /// Returns as soon as the child is spawned; no handshake is awaited.
    pub fn start(role_name: &str, options: &SpawnOptions) -> Result<Self> {
        let binary = locate_binary(&options.binary, &options.fallbacks)?;
        let stderr = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&options.stderr_log)
            .with_context(|| format!("open stderr log {}", options.stderr_log.display()))?;

        let mut child = Command::new(&binary)
            .arg("app-server")
            .current_dir(&options.workspace_root)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::from(stderr))
            .spawn()
            .with_context(|| {
                format!(
                    "spawn assistant app-server for role '{role_name}' ({})",
                    binary.display()
                )
            })?;

        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| anyhow!("child stdin was not piped"))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| anyhow!("child stdout was not piped"))?;

        let (tx, rx) = mpsc::sync_channel(INBOUND_QUEUE_CAPACITY);
        let reader = spawn_reader(role_name.to_string(), stdout, tx, options.events_log.clone())
            .with_context(|| format!("spawn reader thread for role '{role_name}'"))?;
        debug!(role = role_name, binary = %binary.display(), "assistant app-server spawned");

        Ok(Self {
            role_name: role_name.to_string(),
            child,
            stdin: Some(stdin),
            inbound: rx,
            reader: Some(reader),
        })
    }
}

impl RoleTransport for AppServerTransport {
    fn send(&mut self, message: &Value) -> Result<()> {
        let stdin = self.stdin.as_mut().ok_or(TransportClosed)?;
        let mut line = serde_json::to_string(message).context("encode outbound message")?;
        line.push('\n');
        stdin.write_all(line.as_bytes()).map_err(|_| TransportClosed)?;
        stdin.flush().map_err(|_| TransportClosed)?;
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> NextMessage {
        match self.inbound.recv_timeout(timeout) {
            Ok(message) => NextMessage::Message(message),
            Err(RecvTimeoutError::Timeout) => NextMessage::TimedOut,
            Err(RecvTimeoutError::Disconnected) => NextMessage::Closed,
        }
    }

    fn stop(&mut self) {
        if let Some(mut stdin) = self.stdin.take() {
            // Best-effort graceful signal before the pipe closes.
            let mut line = json!({"method": "shutdown"}).to_string();
            line.push('\n');
            let _ = stdin.write_all(line.as_bytes());
            let _ = stdin.flush();
        }

        match self.child.wait_timeout(STOP_GRACE) {
            Ok(Some(status)) => {
                debug!(role = %self.role_name, %status, "assistant exited");
            }
            Ok(None) => {
                warn!(role = %self.role_name, "assistant did not exit within grace; killing");
                let _ = self.child.kill();
                let _ = self.child.wait();
            }
            Err(err) => {
                warn!(role = %self.role_name, %err, "wait for assistant failed");
                let _ = self.child.kill();
            }
        }

        if let Some(reader) = self.reader.take() {
            let _ = reader.join();
        }
    }
}

fn spawn_reader(
    role_name: String,
    stdout: ChildStdout,
    tx: SyncSender<Value>,
    events_log: PathBuf,
) -> io::Result<JoinHandle<()>> {
    thread::Builder::new()
        .name(format!("{role_name}-reader"))
        .spawn(move || {
            let mut events = open_events_log(&events_log);
            for line in BufReader::new(stdout).lines() {
                let line = match line {
                    Ok(line) => line,
                    Err(err) => {
                        warn!(role = %role_name, %err, "assistant stdout read failed");
                        break;
                    }
                };
                let message = match parse_message_line(&line) {
                    Some(message) => message,
                    None => {
                        if !line.trim().is_empty() {
                            warn!(role = %role_name, line = %line.trim(), "discarding non-JSON line");
                        }
                        continue;
                    }
                };
                if let Some(file) = events.as_mut() {
                    let _ = writeln!(file, "{message}");
                }
                if tx.send(message).is_err() {
                    // Receiver dropped: transport is stopping.
                    break;
                }
            }
            // Sender drops here; a disconnected queue is the closed sentinel.
        })
}

/// Parse one inbound line. `None` for blank or non-JSON lines.
fn parse_message_line(line: &str) -> Option<Value> {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return None;
    }
    serde_json::from_str(trimmed).ok()
}

fn open_events_log(path: &Path) -> Option<File> {
    match OpenOptions::new().create(true).append(true).open(path) {
        Ok(file) => Some(file),
        Err(err) => {
            warn!(path = %path.display(), %err, "events log unavailable");
            None
        }
    }
}

/// Locate the assistant binary: env override, then PATH, then fallbacks.
fn locate_binary(name: &str, fallbacks: &[PathBuf]) -> Result<PathBuf> {
    if let Ok(value) = env::var(ASSISTANT_BINARY_ENV) {
        let trimmed = value.trim();
        if !trimmed.is_empty() {
            let path = PathBuf::from(trimmed);
            if path.is_file() {
                return Ok(path);
            }
            return Err(anyhow!(
                "{ASSISTANT_BINARY_ENV} points to missing binary {}",
                path.display()
            ));
        }
    }

    if let Some(found) = search_path(name) {
        return Ok(found);
    }

    for candidate in fallbacks {
        if candidate.is_file() {
            return Ok(candidate.clone());
        }
    }

    Err(anyhow!(
        "assistant binary '{name}' not found on PATH (set {ASSISTANT_BINARY_ENV} or configure assistant_binary_fallbacks)"
    ))
}

fn search_path(name: &str) -> Option<PathBuf> {
    let paths = env::var_os("PATH")?;
    for dir in env::split_paths(&paths) {
        if dir.as_os_str().is_empty() {
            continue;
        }
        let candidate = dir.join(name);
        if candidate.is_file() {
            return Some(candidate);
        }
    }
    None
}
