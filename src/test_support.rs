//! Test-only helpers: scripted transports and test runners.
//!
//! Scripted doubles let turn and scheduler tests run the real control flow
//! without spawning assistant subprocesses. A [`ScriptedTransport`] answers
//! `initialize` with a `thread/started` and replays one scripted event batch
//! per `turn/start`, recording every outbound message for assertions.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use anyhow::Result;
use serde_json::{json, Value};

use crate::catalog::RoleSpec;
use crate::core::timeouts::TurnTimeouts;
use crate::io::testcmd::{TestReport, TestRequest, TestRunner, TestStatus};
use crate::io::transport::{NextMessage, RoleTransport, TransportClosed};
use crate::io::turn::RoleBinding;

/// Cap on simulated blocking so scripted reads never hot-spin.
const SIMULATED_BLOCK: Duration = Duration::from_millis(25);

/// One scripted reaction inside a turn's event batch.
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    /// Deliver this message to the reader queue.
    Message(Value),
    /// Report one timed-out read.
    Silence,
    /// The child exits: this and all later reads report `Closed`.
    Close,
}

impl ScriptedEvent {
    pub fn message(value: Value) -> Self {
        Self::Message(value)
    }
}

/// Transport double that replays scripted turns and records outbound
/// messages.
#[derive(Debug)]
pub struct ScriptedTransport {
    thread_id: String,
    /// Event batches, one consumed per `turn/start`.
    turns: VecDeque<Vec<ScriptedEvent>>,
    pending: VecDeque<ScriptedEvent>,
    sent: Arc<Mutex<Vec<Value>>>,
    answer_handshake: bool,
    closed: bool,
    stopped: bool,
    message_delay: Duration,
}

impl ScriptedTransport {
    pub fn new(thread_id: &str, turns: Vec<Vec<ScriptedEvent>>) -> Self {
        Self {
            thread_id: thread_id.to_string(),
            turns: turns.into(),
            pending: VecDeque::new(),
            sent: Arc::new(Mutex::new(Vec::new())),
            answer_handshake: true,
            closed: false,
            stopped: false,
            message_delay: Duration::ZERO,
        }
    }

    /// Delay injected before every delivered message, to simulate a slow
    /// stream against real deadlines.
    pub fn with_message_delay(mut self, delay: Duration) -> Self {
        self.message_delay = delay;
        self
    }

    /// Do not answer `initialize`; forces a handshake timeout.
    pub fn suppress_handshake(&mut self) {
        self.answer_handshake = false;
    }

    /// Shared handle to every message the orchestrator sent, in order.
    pub fn sent_log(&self) -> Arc<Mutex<Vec<Value>>> {
        Arc::clone(&self.sent)
    }

    /// Queue a message as if it arrived outside any scripted turn.
    pub fn push_pending(&mut self, message: Value) {
        self.pending.push_back(ScriptedEvent::Message(message));
    }

    pub fn was_stopped(&self) -> bool {
        self.stopped
    }

    pub fn completed_item(text: &str) -> Value {
        json!({
            "method": "item/completed",
            "params": {"item": {"type": "agent_message", "text": text}},
        })
    }

    pub fn delta(text: &str) -> Value {
        json!({"method": "item/delta", "params": {"delta": text}})
    }

    pub fn turn_completed() -> Value {
        json!({"method": "turn/completed", "params": {}})
    }

    pub fn approval_request(id: u64, method: &str) -> Value {
        json!({"method": method, "id": id, "params": {}})
    }

    /// Batch for a turn that answers with one completed item then completes.
    pub fn simple_turn(text: &str) -> Vec<ScriptedEvent> {
        vec![
            ScriptedEvent::message(Self::completed_item(text)),
            ScriptedEvent::message(Self::turn_completed()),
        ]
    }
}

impl RoleTransport for ScriptedTransport {
    fn send(&mut self, message: &Value) -> Result<()> {
        if self.closed {
            return Err(TransportClosed.into());
        }
        self.sent.lock().expect("sent log").push(message.clone());

        match message.get("method").and_then(Value::as_str) {
            Some("initialize") => {
                if self.answer_handshake {
                    self.pending.push_back(ScriptedEvent::Message(json!({
                        "method": "thread/started",
                        "params": {"threadId": self.thread_id},
                    })));
                }
            }
            Some("turn/start") => {
                let batch = self.turns.pop_front().unwrap_or_default();
                self.pending.extend(batch);
            }
            _ => {}
        }
        Ok(())
    }

    fn next(&mut self, timeout: Duration) -> NextMessage {
        if self.closed {
            return NextMessage::Closed;
        }
        match self.pending.pop_front() {
            Some(ScriptedEvent::Message(message)) => {
                if !self.message_delay.is_zero() {
                    thread::sleep(self.message_delay.min(timeout));
                }
                NextMessage::Message(message)
            }
            Some(ScriptedEvent::Silence) | None => {
                thread::sleep(timeout.min(SIMULATED_BLOCK));
                NextMessage::TimedOut
            }
            Some(ScriptedEvent::Close) => {
                self.closed = true;
                NextMessage::Closed
            }
        }
    }

    fn stop(&mut self) {
        self.stopped = true;
    }
}

/// Binding over a scripted transport with a minimal role spec.
pub fn scripted_binding(
    name: &str,
    transport: ScriptedTransport,
    timeouts: TurnTimeouts,
) -> RoleBinding<ScriptedTransport> {
    let spec = RoleSpec {
        name: name.to_string(),
        ..RoleSpec::default()
    };
    RoleBinding::new(spec, transport, timeouts)
}

/// Test runner double returning a fixed report.
#[derive(Debug, Clone)]
pub struct ScriptedTestRunner {
    pub report: TestReport,
}

impl ScriptedTestRunner {
    pub fn passing() -> Self {
        Self {
            report: TestReport {
                status: TestStatus::Passed,
                exit_code: Some(0),
                stdout: "ok".to_string(),
                stderr: String::new(),
                stdout_truncated: 0,
                stderr_truncated: 0,
            },
        }
    }

    pub fn failing() -> Self {
        Self {
            report: TestReport {
                status: TestStatus::Failed,
                exit_code: Some(1),
                stdout: String::new(),
                stderr: "1 test failed".to_string(),
                stdout_truncated: 0,
                stderr_truncated: 0,
            },
        }
    }
}

impl TestRunner for ScriptedTestRunner {
    fn run(&self, _request: &TestRequest) -> Result<TestReport> {
        Ok(self.report.clone())
    }
}
