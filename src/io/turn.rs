//! Single-turn execution against a role transport.
//!
//! A turn is one prompt → completion interaction: initialise the thread if
//! this transport has none yet, send `turn/start`, then consume events until
//! `turn/completed` or a deadline fires. Two timers run per turn: an idle
//! timer reset only by item deltas and completed items, and a fixed overall
//! timer. A run-wide cancellation token is checked before every blocking
//! read.

use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Result;
use serde::Serialize;
use serde_json::json;
use tracing::{debug, trace, warn};

use crate::catalog::{PromptFlags, RoleSpec};
use crate::core::event::{classify, ApprovalCategory, Event};
use crate::core::timeouts::TurnTimeouts;
use crate::io::transport::{NextMessage, RoleTransport, TransportClosed};

/// Poll granularity for blocking reads; keeps cancellation responsive.
const EVENT_POLL: Duration = Duration::from_millis(200);
/// Silence window that ends a stale-turn drain.
const DRAIN_WAIT: Duration = Duration::from_millis(200);
/// Upper bound on messages discarded per drain.
const DRAIN_LIMIT: usize = 1024;

/// Run-wide cancellation token shared by the scheduler and every turn.
#[derive(Debug, Clone, Default)]
pub struct CancelToken(Arc<AtomicBool>);

impl CancelToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancel(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn is_cancelled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

/// Error for a failed `initialize` → `thread/started` handshake. The
/// scheduler treats it like a transport start failure and aborts the run.
#[derive(Debug)]
pub struct HandshakeTimeout {
    pub role: String,
}

impl fmt::Display for HandshakeTimeout {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "role '{}': timed out waiting for thread/started", self.role)
    }
}

impl std::error::Error for HandshakeTimeout {}

/// Why a turn stopped collecting events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum CompletionReason {
    Normal,
    IdleTimeout,
    OverallTimeout,
    TransportClosed,
    Cancelled,
}

/// Aggregated output of one turn.
#[derive(Debug, Clone)]
pub struct TurnResult {
    /// Completed item texts joined by newline; falls back to `delta_text`
    /// when no item completed.
    pub assistant_text: String,
    /// Concatenated streaming fragments.
    pub delta_text: String,
    /// Ordered completed-item texts.
    pub item_texts: Vec<String>,
    pub completion_reason: CompletionReason,
}

impl TurnResult {
    fn assemble(
        item_texts: Vec<String>,
        delta_text: String,
        completion_reason: CompletionReason,
    ) -> Self {
        let assistant_text = if item_texts.is_empty() {
            delta_text.clone()
        } else {
            item_texts.join("\n")
        };
        Self {
            assistant_text,
            delta_text,
            item_texts,
            completion_reason,
        }
    }
}

/// One role's live session: its spec, transport, and protocol state.
#[derive(Debug)]
pub struct RoleBinding<T: RoleTransport> {
    pub spec: RoleSpec,
    pub transport: T,
    pub timeouts: TurnTimeouts,
    thread_id: Option<String>,
    needs_drain: bool,
    request_id: u64,
}

impl<T: RoleTransport> RoleBinding<T> {
    pub fn new(spec: RoleSpec, transport: T, timeouts: TurnTimeouts) -> Self {
        Self {
            spec,
            transport,
            timeouts,
            thread_id: None,
            needs_drain: false,
            request_id: 100,
        }
    }

    pub fn stop(&mut self) {
        self.transport.stop();
        self.thread_id = None;
    }

    fn next_request_id(&mut self) -> u64 {
        self.request_id += 1;
        self.request_id
    }
}

/// Drive one request/response turn through the binding's transport.
///
/// Returns `Err` only for a handshake timeout (the scheduler aborts the run
/// on it); every other outcome, including timeouts and a vanished child, is
/// an `Ok` result with the matching completion reason.
pub fn run_turn<T: RoleTransport>(
    binding: &mut RoleBinding<T>,
    prompt: &str,
    cancel: &CancelToken,
) -> Result<TurnResult> {
    if binding.needs_drain {
        drain_stale_turn(binding);
    }

    if binding.thread_id.is_none() {
        match initialize_thread(binding) {
            Ok(thread_id) => {
                debug!(role = %binding.spec.name, %thread_id, "thread started");
                binding.thread_id = Some(thread_id);
            }
            // A vanished child is an in-flight failure, scoped to the cycle;
            // only a silent-but-alive server escalates as HandshakeTimeout.
            Err(err) if err.downcast_ref::<TransportClosed>().is_some() => {
                return Ok(TurnResult::assemble(
                    Vec::new(),
                    String::new(),
                    CompletionReason::TransportClosed,
                ));
            }
            Err(err) => return Err(err),
        }
    }

    if send_turn_start(binding, prompt).is_err() {
        binding.thread_id = None;
        return Ok(TurnResult::assemble(
            Vec::new(),
            String::new(),
            CompletionReason::TransportClosed,
        ));
    }

    collect_events(binding, cancel)
}

fn collect_events<T: RoleTransport>(
    binding: &mut RoleBinding<T>,
    cancel: &CancelToken,
) -> Result<TurnResult> {
    let started = Instant::now();
    let overall_deadline = started + binding.timeouts.overall;
    let mut idle_deadline = started + binding.timeouts.idle;

    let mut item_texts: Vec<String> = Vec::new();
    let mut delta_text = String::new();

    loop {
        if cancel.is_cancelled() {
            return Ok(TurnResult::assemble(
                item_texts,
                delta_text,
                CompletionReason::Cancelled,
            ));
        }

        let now = Instant::now();
        if now >= overall_deadline {
            binding.needs_drain = true;
            return Ok(TurnResult::assemble(
                item_texts,
                delta_text,
                CompletionReason::OverallTimeout,
            ));
        }
        if now >= idle_deadline {
            binding.needs_drain = true;
            return Ok(TurnResult::assemble(
                item_texts,
                delta_text,
                CompletionReason::IdleTimeout,
            ));
        }

        let wait = (idle_deadline - now)
            .min(overall_deadline - now)
            .min(EVENT_POLL);
        let message = match binding.transport.next(wait) {
            NextMessage::Message(message) => message,
            NextMessage::TimedOut => continue,
            NextMessage::Closed => {
                binding.thread_id = None;
                return Ok(TurnResult::assemble(
                    item_texts,
                    delta_text,
                    CompletionReason::TransportClosed,
                ));
            }
        };

        match classify(&message) {
            Event::ThreadStarted { .. } => {
                // Already have a thread; late announcements are noise.
            }
            Event::ApprovalRequest {
                approval_id,
                category,
            } => {
                let approved = approval_allowed(category, &binding.spec.prompt_flags);
                debug!(
                    role = %binding.spec.name,
                    ?category,
                    approved,
                    "answering approval request"
                );
                let reply = json!({"id": approval_id, "result": {"approved": approved}});
                if binding.transport.send(&reply).is_err() {
                    binding.thread_id = None;
                    return Ok(TurnResult::assemble(
                        item_texts,
                        delta_text,
                        CompletionReason::TransportClosed,
                    ));
                }
                // Approvals do not reset the idle timer.
            }
            Event::ItemDelta { text } => {
                delta_text.push_str(&text);
                idle_deadline = Instant::now() + binding.timeouts.idle;
            }
            Event::ItemCompleted { text } => {
                item_texts.push(text);
                idle_deadline = Instant::now() + binding.timeouts.idle;
            }
            Event::TurnCompleted { .. } => {
                return Ok(TurnResult::assemble(
                    item_texts,
                    delta_text,
                    CompletionReason::Normal,
                ));
            }
            Event::Ignored => {
                trace!(role = %binding.spec.name, "ignored event");
            }
        }
    }
}

fn initialize_thread<T: RoleTransport>(binding: &mut RoleBinding<T>) -> Result<String> {
    let init = json!({
        "method": "initialize",
        "id": 0,
        "params": {
            "clientInfo": {
                "name": binding.spec.name,
                "title": binding.spec.name,
                "version": env!("CARGO_PKG_VERSION"),
            }
        },
    });
    binding.transport.send(&init)?;

    let deadline = Instant::now() + binding.timeouts.handshake;
    loop {
        let now = Instant::now();
        if now >= deadline {
            return Err(HandshakeTimeout {
                role: binding.spec.name.clone(),
            }
            .into());
        }
        match binding.transport.next((deadline - now).min(EVENT_POLL)) {
            NextMessage::Message(message) => {
                if let Event::ThreadStarted { thread_id } = classify(&message) {
                    return Ok(thread_id);
                }
                // Startup noise before the thread id is expected; skip it.
            }
            NextMessage::TimedOut => continue,
            NextMessage::Closed => return Err(TransportClosed.into()),
        }
    }
}

fn send_turn_start<T: RoleTransport>(binding: &mut RoleBinding<T>, prompt: &str) -> Result<()> {
    let thread_id = binding
        .thread_id
        .clone()
        .expect("thread id is established before turn/start");
    let request_id = binding.next_request_id();

    let mut params = json!({
        "threadId": thread_id,
        "input": [{"type": "text", "text": prompt}],
        "flags": {
            "allowTools": binding.spec.prompt_flags.allow_tools,
            "allowRead": binding.spec.prompt_flags.allow_read,
            "allowWrite": binding.spec.prompt_flags.allow_write,
            "allowFileSuggestions": binding.spec.prompt_flags.allow_file_suggestions,
        },
    });
    let model = binding.spec.resolved_model();
    if !model.is_empty() {
        params["model"] = json!(model);
    }
    if !binding.spec.reasoning_effort.is_empty() {
        params["reasoningEffort"] = json!(binding.spec.reasoning_effort);
    }
    if !binding.spec.skills.is_empty() {
        params["skills"] = json!(binding.spec.skills);
    }

    binding.transport.send(&json!({
        "method": "turn/start",
        "id": request_id,
        "params": params,
    }))
}

/// Discard queued messages from a timed-out turn, up to and including its
/// `turn/completed`. Stops on a silence window so a still-streaming stale
/// turn cannot stall the next one indefinitely.
fn drain_stale_turn<T: RoleTransport>(binding: &mut RoleBinding<T>) {
    let mut discarded = 0usize;
    for _ in 0..DRAIN_LIMIT {
        match binding.transport.next(DRAIN_WAIT) {
            NextMessage::Message(message) => {
                discarded += 1;
                if matches!(classify(&message), Event::TurnCompleted { .. }) {
                    break;
                }
            }
            NextMessage::TimedOut | NextMessage::Closed => break,
        }
    }
    if discarded > 0 {
        warn!(role = %binding.spec.name, discarded, "drained stale turn events");
    }
    binding.needs_drain = false;
}

fn approval_allowed(category: ApprovalCategory, flags: &PromptFlags) -> bool {
    match category {
        ApprovalCategory::Exec => flags.allow_tools,
        ApprovalCategory::Write | ApprovalCategory::Patch => flags.allow_write,
        ApprovalCategory::Read => flags.allow_read,
        ApprovalCategory::Other => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::{scripted_binding, ScriptedEvent, ScriptedTransport};
    use std::time::Duration;

    fn short_timeouts() -> TurnTimeouts {
        TurnTimeouts {
            handshake: Duration::from_millis(200),
            idle: Duration::from_millis(150),
            overall: Duration::from_millis(600),
        }
    }

    #[test]
    fn happy_turn_joins_completed_items() {
        let transport = ScriptedTransport::new(
            "t-1",
            vec![vec![
                ScriptedEvent::message(ScriptedTransport::completed_item("{\"a\":1}")),
                ScriptedEvent::message(ScriptedTransport::completed_item("tail")),
                ScriptedEvent::message(ScriptedTransport::turn_completed()),
            ]],
        );
        let mut binding = scripted_binding("worker", transport, short_timeouts());

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::Normal);
        assert_eq!(result.item_texts, vec!["{\"a\":1}", "tail"]);
        assert_eq!(result.assistant_text, "{\"a\":1}\ntail");
    }

    #[test]
    fn delta_text_is_fallback_when_no_items_completed() {
        let transport = ScriptedTransport::new(
            "t-1",
            vec![vec![
                ScriptedEvent::message(ScriptedTransport::delta("{\"b\"")),
                ScriptedEvent::message(ScriptedTransport::delta(":2}")),
                ScriptedEvent::message(ScriptedTransport::turn_completed()),
            ]],
        );
        let mut binding = scripted_binding("worker", transport, short_timeouts());

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.assistant_text, "{\"b\":2}");
        assert_eq!(result.delta_text, "{\"b\":2}");
        assert!(result.item_texts.is_empty());
    }

    /// Idle timeout with no events returns an empty result, not an error.
    #[test]
    fn silent_turn_times_out_idle_with_empty_text() {
        let transport = ScriptedTransport::new("t-1", vec![Vec::new()]);
        let mut binding = scripted_binding("worker", transport, short_timeouts());

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::IdleTimeout);
        assert_eq!(result.assistant_text, "");
    }

    #[test]
    fn overall_timeout_caps_an_endlessly_streaming_turn() {
        // Endless deltas keep resetting the idle timer; the overall timer
        // still ends the turn.
        let events: Vec<ScriptedEvent> = (0..10_000)
            .map(|_| ScriptedEvent::message(ScriptedTransport::delta("x")))
            .collect();
        let transport = ScriptedTransport::new("t-1", vec![events]).with_message_delay(
            Duration::from_millis(1),
        );
        let timeouts = TurnTimeouts {
            handshake: Duration::from_millis(200),
            idle: Duration::from_millis(400),
            overall: Duration::from_millis(300),
        };
        let mut binding = scripted_binding("worker", transport, timeouts);

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::OverallTimeout);
        assert!(!result.assistant_text.is_empty());
    }

    #[test]
    fn approvals_are_answered_by_prompt_flags_and_do_not_reset_idle() {
        let transport = ScriptedTransport::new(
            "t-1",
            vec![vec![
                ScriptedEvent::message(ScriptedTransport::approval_request(
                    7,
                    "item/commandExecution/requestApproval",
                )),
                ScriptedEvent::message(ScriptedTransport::approval_request(
                    8,
                    "item/fileChange/requestApproval",
                )),
                ScriptedEvent::message(ScriptedTransport::approval_request(
                    9,
                    "item/other/requestApproval",
                )),
                ScriptedEvent::message(ScriptedTransport::completed_item("{}")),
                ScriptedEvent::message(ScriptedTransport::turn_completed()),
            ]],
        );
        let mut binding = scripted_binding("worker", transport, short_timeouts());
        // Default flags: tools+read allowed, write denied.
        let sent = binding.transport.sent_log();

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::Normal);

        let sent = sent.lock().expect("sent log");
        let replies: Vec<(u64, bool)> = sent
            .iter()
            .filter(|m| m.get("result").is_some())
            .map(|m| {
                (
                    m["id"].as_u64().expect("id"),
                    m["result"]["approved"].as_bool().expect("approved"),
                )
            })
            .collect();
        assert_eq!(replies, vec![(7, true), (8, false), (9, false)]);
    }

    #[test]
    fn transport_close_mid_turn_is_surfaced_not_an_error() {
        let transport = ScriptedTransport::new(
            "t-1",
            vec![vec![
                ScriptedEvent::message(ScriptedTransport::delta("partial")),
                ScriptedEvent::Close,
            ]],
        );
        let mut binding = scripted_binding("worker", transport, short_timeouts());

        let result = run_turn(&mut binding, "prompt", &CancelToken::new()).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::TransportClosed);
        assert_eq!(result.assistant_text, "partial");
    }

    #[test]
    fn cancellation_wins_before_the_next_read() {
        let transport = ScriptedTransport::new("t-1", vec![Vec::new()]);
        let mut binding = scripted_binding("worker", transport, short_timeouts());
        let cancel = CancelToken::new();
        cancel.cancel();

        let result = run_turn(&mut binding, "prompt", &cancel).expect("turn");
        assert_eq!(result.completion_reason, CompletionReason::Cancelled);
    }

    #[test]
    fn handshake_timeout_is_a_typed_error() {
        let mut transport = ScriptedTransport::new("t-1", Vec::new());
        transport.suppress_handshake();
        let mut binding = scripted_binding("worker", transport, short_timeouts());

        let err = run_turn(&mut binding, "prompt", &CancelToken::new()).unwrap_err();
        assert!(err.downcast_ref::<HandshakeTimeout>().is_some());
    }

    #[test]
    fn second_turn_reuses_the_thread_and_drains_after_timeout() {
        let transport = ScriptedTransport::new(
            "t-9",
            vec![
                // First turn: stays silent -> idle timeout.
                Vec::new(),
                // Second turn: stale completion from turn one arrives first,
                // then the real answer.
                vec![
                    ScriptedEvent::message(ScriptedTransport::completed_item("{\"ok\":true}")),
                    ScriptedEvent::message(ScriptedTransport::turn_completed()),
                ],
            ],
        );
        let mut binding = scripted_binding("worker", transport, short_timeouts());
        // Queue the stale completion as if it arrived late, between turns.
        let cancel = CancelToken::new();

        let first = run_turn(&mut binding, "one", &cancel).expect("turn 1");
        assert_eq!(first.completion_reason, CompletionReason::IdleTimeout);

        binding
            .transport
            .push_pending(ScriptedTransport::turn_completed());

        let second = run_turn(&mut binding, "two", &cancel).expect("turn 2");
        assert_eq!(second.completion_reason, CompletionReason::Normal);
        assert_eq!(second.assistant_text, "{\"ok\":true}");

        // Exactly one initialize across both turns.
        let sent = binding.transport.sent_log();
        let sent = sent.lock().expect("sent log");
        let inits = sent
            .iter()
            .filter(|m| m.get("method").and_then(serde_json::Value::as_str) == Some("initialize"))
            .count();
        assert_eq!(inits, 1);
    }

    #[test]
    fn turn_start_carries_model_flags_and_skills() {
        let transport = ScriptedTransport::new(
            "t-1",
            vec![vec![ScriptedEvent::message(
                ScriptedTransport::turn_completed(),
            )]],
        );
        let spec = RoleSpec {
            name: "worker".to_string(),
            model: "model-x".to_string(),
            skills: vec!["review".to_string()],
            ..RoleSpec::default()
        };
        let mut binding = RoleBinding::new(spec, transport, short_timeouts());
        let sent = binding.transport.sent_log();

        run_turn(&mut binding, "prompt text", &CancelToken::new()).expect("turn");

        let sent = sent.lock().expect("sent log");
        let start = sent
            .iter()
            .find(|m| m.get("method").and_then(serde_json::Value::as_str) == Some("turn/start"))
            .expect("turn/start sent");
        assert_eq!(start["params"]["threadId"], "t-1");
        assert_eq!(start["params"]["model"], "model-x");
        assert_eq!(start["params"]["input"][0]["text"], "prompt text");
        assert_eq!(start["params"]["flags"]["allowWrite"], false);
        assert_eq!(start["params"]["skills"][0], "review");
    }
}
