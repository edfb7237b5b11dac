//! Classification of inbound app-server messages.
//!
//! The classifier is the single place that knows the assistant's wire
//! vocabulary; no other component inspects raw message field names. Anything
//! outside the recognised set is `Ignored` and logged at trace level by the
//! caller.

use serde_json::Value;

const REQUEST_APPROVAL_SUFFIX: &str = "/requestApproval";

/// Category of action an approval request asks for.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApprovalCategory {
    Exec,
    Write,
    Read,
    Patch,
    Other,
}

/// Classified inbound protocol message.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// Server-assigned thread id for this transport.
    ThreadStarted { thread_id: String },
    /// The assistant asks permission for an action; the id is echoed back
    /// verbatim in the reply.
    ApprovalRequest {
        approval_id: Value,
        category: ApprovalCategory,
    },
    /// Streaming text fragment.
    ItemDelta { text: String },
    /// Final text of one item (possibly empty).
    ItemCompleted { text: String },
    /// The turn is over; carries an optional usage blob.
    TurnCompleted { usage: Option<Value> },
    /// Anything else.
    Ignored,
}

/// Classify one inbound message into the event set.
pub fn classify(message: &Value) -> Event {
    let method = message.get("method").and_then(Value::as_str).unwrap_or("");

    if method.ends_with(REQUEST_APPROVAL_SUFFIX) {
        let approval_id = match message.get("id") {
            Some(id) if !id.is_null() => id.clone(),
            _ => return Event::Ignored,
        };
        return Event::ApprovalRequest {
            approval_id,
            category: approval_category(method),
        };
    }

    match method {
        "thread/started" => thread_started(message),
        "item/delta" => Event::ItemDelta {
            text: delta_text(message),
        },
        "item/completed" => Event::ItemCompleted {
            text: item_text(message.pointer("/params/item").unwrap_or(&Value::Null)),
        },
        "turn/completed" => Event::TurnCompleted {
            usage: message.pointer("/params/usage").cloned(),
        },
        _ => Event::Ignored,
    }
}

fn approval_category(method: &str) -> ApprovalCategory {
    if method.contains("commandExecution") {
        ApprovalCategory::Exec
    } else if method.contains("patch") || method.contains("applyPatch") {
        ApprovalCategory::Patch
    } else if method.contains("fileChange") {
        ApprovalCategory::Write
    } else if method.contains("fileRead") {
        ApprovalCategory::Read
    } else {
        ApprovalCategory::Other
    }
}

fn thread_started(message: &Value) -> Event {
    let params = message.get("params").unwrap_or(&Value::Null);
    let id = params
        .get("threadId")
        .or_else(|| params.get("thread_id"))
        .and_then(Value::as_str)
        .or_else(|| params.pointer("/thread/id").and_then(Value::as_str))
        .unwrap_or("");
    if id.is_empty() {
        return Event::Ignored;
    }
    Event::ThreadStarted {
        thread_id: id.to_string(),
    }
}

fn delta_text(message: &Value) -> String {
    let params = message.get("params").unwrap_or(&Value::Null);
    // Deltas arrive either as a bare string or as a partial item.
    match params.get("delta") {
        Some(Value::String(text)) => text.clone(),
        Some(item @ Value::Object(_)) => item_text(item),
        _ => item_text(params.get("item").unwrap_or(&Value::Null)),
    }
}

/// Extract text from the variant item shapes the server emits:
/// `item.text`, `item.content = [{type: "text", text}, ...]`, `item.summary`.
fn item_text(item: &Value) -> String {
    if let Some(text) = item.get("text").and_then(Value::as_str) {
        if !text.trim().is_empty() {
            return text.to_string();
        }
    }

    if let Some(content) = item.get("content").and_then(Value::as_array) {
        let mut parts: Vec<&str> = Vec::new();
        for entry in content {
            if entry.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(text) = entry.get("text").and_then(Value::as_str) {
                    parts.push(text);
                }
            }
        }
        if !parts.is_empty() {
            return parts.concat();
        }
    }

    if let Some(summary) = item.get("summary").and_then(Value::as_str) {
        if !summary.trim().is_empty() {
            return summary.to_string();
        }
    }

    String::new()
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn classifies_thread_started_variants() {
        let direct = json!({"method": "thread/started", "params": {"threadId": "t-1"}});
        assert_eq!(
            classify(&direct),
            Event::ThreadStarted {
                thread_id: "t-1".to_string()
            }
        );

        let nested = json!({"method": "thread/started", "params": {"thread": {"id": "t-2"}}});
        assert_eq!(
            classify(&nested),
            Event::ThreadStarted {
                thread_id: "t-2".to_string()
            }
        );

        let missing = json!({"method": "thread/started", "params": {}});
        assert_eq!(classify(&missing), Event::Ignored);
    }

    #[test]
    fn classifies_approval_categories_from_method_path() {
        let cases = [
            ("item/commandExecution/requestApproval", ApprovalCategory::Exec),
            ("item/fileChange/requestApproval", ApprovalCategory::Write),
            ("item/fileRead/requestApproval", ApprovalCategory::Read),
            ("item/patch/requestApproval", ApprovalCategory::Patch),
            ("item/network/requestApproval", ApprovalCategory::Other),
        ];
        for (method, expected) in cases {
            let message = json!({"method": method, "id": 7});
            match classify(&message) {
                Event::ApprovalRequest {
                    approval_id,
                    category,
                } => {
                    assert_eq!(approval_id, json!(7));
                    assert_eq!(category, expected, "method {method}");
                }
                other => panic!("expected approval request for {method}, got {other:?}"),
            }
        }
    }

    #[test]
    fn approval_without_id_is_ignored() {
        let message = json!({"method": "item/fileChange/requestApproval"});
        assert_eq!(classify(&message), Event::Ignored);
    }

    #[test]
    fn item_completed_text_falls_back_through_shapes() {
        let direct = json!({"method": "item/completed", "params": {"item": {"text": "hello"}}});
        assert_eq!(
            classify(&direct),
            Event::ItemCompleted {
                text: "hello".to_string()
            }
        );

        let content = json!({"method": "item/completed", "params": {"item": {
            "content": [{"type": "text", "text": "a"}, {"type": "image"}, {"type": "text", "text": "b"}]
        }}});
        assert_eq!(
            classify(&content),
            Event::ItemCompleted {
                text: "ab".to_string()
            }
        );

        let summary = json!({"method": "item/completed", "params": {"item": {"summary": "thought"}}});
        assert_eq!(
            classify(&summary),
            Event::ItemCompleted {
                text: "thought".to_string()
            }
        );

        let empty = json!({"method": "item/completed", "params": {"item": {}}});
        assert_eq!(
            classify(&empty),
            Event::ItemCompleted {
                text: String::new()
            }
        );
    }

    #[test]
    fn delta_accepts_string_and_item_shapes() {
        let string_delta = json!({"method": "item/delta", "params": {"delta": "frag"}});
        assert_eq!(
            classify(&string_delta),
            Event::ItemDelta {
                text: "frag".to_string()
            }
        );

        let item_delta = json!({"method": "item/delta", "params": {"delta": {"text": "frag2"}}});
        assert_eq!(
            classify(&item_delta),
            Event::ItemDelta {
                text: "frag2".to_string()
            }
        );
    }

    #[test]
    fn turn_completed_carries_optional_usage() {
        let with_usage =
            json!({"method": "turn/completed", "params": {"usage": {"input_tokens": 10}}});
        assert_eq!(
            classify(&with_usage),
            Event::TurnCompleted {
                usage: Some(json!({"input_tokens": 10}))
            }
        );

        let without = json!({"method": "turn/completed"});
        assert_eq!(classify(&without), Event::TurnCompleted { usage: None });
    }

    #[test]
    fn unknown_methods_and_responses_are_ignored() {
        assert_eq!(
            classify(&json!({"method": "thread/tokenUsage/updated"})),
            Event::Ignored
        );
        assert_eq!(classify(&json!({"id": 1, "result": {}})), Event::Ignored);
        assert_eq!(classify(&json!("not an object")), Event::Ignored);
    }
}
