//! Extraction of a single JSON object from noisy assistant text.
//!
//! Roles are told to answer with exactly one JSON object, but real output
//! often wraps the object in prose or a code fence. The ladder here tries,
//! in order: parsing the whole string, scanning from the first `{` with
//! string/escape awareness, and re-running both steps on fenced-block
//! contents. Non-object roots are normalised so callers only ever see
//! objects.

use std::sync::LazyLock;

use regex::Regex;
use serde_json::{json, Value};

static FENCE_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"(?s)```[A-Za-z0-9_-]*[ \t]*\r?\n?(.*?)```").unwrap());

/// Extract one JSON object from `text`. Returns `None` when no well-formed
/// JSON value can be found.
pub fn extract_object(text: &str) -> Option<Value> {
    let trimmed = text.trim();
    if trimmed.is_empty() {
        return None;
    }

    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(normalize_root(value));
    }

    if let Some(value) = scan_braced_object(trimmed) {
        return Some(normalize_root(value));
    }

    for captures in FENCE_RE.captures_iter(trimmed) {
        let inner = captures.get(1).map(|m| m.as_str().trim()).unwrap_or("");
        if inner.is_empty() {
            continue;
        }
        if let Ok(value) = serde_json::from_str::<Value>(inner) {
            return Some(normalize_root(value));
        }
        if let Some(value) = scan_braced_object(inner) {
            return Some(normalize_root(value));
        }
    }

    None
}

/// Only objects cross component boundaries: arrays and scalars are wrapped.
fn normalize_root(value: Value) -> Value {
    match value {
        Value::Object(_) => value,
        Value::Array(_) => json!({ "items": value }),
        scalar => json!({ "value": scalar }),
    }
}

/// Scan forward from the first `{`, tracking brace depth with string and
/// escape awareness. Tries the first balanced close, then the last.
fn scan_braced_object(text: &str) -> Option<Value> {
    let start = text.find('{')?;
    let bytes = text.as_bytes();

    let mut closes: Vec<usize> = Vec::new();
    let mut depth = 0usize;
    let mut in_string = false;
    let mut escaped = false;

    for (offset, &byte) in bytes[start..].iter().enumerate() {
        if escaped {
            escaped = false;
            continue;
        }
        match byte {
            b'\\' if in_string => escaped = true,
            b'"' => in_string = !in_string,
            b'{' if !in_string => depth += 1,
            b'}' if !in_string => {
                depth = depth.saturating_sub(1);
                if depth == 0 {
                    closes.push(start + offset);
                }
            }
            _ => {}
        }
    }

    let first = closes.first()?;
    if let Ok(value) = serde_json::from_str::<Value>(&text[start..=*first]) {
        return Some(value);
    }
    let last = closes.last()?;
    if last != first {
        if let Ok(value) = serde_json::from_str::<Value>(&text[start..=*last]) {
            return Some(value);
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    /// A string that is already one well-formed object comes back unchanged.
    #[test]
    fn exact_object_round_trips() {
        let text = r#"{"summary":"ok","status":"CONTINUE"}"#;
        let value = extract_object(text).expect("object");
        assert_eq!(
            value,
            serde_json::from_str::<Value>(text).expect("reference parse")
        );
    }

    #[test]
    fn object_embedded_in_prose_is_found_by_brace_scan() {
        let value = extract_object("here is your plan: {\"summary\":\"s\"}").expect("object");
        assert_eq!(value, json!({"summary": "s"}));
    }

    #[test]
    fn braces_inside_strings_do_not_confuse_the_scan() {
        let text = r#"note {"a":"}{","b":"\"}"} trailing"#;
        let value = extract_object(text).expect("object");
        assert_eq!(value, json!({"a": "}{", "b": "\"}"}));
    }

    #[test]
    fn first_balanced_object_wins_over_later_siblings() {
        let text = r#"x {"a": 1} y {"b": 2}"#;
        let value = extract_object(text).expect("object");
        assert_eq!(value, json!({"a": 1}));
    }

    #[test]
    fn unparsable_balanced_spans_yield_none() {
        let text = r#"{"outer": {"inner": 1,} }"#;
        assert!(extract_object(text).is_none());
    }

    #[test]
    fn fenced_block_with_language_tag_is_unwrapped() {
        let text = "Answer:\n```json\n{\"ok\": true}\n```\ndone";
        let value = extract_object(text).expect("object");
        assert_eq!(value, json!({"ok": true}));

        // No braces outside the fence: only the fence ladder can find this.
        let value = extract_object("```json\n[1, 2]\n```").expect("value");
        assert_eq!(value, json!({"items": [1, 2]}));
    }

    #[test]
    fn array_root_is_wrapped_in_items() {
        let value = extract_object("[1, 2, 3]").expect("value");
        assert_eq!(value, json!({"items": [1, 2, 3]}));
    }

    #[test]
    fn scalar_root_is_wrapped_in_value() {
        let value = extract_object("42").expect("value");
        assert_eq!(value, json!({"value": 42}));
        let value = extract_object("null").expect("value");
        assert_eq!(value, json!({"value": null}));
    }

    #[test]
    fn plain_prose_yields_none() {
        assert!(extract_object("oops").is_none());
        assert!(extract_object("").is_none());
        assert!(extract_object("{ broken").is_none());
    }
}
