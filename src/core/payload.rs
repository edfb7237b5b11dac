//! Accessors over free-form role payloads.
//!
//! Payload shape is role-dependent; the core never imposes a schema. These
//! helpers read the handful of keys the scheduler cares about, with
//! defensive defaults for anything missing or mistyped.

use serde_json::Value;

pub const STATUS_KEY: &str = "status";
pub const FILES_KEY: &str = "files";
pub const ANALYSIS_KEY: &str = "analysis_md";
pub const ANALYSIS_PATH_KEY: &str = "analysis_md_path";
pub const NEXT_OWNER_KEY: &str = "next_owner_suggestion";

/// Terminal status label a finishing role must emit.
pub const DONE_STATUS: &str = "DONE";

/// A proposed file change from a role payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileProposal {
    pub path: String,
    pub content: String,
}

pub fn status(payload: &Value) -> Option<&str> {
    payload.get(STATUS_KEY).and_then(Value::as_str)
}

/// Whether the payload carries the terminal status. Trimmed, case-sensitive:
/// a "done" summary must not end a run.
pub fn signals_done(payload: &Value) -> bool {
    status(payload).map(str::trim) == Some(DONE_STATUS)
}

pub fn next_owner_suggestion(payload: &Value) -> Option<&str> {
    payload
        .get(NEXT_OWNER_KEY)
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|owner| !owner.is_empty())
}

/// Non-empty `analysis_md` markdown string, if present.
pub fn analysis_markdown(payload: &Value) -> Option<&str> {
    payload
        .get(ANALYSIS_KEY)
        .and_then(Value::as_str)
        .filter(|text| !text.trim().is_empty())
}

/// Raw `files` array, if the payload has one.
pub fn files(payload: &Value) -> Option<&Vec<Value>> {
    payload.get(FILES_KEY).and_then(Value::as_array)
}
