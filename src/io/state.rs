//! Controller state persistence for a run.
//!
//! `controller_state.json` at the run root is the single source of truth for
//! what happened: one `TurnRecord` per completed turn plus the latest payload
//! each role produced. It is rewritten in full, atomically, after every turn.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::{SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::debug;

use crate::io::artifacts::write_json_atomic;
use crate::io::testcmd::TestStatus;

pub const CONTROLLER_STATE_FILE: &str = "controller_state.json";

/// Final classification of one turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TurnStatus {
    Ok,
    JsonFailed,
    TransportFailed,
    TimedOut,
}

/// Bookkeeping for one completed turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TurnRecord {
    pub cycle_index: u32,
    pub role_name: String,
    pub prompt_len: usize,
    /// RFC 3339 UTC timestamps.
    pub started_at: String,
    pub finished_at: String,
    pub status: TurnStatus,
    pub artifact_dir: PathBuf,
    pub applied_files_count: usize,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub test_status: Option<TestStatus>,
}

/// Run-wide state, rewritten in full after every turn.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ControllerState {
    pub run_id: String,
    pub goal: String,
    pub cycles_completed: u32,
    pub stop_requested: bool,
    pub latest_json_by_role: BTreeMap<String, Value>,
    pub history: Vec<TurnRecord>,
}

impl ControllerState {
    pub fn new(run_id: String, goal: String) -> Self {
        Self {
            run_id,
            goal,
            cycles_completed: 0,
            stop_requested: false,
            latest_json_by_role: BTreeMap::new(),
            history: Vec::new(),
        }
    }
}

/// Atomically write the controller state (temp file + rename).
pub fn write_controller_state(run_dir: &Path, state: &ControllerState) -> Result<()> {
    let path = run_dir.join(CONTROLLER_STATE_FILE);
    debug!(path = %path.display(), turns = state.history.len(), "writing controller state");
    write_json_atomic(&path, state)
}

pub fn load_controller_state(run_dir: &Path) -> Result<ControllerState> {
    let path = run_dir.join(CONTROLLER_STATE_FILE);
    let contents =
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

/// Current UTC time as RFC 3339 with millisecond precision.
pub fn now_rfc3339() -> String {
    Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true)
}

/// Lexicographically sortable run id, unique per process start:
/// `<UTC timestamp>_<random hex>`.
pub fn generate_run_id() -> String {
    format!(
        "{}_{:04x}",
        Utc::now().format("%Y%m%d_%H%M%S"),
        rand::random::<u16>()
    )
}
