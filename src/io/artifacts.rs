//! Per-turn artifact persistence under the run directory.
//!
//! Layout per run:
//!
//! ```text
//! <runs_root>/<run_id>/
//!   controller_state.json
//!   <role>/stderr.log            child stderr, append-only
//!   <role>/events.jsonl          raw inbound messages, append-only
//!   cycles/<cycle>/<role>/
//!     prompt.txt                 the exact prompt sent
//!     assistant_text.txt         the extracted final text
//!     delta_text.txt             raw streaming fragments
//!     items_text.md              per-item texts with separators
//!     handoff.json               payload after reduction
//!     analysis.md                sidecar for oversize analysis_md
//!     applied_files.json         present iff files were applied
//!     rejected_files.json        present iff any proposal was rejected
//!     test_result.json           present iff tests ran
//! ```
//!
//! Every write is atomic (temp file + rename), so any artifact on disk is
//! complete. Writing the same inputs twice yields bytewise identical files.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use serde::Serialize;
use serde_json::Value;

use crate::io::apply::{AppliedFile, RejectedFile};
use crate::io::testcmd::TestReport;

const ITEM_SEPARATOR: &str = "\n\n---\n\n";

/// Role-level (cycle-independent) paths within a run directory.
#[derive(Debug, Clone)]
pub struct RolePaths {
    pub dir: PathBuf,
    pub stderr_log_path: PathBuf,
    pub events_log_path: PathBuf,
}

impl RolePaths {
    pub fn new(run_dir: &Path, role_name: &str) -> Self {
        let dir = run_dir.join(role_name);
        Self {
            stderr_log_path: dir.join("stderr.log"),
            events_log_path: dir.join("events.jsonl"),
            dir,
        }
    }
}

/// Resolved artifact paths for one turn.
#[derive(Debug, Clone)]
pub struct TurnPaths {
    pub dir: PathBuf,
    pub prompt_path: PathBuf,
    pub assistant_text_path: PathBuf,
    pub delta_text_path: PathBuf,
    pub items_text_path: PathBuf,
    pub handoff_path: PathBuf,
    pub analysis_path: PathBuf,
    pub applied_files_path: PathBuf,
    pub rejected_files_path: PathBuf,
    pub test_result_path: PathBuf,
}

impl TurnPaths {
    pub fn new(run_dir: &Path, cycle_index: u32, role_name: &str) -> Self {
        let dir = run_dir
            .join("cycles")
            .join(cycle_index.to_string())
            .join(role_name);
        Self {
            prompt_path: dir.join("prompt.txt"),
            assistant_text_path: dir.join("assistant_text.txt"),
            delta_text_path: dir.join("delta_text.txt"),
            items_text_path: dir.join("items_text.md"),
            handoff_path: dir.join("handoff.json"),
            analysis_path: dir.join("analysis.md"),
            applied_files_path: dir.join("applied_files.json"),
            rejected_files_path: dir.join("rejected_files.json"),
            test_result_path: dir.join("test_result.json"),
            dir,
        }
    }
}

/// Everything persisted for one turn. Optional pieces are written only when
/// present, so absent files always mean "did not happen".
#[derive(Debug, Clone, Default)]
pub struct TurnArtifacts<'a> {
    pub prompt: &'a str,
    pub assistant_text: &'a str,
    pub delta_text: &'a str,
    pub item_texts: &'a [String],
    pub handoff: Option<&'a Value>,
    pub applied: Option<&'a [AppliedFile]>,
    pub rejected: Option<&'a [RejectedFile]>,
    pub test_report: Option<&'a TestReport>,
}

/// Persist one turn's artifacts.
pub fn write_turn(paths: &TurnPaths, artifacts: &TurnArtifacts<'_>) -> Result<()> {
    fs::create_dir_all(&paths.dir)
        .with_context(|| format!("create turn dir {}", paths.dir.display()))?;

    // Write in deterministic order to keep logs stable.
    write_text_atomic(&paths.prompt_path, artifacts.prompt)?;
    write_text_atomic(&paths.assistant_text_path, artifacts.assistant_text)?;
    write_text_atomic(&paths.delta_text_path, artifacts.delta_text)?;
    write_text_atomic(&paths.items_text_path, &artifacts.item_texts.join(ITEM_SEPARATOR))?;
    if let Some(handoff) = artifacts.handoff {
        write_json_atomic(&paths.handoff_path, handoff)?;
    }
    if let Some(applied) = artifacts.applied {
        write_json_atomic(&paths.applied_files_path, &applied)?;
    }
    if let Some(rejected) = artifacts.rejected {
        write_json_atomic(&paths.rejected_files_path, &rejected)?;
    }
    if let Some(report) = artifacts.test_report {
        write_json_atomic(&paths.test_result_path, report)?;
    }
    Ok(())
}

/// Atomically write text (temp file + rename on the same filesystem).
pub fn write_text_atomic(path: &Path, contents: &str) -> Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)
            .with_context(|| format!("create directory {}", parent.display()))?;
    }
    let file_name = path
        .file_name()
        .with_context(|| format!("path has no file name: {}", path.display()))?
        .to_string_lossy()
        .into_owned();
    let tmp_path = path.with_file_name(format!("{file_name}.tmp"));
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp file {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Atomically write pretty-printed JSON with a trailing newline.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    write_text_atomic(path, &buf)
}
