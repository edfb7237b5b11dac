//! Safe application of proposed files under the workspace root.
//!
//! Roles never write the workspace themselves; they propose
//! `files=[{path, content}]` entries and the applicator materialises the
//! valid ones. Invalid entries are skipped individually and reported; the
//! batch only counts as failed when every entry was rejected.

use std::path::{Component, Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use tracing::{debug, warn};

use crate::core::payload::FileProposal;
use crate::io::artifacts::write_text_atomic;

/// Successfully written proposal.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppliedFile {
    pub path: String,
    pub bytes: usize,
    pub sha256: String,
}

/// Skipped proposal with the reason it was refused.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RejectedFile {
    pub path: String,
    pub reason: String,
}

/// Result of applying one batch of proposals.
#[derive(Debug, Clone, Default)]
pub struct ApplyOutcome {
    pub applied: Vec<AppliedFile>,
    pub rejected: Vec<RejectedFile>,
}

impl ApplyOutcome {
    /// True when the batch contained proposals and none survived.
    pub fn all_rejected(&self) -> bool {
        self.applied.is_empty() && !self.rejected.is_empty()
    }
}

/// Validate and write a batch of file proposals under `workspace_root`.
pub fn apply_proposals(
    workspace_root: &Path,
    proposals: &[Value],
    allowed_extensions: &[String],
) -> ApplyOutcome {
    let mut outcome = ApplyOutcome::default();

    let canonical_root = match workspace_root.canonicalize() {
        Ok(root) => root,
        Err(err) => {
            warn!(root = %workspace_root.display(), %err, "workspace root unavailable");
            for entry in proposals {
                outcome.rejected.push(RejectedFile {
                    path: entry_path_label(entry),
                    reason: "workspace root unavailable".to_string(),
                });
            }
            return outcome;
        }
    };

    for entry in proposals {
        match process_entry(&canonical_root, entry, allowed_extensions) {
            Ok(applied) => {
                debug!(path = %applied.path, bytes = applied.bytes, "applied file proposal");
                outcome.applied.push(applied);
            }
            Err(rejected) => {
                warn!(path = %rejected.path, reason = %rejected.reason, "rejected file proposal");
                outcome.rejected.push(rejected);
            }
        }
    }

    outcome
}

fn process_entry(
    canonical_root: &Path,
    entry: &Value,
    allowed_extensions: &[String],
) -> Result<AppliedFile, RejectedFile> {
    let proposal = parse_proposal(entry)?;

    let relative = validate_relative_path(&proposal.path, allowed_extensions).map_err(|reason| {
        RejectedFile {
            path: proposal.path.clone(),
            reason,
        }
    })?;

    let target = canonical_root.join(&relative);
    ensure_contained(canonical_root, &target).map_err(|reason| RejectedFile {
        path: proposal.path.clone(),
        reason,
    })?;

    write_text_atomic(&target, &proposal.content).map_err(|err| RejectedFile {
        path: proposal.path.clone(),
        reason: format!("write failed: {err:#}"),
    })?;

    Ok(AppliedFile {
        sha256: sha256_hex(proposal.content.as_bytes()),
        bytes: proposal.content.len(),
        path: proposal.path,
    })
}

/// Shape check: a proposal is an object with string `path` and `content`.
fn parse_proposal(entry: &Value) -> Result<FileProposal, RejectedFile> {
    let object = entry.as_object().ok_or_else(|| RejectedFile {
        path: String::new(),
        reason: "invalid entry".to_string(),
    })?;

    let path = match object.get("path").and_then(Value::as_str) {
        Some(path) if !path.trim().is_empty() => path.trim().to_string(),
        _ => {
            return Err(RejectedFile {
                path: String::new(),
                reason: "invalid path".to_string(),
            })
        }
    };

    let content = match object.get("content").and_then(Value::as_str) {
        Some(content) => content.to_string(),
        None => {
            return Err(RejectedFile {
                path,
                reason: "invalid content".to_string(),
            })
        }
    };

    Ok(FileProposal { path, content })
}

/// Lexical validation: relative, no parent traversal, extension allowed.
/// Backslashes are treated as separators so mixed-style traversal cannot
/// slip through.
fn validate_relative_path(raw: &str, allowed_extensions: &[String]) -> Result<PathBuf, String> {
    let normalized = raw.replace('\\', "/");
    if normalized.starts_with('/') {
        return Err("absolute path".to_string());
    }
    if normalized.len() >= 2 && normalized.as_bytes()[1] == b':' {
        return Err("absolute path".to_string());
    }

    let mut parts: Vec<String> = Vec::new();
    for component in Path::new(&normalized).components() {
        match component {
            Component::Normal(part) => match part.to_str() {
                Some(part) if !part.trim().is_empty() => parts.push(part.to_string()),
                _ => return Err("invalid path".to_string()),
            },
            Component::CurDir => {}
            Component::ParentDir => return Err("path traversal".to_string()),
            Component::RootDir | Component::Prefix(_) => {
                return Err("absolute path".to_string())
            }
        }
    }
    if parts.is_empty() {
        return Err("invalid path".to_string());
    }

    if !allowed_extensions.is_empty() {
        let file_name = parts.last().expect("non-empty parts");
        let extension = Path::new(file_name)
            .extension()
            .and_then(|ext| ext.to_str())
            .unwrap_or("");
        let allowed = allowed_extensions.iter().any(|candidate| {
            candidate
                .trim_start_matches('.')
                .eq_ignore_ascii_case(extension)
        });
        if !allowed {
            return Err(format!("extension '{extension}' not allowed"));
        }
    }

    Ok(parts.iter().collect())
}

/// Containment check against symlink escapes: the nearest existing ancestor
/// and any existing symlinked target must resolve under the workspace root.
fn ensure_contained(canonical_root: &Path, target: &Path) -> Result<(), String> {
    let mut ancestor = target.parent();
    while let Some(dir) = ancestor {
        if dir.exists() {
            let resolved = dir
                .canonicalize()
                .map_err(|_| "path escapes workspace root".to_string())?;
            if !resolved.starts_with(canonical_root) {
                return Err("path escapes workspace root".to_string());
            }
            break;
        }
        ancestor = dir.parent();
    }

    if let Ok(metadata) = target.symlink_metadata() {
        if metadata.file_type().is_symlink() {
            let resolved = target
                .canonicalize()
                .map_err(|_| "path escapes workspace root".to_string())?;
            if !resolved.starts_with(canonical_root) {
                return Err("path escapes workspace root".to_string());
            }
        }
    }

    Ok(())
}

fn entry_path_label(entry: &Value) -> String {
    entry
        .get("path")
        .and_then(Value::as_str)
        .unwrap_or("")
        .trim()
        .to_string()
}

fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}
