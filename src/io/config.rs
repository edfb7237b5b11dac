//! Orchestrator configuration stored as TOML.
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values; the goal is the
//! only field that has to come from somewhere (file or CLI flag).

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{anyhow, Context, Result};
use serde::{Deserialize, Serialize};

use crate::catalog::{default_catalog, validate_roles, RoleSpec};
use crate::core::timeouts::{TimeoutSettings, MAX_TIMEOUT_S, MIN_TIMEOUT_S};

/// Orchestrator configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct OrchestratorConfig {
    /// Natural-language task the run executes.
    pub goal: String,

    /// How many passes through the role sequence before giving up.
    pub cycles: u32,

    /// Extra turns allowed per role to repair unparsable JSON replies.
    pub repair_attempts: u32,

    /// Run the test command after a role applied at least one file.
    pub run_tests: bool,

    /// Shell-free argv for the test command.
    pub test_command: Vec<String>,

    /// Directory file proposals are materialised into.
    pub workspace_root: PathBuf,

    /// Directory run artifact trees are created under.
    pub runs_root: PathBuf,

    /// Name of the assistant binary probed on PATH.
    pub assistant_binary: String,

    /// Locations tried when the binary is not on PATH.
    pub assistant_binary_fallbacks: Vec<PathBuf>,

    /// Allowed file extensions for proposals; empty list allows everything.
    pub allowed_file_extensions: Vec<String>,

    /// Truncate the prompt's incoming-payload section beyond this many bytes.
    pub payload_cap_bytes: usize,

    /// Truncate captured test stdout/stderr beyond this many bytes each.
    pub capture_cap_bytes: usize,

    pub handshake_timeout_s: u64,
    pub idle_timeout_default_s: u64,
    pub overall_timeout_default_s: u64,
    pub idle_timeout_planner_s: u64,
    pub overall_timeout_planner_s: u64,

    /// Ordered role pipeline; defaults to the built-in catalogue.
    pub roles: Vec<RoleSpec>,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            goal: String::new(),
            cycles: 2,
            repair_attempts: 1,
            run_tests: false,
            test_command: vec!["cargo".to_string(), "test".to_string()],
            workspace_root: PathBuf::from("."),
            runs_root: PathBuf::from(".runs"),
            assistant_binary: "codex".to_string(),
            assistant_binary_fallbacks: Vec::new(),
            allowed_file_extensions: Vec::new(),
            payload_cap_bytes: 65536,
            capture_cap_bytes: 65536,
            handshake_timeout_s: 15,
            idle_timeout_default_s: 180,
            overall_timeout_default_s: 600,
            idle_timeout_planner_s: 120,
            overall_timeout_planner_s: 240,
            roles: default_catalog(),
        }
    }
}

impl OrchestratorConfig {
    pub fn validate(&self) -> Result<()> {
        if self.goal.trim().is_empty() {
            return Err(anyhow!("goal must not be empty (set it in the config file or pass --goal)"));
        }
        if self.cycles == 0 {
            return Err(anyhow!("cycles must be >= 1"));
        }
        if self.run_tests
            && (self.test_command.is_empty() || self.test_command[0].trim().is_empty())
        {
            return Err(anyhow!("test_command must be a non-empty argv list when run_tests is set"));
        }
        if self.payload_cap_bytes == 0 {
            return Err(anyhow!("payload_cap_bytes must be > 0"));
        }
        if self.capture_cap_bytes == 0 {
            return Err(anyhow!("capture_cap_bytes must be > 0"));
        }
        if self.assistant_binary.trim().is_empty() {
            return Err(anyhow!("assistant_binary must not be empty"));
        }
        validate_timeout_pair(
            "idle_timeout_default_s",
            self.idle_timeout_default_s,
            "overall_timeout_default_s",
            self.overall_timeout_default_s,
        )?;
        validate_timeout_pair(
            "idle_timeout_planner_s",
            self.idle_timeout_planner_s,
            "overall_timeout_planner_s",
            self.overall_timeout_planner_s,
        )?;
        if self.handshake_timeout_s == 0 {
            return Err(anyhow!("handshake_timeout_s must be >= 1"));
        }
        validate_roles(&self.roles)?;
        Ok(())
    }

    pub fn timeout_settings(&self) -> TimeoutSettings {
        TimeoutSettings {
            handshake_s: self.handshake_timeout_s,
            idle_default_s: self.idle_timeout_default_s,
            overall_default_s: self.overall_timeout_default_s,
            idle_planner_s: self.idle_timeout_planner_s,
            overall_planner_s: self.overall_timeout_planner_s,
        }
    }
}

fn validate_timeout_pair(
    idle_name: &str,
    idle_s: u64,
    overall_name: &str,
    overall_s: u64,
) -> Result<()> {
    if !(MIN_TIMEOUT_S..=MAX_TIMEOUT_S).contains(&idle_s) {
        return Err(anyhow!(
            "{idle_name} must be within {MIN_TIMEOUT_S}..={MAX_TIMEOUT_S} seconds"
        ));
    }
    if overall_s < idle_s || overall_s > MAX_TIMEOUT_S {
        return Err(anyhow!(
            "{overall_name} must be within {idle_name}..={MAX_TIMEOUT_S} seconds"
        ));
    }
    Ok(())
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `OrchestratorConfig::default()` so the CLI
/// flags alone can drive a run. Validation happens after flag overrides.
pub fn load_config(path: &Path) -> Result<OrchestratorConfig> {
    if !path.exists() {
        return Ok(OrchestratorConfig::default());
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: OrchestratorConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &OrchestratorConfig) -> Result<()> {
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    write_atomic(path, &buf)
}

fn write_atomic(path: &Path, contents: &str) -> Result<()> {
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, contents)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn valid() -> OrchestratorConfig {
        OrchestratorConfig {
            goal: "build a todo cli".to_string(),
            ..OrchestratorConfig::default()
        }
    }

    #[test]
    fn load_missing_returns_default() {
        let temp = tempfile::tempdir().expect("tempdir");
        let cfg = load_config(&temp.path().join("missing.toml")).expect("load");
        assert_eq!(cfg, OrchestratorConfig::default());
    }

    #[test]
    fn write_then_load_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("conductor.toml");
        let cfg = valid();
        write_config(&path, &cfg).expect("write");
        let loaded = load_config(&path).expect("load");
        assert_eq!(loaded, cfg);
    }

    #[test]
    fn validate_rejects_empty_goal_and_zero_cycles() {
        let err = OrchestratorConfig::default().validate().unwrap_err();
        assert!(err.to_string().contains("goal"));

        let cfg = OrchestratorConfig {
            cycles: 0,
            ..valid()
        };
        assert!(cfg.validate().unwrap_err().to_string().contains("cycles"));
    }

    #[test]
    fn validate_rejects_inverted_timeouts() {
        let cfg = OrchestratorConfig {
            idle_timeout_default_s: 300,
            overall_timeout_default_s: 60,
            ..valid()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("overall_timeout_default_s"));
    }

    #[test]
    fn validate_rejects_empty_test_command_when_tests_enabled() {
        let cfg = OrchestratorConfig {
            run_tests: true,
            test_command: Vec::new(),
            ..valid()
        };
        let err = cfg.validate().unwrap_err();
        assert!(err.to_string().contains("test_command"));
    }

    #[test]
    fn partial_toml_fills_defaults() {
        let temp = tempfile::tempdir().expect("tempdir");
        let path = temp.path().join("conductor.toml");
        fs::write(&path, "goal = \"ship it\"\ncycles = 3\n").expect("write");
        let cfg = load_config(&path).expect("load");
        assert_eq!(cfg.goal, "ship it");
        assert_eq!(cfg.cycles, 3);
        assert_eq!(cfg.repair_attempts, 1);
        assert_eq!(cfg.roles.len(), 4);
        cfg.validate().expect("valid");
    }
}
