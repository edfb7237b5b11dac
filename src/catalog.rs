//! Role specifications and the built-in role catalogue.
//!
//! A role spec describes one step of the pipeline: its system instructions,
//! model selection, prompt capability flags, and scheduler-facing behaviors.
//! Config files may override the catalogue with their own ordered role list;
//! the defaults below reproduce the classic planner → architect →
//! implementer → integrator pipeline.

use anyhow::{bail, Result};
use serde::{Deserialize, Serialize};

/// Capability flags injected into prompts and used for approval decisions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptFlags {
    /// Role may run tools/commands (grants `exec` approvals).
    pub allow_tools: bool,
    /// Role may read workspace files (grants `read` approvals).
    pub allow_read: bool,
    /// Role may write files directly (grants `write`/`patch` approvals).
    pub allow_write: bool,
    /// Role proposes file changes via `files=[{path, content}]` in its JSON.
    pub allow_file_suggestions: bool,
}

impl Default for PromptFlags {
    fn default() -> Self {
        Self {
            allow_tools: true,
            allow_read: true,
            allow_write: false,
            allow_file_suggestions: false,
        }
    }
}

/// Which timeout triple a role gets from configuration. Any label other
/// than `planner` means the default triple.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case", from = "String")]
pub enum TimeoutPolicy {
    Planner,
    #[default]
    Default,
}

impl From<String> for TimeoutPolicy {
    fn from(label: String) -> Self {
        if label.trim().eq_ignore_ascii_case("planner") {
            TimeoutPolicy::Planner
        } else {
            TimeoutPolicy::Default
        }
    }
}

/// Scheduler-facing role behaviors.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoleBehaviors {
    pub timeout_policy: TimeoutPolicy,
    /// File proposals in this role's payload are applied to the workspace.
    pub apply_files: bool,
    /// A `status: "DONE"` payload from this role ends the run.
    pub can_finish: bool,
}

/// Specification for one role in the pipeline.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RoleSpec {
    /// Unique role name within the run.
    pub name: String,
    pub system_instructions: String,
    /// Model requested from the assistant; empty means server default.
    pub model: String,
    /// Env var that overrides `model` when set (e.g. `PLANNER_MODEL`).
    pub model_env: String,
    /// Opaque reasoning effort label passed through to the assistant.
    pub reasoning_effort: String,
    pub prompt_flags: PromptFlags,
    pub behaviors: RoleBehaviors,
    /// Pseudo-schema appended to the role's prompt.
    pub schema_hint: String,
    /// Ordered skill names referenced in the prompt.
    pub skills: Vec<String>,
}

impl Default for RoleSpec {
    fn default() -> Self {
        Self {
            name: String::new(),
            system_instructions: String::new(),
            model: String::new(),
            model_env: String::new(),
            reasoning_effort: "high".to_string(),
            prompt_flags: PromptFlags::default(),
            behaviors: RoleBehaviors::default(),
            schema_hint: String::new(),
            skills: Vec::new(),
        }
    }
}

impl RoleSpec {
    /// Model after applying the role's env override, if any.
    pub fn resolved_model(&self) -> String {
        if !self.model_env.is_empty() {
            if let Ok(value) = std::env::var(&self.model_env) {
                let trimmed = value.trim();
                if !trimmed.is_empty() {
                    return trimmed.to_string();
                }
            }
        }
        self.model.clone()
    }
}

/// Validate an ordered role list: names must be unique and non-empty.
pub fn validate_roles(roles: &[RoleSpec]) -> Result<()> {
    if roles.is_empty() {
        bail!("role list must not be empty");
    }
    let mut seen = std::collections::BTreeSet::new();
    for spec in roles {
        let name = spec.name.trim();
        if name.is_empty() {
            bail!("role name must not be empty");
        }
        if !seen.insert(name.to_string()) {
            bail!("duplicate role name: {name}");
        }
    }
    Ok(())
}

/// Built-in four-role pipeline.
pub fn default_catalog() -> Vec<RoleSpec> {
    vec![
        RoleSpec {
            name: "planner".to_string(),
            system_instructions: "You are the PLANNER. Break the goal into concrete, \
                prioritised steps and delegate them to the downstream roles. Return \
                next_owner. Tools and commands are allowed; you may READ files but \
                never write them. JSON only, no extra text."
                .to_string(),
            model_env: "PLANNER_MODEL".to_string(),
            behaviors: RoleBehaviors {
                timeout_policy: TimeoutPolicy::Planner,
                ..RoleBehaviors::default()
            },
            schema_hint: "summary: <string>\n\
                tasks: [ { id: <string>, title: <string>, owner: architect|implementer|integrator, priority: <int> } ]\n\
                next_owner: architect|implementer|integrator\n\
                notes: <string>"
                .to_string(),
            ..RoleSpec::default()
        },
        RoleSpec {
            name: "architect".to_string(),
            system_instructions: "You are the ARCHITECT. Design modules, interfaces, \
                data flows, and directory layout, and produce actionable tasks for \
                the implementer. Tools and commands are allowed; you may READ files \
                but never write them. Put deep analysis into analysis_md (markdown \
                string inside the JSON) and keep the handoff small."
                .to_string(),
            model_env: "ARCHITECT_MODEL".to_string(),
            schema_hint: default_schema_hint(),
            ..RoleSpec::default()
        },
        RoleSpec {
            name: "implementer".to_string(),
            system_instructions: "You are the IMPLEMENTER. Implement the architecture \
                and tasks. Tools and commands are allowed; you may READ files but \
                never write them directly. Return file changes exclusively as \
                proposals in files=[{path, content}]. Put deep analysis into \
                analysis_md and keep the handoff small."
                .to_string(),
            model_env: "IMPLEMENTER_MODEL".to_string(),
            prompt_flags: PromptFlags {
                allow_file_suggestions: true,
                ..PromptFlags::default()
            },
            behaviors: RoleBehaviors {
                apply_files: true,
                ..RoleBehaviors::default()
            },
            schema_hint: "summary: <string>\n\
                files: [ { path: <string>, content: <string> } ]\n\
                analysis_md: <markdown>\n\
                next_owner_suggestion: planner"
                .to_string(),
            ..RoleSpec::default()
        },
        RoleSpec {
            name: "integrator".to_string(),
            system_instructions: "You are the INTEGRATOR/VERIFIER. Check the plan and \
                the applied changes for consistency, integration risk, and test \
                strategy. Tools and commands are allowed; you may READ and WRITE \
                files. Return status DONE or CONTINUE plus next_owner_suggestion, \
                with deep analysis in analysis_md."
                .to_string(),
            model_env: "INTEGRATOR_MODEL".to_string(),
            prompt_flags: PromptFlags {
                allow_write: true,
                ..PromptFlags::default()
            },
            behaviors: RoleBehaviors {
                can_finish: true,
                ..RoleBehaviors::default()
            },
            schema_hint: default_schema_hint(),
            ..RoleSpec::default()
        },
    ]
}

fn default_schema_hint() -> String {
    "summary: <string>\n\
     key_points: [<string>]\n\
     requests: { need_more_context: <bool>, files: [<string>], why: <string> }\n\
     analysis_md: <markdown>\n\
     status: <DONE|CONTINUE?>\n\
     next_owner_suggestion: planner"
        .to_string()
}
