//! Prompt assembly for role turns.
//!
//! Pure construction: inputs in, one string out, no I/O. The template fixes
//! the section order (role header, system instructions, skills, goal,
//! incoming payload, rules, JSON contract, schema hint, repair instruction);
//! the incoming payload is pretty-printed and truncated to a byte cap so one
//! oversized handoff cannot blow up every downstream prompt.

use minijinja::{context, Environment};
use serde_json::Value;

use crate::catalog::{PromptFlags, RoleSpec};

const TURN_TEMPLATE: &str = include_str!("prompts/turn.md");

/// Inputs for one prompt.
#[derive(Debug, Clone)]
pub struct PromptInputs<'a> {
    pub spec: &'a RoleSpec,
    pub goal: &'a str,
    pub cycle_index: u32,
    /// Reduced payload from the previous role, if any.
    pub incoming: Option<&'a Value>,
    pub is_repair: bool,
}

/// Builds prompts from the static turn template.
#[derive(Debug)]
pub struct PromptAssembler {
    payload_cap_bytes: usize,
    env: Environment<'static>,
}

impl PromptAssembler {
    pub fn new(payload_cap_bytes: usize) -> Self {
        let mut env = Environment::new();
        env.add_template("turn", TURN_TEMPLATE)
            .expect("turn template should be valid");
        Self {
            payload_cap_bytes,
            env,
        }
    }

    /// Render the prompt for one role turn.
    pub fn assemble(&self, inputs: &PromptInputs<'_>) -> String {
        let incoming = inputs
            .incoming
            .map(|payload| self.render_payload(payload))
            .filter(|rendered| !rendered.is_empty());

        let template = self.env.get_template("turn").expect("template registered");
        template
            .render(context! {
                role_name => &inputs.spec.name,
                cycle_index => inputs.cycle_index,
                system_instructions => inputs.spec.system_instructions.trim(),
                skills => &inputs.spec.skills,
                goal => inputs.goal.trim(),
                incoming => incoming,
                rules => capability_rules(&inputs.spec.prompt_flags),
                schema_hint => non_empty(inputs.spec.schema_hint.trim()),
                repair => inputs.is_repair,
            })
            .expect("turn template rendering should not fail")
    }

    fn render_payload(&self, payload: &Value) -> String {
        let pretty = serde_json::to_string_pretty(payload).unwrap_or_default();
        if pretty.len() <= self.payload_cap_bytes {
            return pretty;
        }
        let mut cut = self.payload_cap_bytes;
        while cut > 0 && !pretty.is_char_boundary(cut) {
            cut -= 1;
        }
        let dropped = pretty.len() - cut;
        format!("{}\n[truncated {} bytes]", &pretty[..cut], dropped)
    }
}

/// Rules block derived from the role's capability flags.
fn capability_rules(flags: &PromptFlags) -> String {
    let mut rules: Vec<&str> = Vec::new();
    rules.push(if flags.allow_tools {
        "- Tools and commands are allowed."
    } else {
        "- Do not run tools or commands."
    });
    rules.push(if flags.allow_read {
        "- You may READ files in the workspace."
    } else {
        "- Do not read workspace files."
    });
    rules.push(if flags.allow_write {
        "- You may WRITE files directly."
    } else {
        "- Never write files directly."
    });
    if flags.allow_file_suggestions {
        rules.push("- Return file changes only as proposals in files=[{path, content}].");
    }
    rules.push("- Keep the handoff small; put deep analysis into analysis_md (markdown string).");
    rules.join("\n")
}

fn non_empty(text: &str) -> Option<&str> {
    if text.is_empty() {
        None
    } else {
        Some(text)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::default_catalog;
    use serde_json::json;

    fn planner() -> RoleSpec {
        default_catalog().remove(0)
    }

    /// Sections appear in the mandated order.
    #[test]
    fn prompt_ordering_is_stable() {
        let spec = RoleSpec {
            skills: vec!["estimate".to_string()],
            ..planner()
        };
        let payload = json!({"summary": "from before"});
        let assembler = PromptAssembler::new(10_000);
        let prompt = assembler.assemble(&PromptInputs {
            spec: &spec,
            goal: "ship the cli",
            cycle_index: 2,
            incoming: Some(&payload),
            is_repair: true,
        });

        let header_pos = prompt.find("## Role: planner (cycle 2)").expect("header");
        let skills_pos = prompt.find("## Skills").expect("skills");
        let goal_pos = prompt.find("## Goal").expect("goal");
        let incoming_pos = prompt.find("## Input from previous role").expect("incoming");
        let rules_pos = prompt.find("## Rules").expect("rules");
        let contract_pos = prompt.find("## Output contract").expect("contract");
        let schema_pos = prompt.find("## Schema hint").expect("schema");
        let repair_pos = prompt.find("## Repair").expect("repair");

        assert!(header_pos < skills_pos, "header before skills");
        assert!(skills_pos < goal_pos, "skills before goal");
        assert!(goal_pos < incoming_pos, "goal before incoming");
        assert!(incoming_pos < rules_pos, "incoming before rules");
        assert!(rules_pos < contract_pos, "rules before contract");
        assert!(contract_pos < schema_pos, "contract before schema");
        assert!(schema_pos < repair_pos, "schema before repair");
    }

    #[test]
    fn optional_sections_disappear_when_absent() {
        let assembler = PromptAssembler::new(10_000);
        let spec = planner();
        let prompt = assembler.assemble(&PromptInputs {
            spec: &spec,
            goal: "goal",
            cycle_index: 1,
            incoming: None,
            is_repair: false,
        });

        assert!(!prompt.contains("## Skills"));
        assert!(!prompt.contains("## Input from previous role"));
        assert!(!prompt.contains("## Repair"));
        assert!(prompt.contains("## Output contract"));
    }

    #[test]
    fn incoming_payload_is_pretty_printed_and_capped() {
        let assembler = PromptAssembler::new(80);
        let spec = planner();
        let payload = json!({"blob": "x".repeat(500)});
        let prompt = assembler.assemble(&PromptInputs {
            spec: &spec,
            goal: "goal",
            cycle_index: 1,
            incoming: Some(&payload),
            is_repair: false,
        });

        assert!(prompt.contains("[truncated"));
        assert!(!prompt.contains(&"x".repeat(200)));
    }

    #[test]
    fn rules_reflect_capability_flags() {
        let rules = capability_rules(&PromptFlags {
            allow_tools: false,
            allow_read: true,
            allow_write: true,
            allow_file_suggestions: true,
        });
        assert!(rules.contains("Do not run tools"));
        assert!(rules.contains("You may READ"));
        assert!(rules.contains("You may WRITE"));
        assert!(rules.contains("files=[{path, content}]"));
    }
}
