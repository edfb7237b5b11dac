//! Run lifecycle: role sequencing, JSON repair, payload reduction, and
//! termination.
//!
//! The scheduler owns the run: it starts one transport per role in
//! declaration order, then walks the role sequence for up to `cycles`
//! passes. Each role turn produces a JSON payload (repaired if necessary)
//! that is reduced and forwarded to the next role. A role with `can_finish`
//! ends the run by answering `status: "DONE"`. Roles run strictly
//! sequentially; the only concurrency lives inside each transport's reader
//! worker.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::catalog::RoleSpec;
use crate::core::extract::extract_object;
use crate::core::payload;
use crate::core::timeouts::resolve;
use crate::io::apply::{apply_proposals, ApplyOutcome};
use crate::io::artifacts::{write_text_atomic, write_turn, RolePaths, TurnArtifacts, TurnPaths};
use crate::io::config::OrchestratorConfig;
use crate::io::prompt::{PromptAssembler, PromptInputs};
use crate::io::state::{
    generate_run_id, now_rfc3339, write_controller_state, ControllerState, TurnRecord, TurnStatus,
};
use crate::io::testcmd::{CommandTestRunner, TestReport, TestRequest, TestRunner, TestStatus};
use crate::io::transport::{AppServerTransport, RoleTransport, SpawnOptions};
use crate::io::turn::{run_turn, CancelToken, CompletionReason, RoleBinding, TurnResult};

/// Synthetic error label forwarded when JSON repair is exhausted.
pub const JSON_PARSE_FAILED: &str = "json_parse_failed";

/// Cap on the raw-text excerpt inside the synthetic error payload.
const RAW_EXCERPT_CAP_BYTES: usize = 2048;

/// Summary of a finished run.
#[derive(Debug, Clone)]
pub struct RunOutcome {
    pub run_id: String,
    pub run_dir: PathBuf,
    /// A `can_finish` role answered `status: "DONE"`.
    pub reached_done: bool,
    pub cycles_completed: u32,
}

enum RoleTurnOutcome {
    /// Turn produced a payload for the next role; `finished` ends the run.
    Forwarded { payload: Value, finished: bool },
    /// The role's subprocess is gone; run impact depends on role position.
    TransportLost,
    Cancelled,
}

/// Drives one run to completion.
pub struct Scheduler<T: RoleTransport, R: TestRunner> {
    config: OrchestratorConfig,
    bindings: Vec<RoleBinding<T>>,
    tester: R,
    cancel: CancelToken,
    assembler: PromptAssembler,
    run_id: String,
    run_dir: PathBuf,
    state: ControllerState,
    reached_done: bool,
}

impl Scheduler<AppServerTransport, CommandTestRunner> {
    /// Start a production run: one app-server subprocess per configured role.
    pub fn start(config: OrchestratorConfig, cancel: CancelToken) -> Result<Self> {
        let binary = config.assistant_binary.clone();
        let fallbacks = config.assistant_binary_fallbacks.clone();
        let workspace_root = config.workspace_root.clone();
        Self::start_with(
            config,
            cancel,
            move |spec: &RoleSpec, role_paths: &RolePaths| {
                AppServerTransport::start(
                    &spec.name,
                    &SpawnOptions {
                        binary: binary.clone(),
                        fallbacks: fallbacks.clone(),
                        workspace_root: workspace_root.clone(),
                        stderr_log: role_paths.stderr_log_path.clone(),
                        events_log: role_paths.events_log_path.clone(),
                    },
                )
            },
            CommandTestRunner,
        )
    }
}

impl<T: RoleTransport, R: TestRunner> Scheduler<T, R> {
    /// Start a run over arbitrary transports. Validates configuration,
    /// creates the run directory (before any turn starts), and starts every
    /// role's transport in declaration order; failure to start any role
    /// stops the already-started ones and aborts.
    pub fn start_with(
        config: OrchestratorConfig,
        cancel: CancelToken,
        mut transport_factory: impl FnMut(&RoleSpec, &RolePaths) -> Result<T>,
        tester: R,
    ) -> Result<Self> {
        config.validate().context("invalid configuration")?;

        fs::create_dir_all(&config.workspace_root).with_context(|| {
            format!("create workspace root {}", config.workspace_root.display())
        })?;
        let run_id = generate_run_id();
        let run_dir = config.runs_root.join(&run_id);
        fs::create_dir_all(&run_dir)
            .with_context(|| format!("create run dir {}", run_dir.display()))?;

        let settings = config.timeout_settings();
        let mut bindings: Vec<RoleBinding<T>> = Vec::new();
        for spec in &config.roles {
            let role_paths = RolePaths::new(&run_dir, &spec.name);
            fs::create_dir_all(&role_paths.dir)
                .with_context(|| format!("create role dir {}", role_paths.dir.display()))?;
            match transport_factory(spec, &role_paths) {
                Ok(transport) => {
                    let timeouts = resolve(spec.behaviors.timeout_policy, &settings);
                    bindings.push(RoleBinding::new(spec.clone(), transport, timeouts));
                }
                Err(err) => {
                    for binding in &mut bindings {
                        binding.stop();
                    }
                    return Err(err)
                        .with_context(|| format!("start transport for role '{}'", spec.name));
                }
            }
        }

        let state = ControllerState::new(run_id.clone(), config.goal.clone());
        write_controller_state(&run_dir, &state)?;
        info!(%run_id, roles = bindings.len(), "run initialised");

        Ok(Self {
            assembler: PromptAssembler::new(config.payload_cap_bytes),
            config,
            bindings,
            tester,
            cancel,
            run_id,
            run_dir,
            state,
            reached_done: false,
        })
    }

    pub fn run_id(&self) -> &str {
        &self.run_id
    }

    pub fn run_dir(&self) -> &Path {
        &self.run_dir
    }

    /// Execute the run: cycle loop, teardown, final state write.
    pub fn run(mut self) -> Result<RunOutcome> {
        let result = self.run_cycles();
        self.stop_all();
        if let Err(err) = write_controller_state(&self.run_dir, &self.state) {
            warn!(%err, "final controller state write failed");
        }
        result?;

        Ok(RunOutcome {
            run_id: self.run_id,
            run_dir: self.run_dir,
            reached_done: self.reached_done,
            cycles_completed: self.state.cycles_completed,
        })
    }

    fn run_cycles(&mut self) -> Result<()> {
        // The first role of the run sees only the goal.
        let mut current = json!({ "goal": self.config.goal });

        for cycle_index in 1..=self.config.cycles {
            if self.state.stop_requested || self.cancel.is_cancelled() {
                break;
            }
            info!(cycle_index, total = self.config.cycles, "cycle started");

            for role_index in 0..self.bindings.len() {
                if self.state.stop_requested || self.cancel.is_cancelled() {
                    break;
                }
                let role_name = self.bindings[role_index].spec.name.clone();

                match self.run_role_turn(cycle_index, role_index, &current)? {
                    RoleTurnOutcome::Forwarded { payload, finished } => {
                        current = payload;
                        if finished {
                            info!(role = %role_name, "role signalled DONE; stopping");
                            self.state.stop_requested = true;
                            self.reached_done = true;
                        }
                    }
                    RoleTurnOutcome::TransportLost => {
                        if role_index == 0 {
                            bail!(
                                "transport for role '{role_name}' closed during the first role of cycle {cycle_index}; aborting run"
                            );
                        }
                        warn!(cycle_index, role = %role_name, "transport closed; ending cycle");
                        break;
                    }
                    RoleTurnOutcome::Cancelled => {
                        info!("cancellation requested; stopping cleanly");
                        return Ok(());
                    }
                }
            }

            self.state.cycles_completed = cycle_index;
            write_controller_state(&self.run_dir, &self.state)?;
        }
        Ok(())
    }

    /// One logical role turn: first attempt plus up to `repair_attempts`
    /// repair turns on the same thread, then reduction, file application,
    /// tests, artifact persistence, and bookkeeping.
    fn run_role_turn(
        &mut self,
        cycle_index: u32,
        role_index: usize,
        incoming: &Value,
    ) -> Result<RoleTurnOutcome> {
        let spec = self.bindings[role_index].spec.clone();
        let paths = TurnPaths::new(&self.run_dir, cycle_index, &spec.name);
        let started_at = now_rfc3339();

        let first_prompt = self.assembler.assemble(&PromptInputs {
            spec: &spec,
            goal: &self.config.goal,
            cycle_index,
            incoming: Some(incoming),
            is_repair: false,
        });
        let prompt_len = first_prompt.len();

        let mut prompt = first_prompt.clone();
        let mut attempt: u32 = 0;
        let mut turn: TurnResult;
        let mut parsed: Option<Value>;
        loop {
            turn = run_turn(&mut self.bindings[role_index], &prompt, &self.cancel)?;
            match turn.completion_reason {
                CompletionReason::Cancelled => return Ok(RoleTurnOutcome::Cancelled),
                CompletionReason::TransportClosed => {
                    self.record_turn(
                        &paths,
                        cycle_index,
                        &spec,
                        &first_prompt,
                        prompt_len,
                        started_at,
                        &turn,
                        None,
                        None,
                        None,
                        TurnStatus::TransportFailed,
                    )?;
                    return Ok(RoleTurnOutcome::TransportLost);
                }
                _ => {}
            }

            parsed = extract_object(&turn.assistant_text);
            if parsed.is_some() || attempt >= self.config.repair_attempts {
                break;
            }
            attempt += 1;
            debug!(role = %spec.name, attempt, "JSON extraction failed; requesting repair");
            prompt = self.assembler.assemble(&PromptInputs {
                spec: &spec,
                goal: &self.config.goal,
                cycle_index,
                incoming: None,
                is_repair: true,
            });
        }

        let timed_out = matches!(
            turn.completion_reason,
            CompletionReason::IdleTimeout | CompletionReason::OverallTimeout
        );

        let forwarded: Value;
        let mut status: TurnStatus;
        let mut apply_outcome: Option<ApplyOutcome> = None;
        let mut test_report: Option<TestReport> = None;

        match &parsed {
            Some(object) => {
                // Proposals come from the pre-reduction payload; reduction
                // strips them afterwards because the files are on disk.
                if spec.behaviors.apply_files {
                    if let Some(files) = payload::files(object) {
                        let outcome = apply_proposals(
                            &self.config.workspace_root,
                            files,
                            &self.config.allowed_file_extensions,
                        );
                        if self.config.run_tests && !outcome.applied.is_empty() {
                            test_report = Some(self.run_configured_tests());
                        }
                        apply_outcome = Some(outcome);
                    }
                }

                forwarded = reduce_payload(&paths, object)?;
                // The stored payload updates once extraction succeeded; a
                // rejected file batch below does not retract it.
                self.state
                    .latest_json_by_role
                    .insert(spec.name.clone(), forwarded.clone());

                status = if timed_out {
                    TurnStatus::TimedOut
                } else {
                    TurnStatus::Ok
                };
                if apply_outcome
                    .as_ref()
                    .map(ApplyOutcome::all_rejected)
                    .unwrap_or(false)
                {
                    status = TurnStatus::JsonFailed;
                }
            }
            None => {
                forwarded = json!({
                    "error": JSON_PARSE_FAILED,
                    "raw_excerpt": excerpt(&turn.assistant_text),
                });
                status = if timed_out {
                    TurnStatus::TimedOut
                } else {
                    TurnStatus::JsonFailed
                };
            }
        }

        self.record_turn(
            &paths,
            cycle_index,
            &spec,
            &first_prompt,
            prompt_len,
            started_at,
            &turn,
            Some(&forwarded),
            apply_outcome.as_ref(),
            test_report.as_ref(),
            status,
        )?;

        let finished = payload::signals_done(&forwarded) && spec.behaviors.can_finish;
        Ok(RoleTurnOutcome::Forwarded {
            payload: forwarded,
            finished,
        })
    }

    #[allow(clippy::too_many_arguments)]
    fn record_turn(
        &mut self,
        paths: &TurnPaths,
        cycle_index: u32,
        spec: &RoleSpec,
        prompt: &str,
        prompt_len: usize,
        started_at: String,
        turn: &TurnResult,
        handoff: Option<&Value>,
        apply_outcome: Option<&ApplyOutcome>,
        test_report: Option<&TestReport>,
        status: TurnStatus,
    ) -> Result<()> {
        let applied = apply_outcome
            .filter(|outcome| !outcome.applied.is_empty())
            .map(|outcome| outcome.applied.as_slice());
        let rejected = apply_outcome
            .filter(|outcome| !outcome.rejected.is_empty())
            .map(|outcome| outcome.rejected.as_slice());

        write_turn(
            paths,
            &TurnArtifacts {
                prompt,
                assistant_text: &turn.assistant_text,
                delta_text: &turn.delta_text,
                item_texts: &turn.item_texts,
                handoff,
                applied,
                rejected,
                test_report,
            },
        )?;

        self.state.history.push(TurnRecord {
            cycle_index,
            role_name: spec.name.clone(),
            prompt_len,
            started_at,
            finished_at: now_rfc3339(),
            status,
            artifact_dir: paths.dir.clone(),
            applied_files_count: apply_outcome.map(|o| o.applied.len()).unwrap_or(0),
            test_status: test_report.map(|report| report.status),
        });
        write_controller_state(&self.run_dir, &self.state)
    }

    fn run_configured_tests(&self) -> TestReport {
        let request = TestRequest {
            workdir: self.config.workspace_root.clone(),
            command: self.config.test_command.clone(),
            capture_cap_bytes: self.config.capture_cap_bytes,
        };
        match self.tester.run(&request) {
            Ok(report) => {
                info!(status = ?report.status, exit_code = ?report.exit_code, "test command finished");
                report
            }
            Err(err) => {
                warn!(err = %format!("{err:#}"), "test command could not run");
                TestReport {
                    status: TestStatus::Error,
                    exit_code: None,
                    stdout: String::new(),
                    stderr: format!("{err:#}"),
                    stdout_truncated: 0,
                    stderr_truncated: 0,
                }
            }
        }
    }

    fn stop_all(&mut self) {
        for binding in &mut self.bindings {
            binding.stop();
        }
    }
}

/// Strip known oversize fields before forwarding: `analysis_md` moves to a
/// sidecar file and becomes `analysis_md_path`; `files` are removed (they
/// are already on disk or rejected). Everything else passes verbatim.
fn reduce_payload(paths: &TurnPaths, payload: &Value) -> Result<Value> {
    let mut reduced = payload.clone();
    let Some(object) = reduced.as_object_mut() else {
        return Ok(reduced);
    };

    if let Some(analysis) = object.remove(payload::ANALYSIS_KEY) {
        match analysis {
            Value::String(text) if !text.trim().is_empty() => {
                let mut contents = text.trim().to_string();
                contents.push('\n');
                write_text_atomic(&paths.analysis_path, &contents)?;
                object.insert(
                    payload::ANALYSIS_PATH_KEY.to_string(),
                    json!(paths.analysis_path.to_string_lossy()),
                );
            }
            _ => warn!("dropping empty or non-text analysis_md from handoff"),
        }
    }
    object.remove(payload::FILES_KEY);
    Ok(reduced)
}

/// First 2 KiB of the text, cut on a char boundary.
fn excerpt(text: &str) -> String {
    let mut cut = RAW_EXCERPT_CAP_BYTES.min(text.len());
    while cut > 0 && !text.is_char_boundary(cut) {
        cut -= 1;
    }
    text[..cut].to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reduce_moves_analysis_to_sidecar_and_strips_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TurnPaths::new(temp.path(), 1, "implementer");
        fs::create_dir_all(&paths.dir).expect("mkdir");

        let payload = json!({
            "summary": "done",
            "analysis_md": "# deep dive\n\ndetails",
            "files": [{"path": "a.txt", "content": "hi"}],
            "status": "CONTINUE",
        });
        let reduced = reduce_payload(&paths, &payload).expect("reduce");

        assert!(reduced.get("analysis_md").is_none());
        assert!(reduced.get("files").is_none());
        assert_eq!(reduced["summary"], "done");
        assert_eq!(reduced["status"], "CONTINUE");

        let sidecar_path = reduced["analysis_md_path"].as_str().expect("path");
        let sidecar = fs::read_to_string(sidecar_path).expect("sidecar");
        assert_eq!(sidecar, "# deep dive\n\ndetails\n");
    }

    #[test]
    fn reduce_drops_empty_or_mistyped_analysis_without_sidecar() {
        let temp = tempfile::tempdir().expect("tempdir");
        let paths = TurnPaths::new(temp.path(), 1, "architect");
        fs::create_dir_all(&paths.dir).expect("mkdir");

        let reduced =
            reduce_payload(&paths, &json!({"analysis_md": "  ", "summary": "s"})).expect("reduce");
        assert!(reduced.get("analysis_md").is_none());
        assert!(reduced.get("analysis_md_path").is_none());
        assert!(!paths.analysis_path.exists());

        let reduced =
            reduce_payload(&paths, &json!({"analysis_md": 42, "summary": "s"})).expect("reduce");
        assert!(reduced.get("analysis_md_path").is_none());
    }

    #[test]
    fn excerpt_is_capped_on_char_boundaries() {
        assert_eq!(excerpt("oops"), "oops");

        let long = "ä".repeat(2000); // 2 bytes each, crosses the 2 KiB cap
        let cut = excerpt(&long);
        assert!(cut.len() <= RAW_EXCERPT_CAP_BYTES);
        assert!(cut.chars().all(|c| c == 'ä'));
    }
}
