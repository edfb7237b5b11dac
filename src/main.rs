//! Multi-role orchestrator CLI for an assistant app-server.
//!
//! `conductor run` drives a goal through the configured role pipeline and
//! exits 0 when a finishing role answered DONE, 1 when the run aborted or
//! the cycle budget ran out, and 2 on configuration errors.

use std::path::{Path, PathBuf};

use anyhow::Result;
use clap::{Parser, Subcommand};

use conductor::exit_codes;
use conductor::io::config::{load_config, OrchestratorConfig};
use conductor::io::turn::CancelToken;
use conductor::logging;
use conductor::scheduler::Scheduler;

#[derive(Parser)]
#[command(
    name = "conductor",
    version,
    about = "Multi-role orchestrator for an assistant app-server"
)]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run a goal through the configured role pipeline.
    Run {
        /// Path to a TOML configuration file.
        #[arg(long, default_value = "conductor.toml")]
        config: PathBuf,
        /// Goal to execute (overrides the configured goal).
        #[arg(long)]
        goal: Option<String>,
        /// Cycle budget (overrides the configured value).
        #[arg(long)]
        cycles: Option<u32>,
        /// Model for every role; per-role env overrides still win.
        #[arg(long)]
        model: Option<String>,
    },
}

fn main() {
    logging::init();
    match run() {
        Ok(code) => std::process::exit(code),
        Err(err) => {
            eprintln!("{err:#}");
            std::process::exit(exit_codes::ABORTED);
        }
    }
}

fn run() -> Result<i32> {
    let cli = Cli::parse();
    match cli.command {
        Command::Run {
            config,
            goal,
            cycles,
            model,
        } => cmd_run(&config, goal, cycles, model),
    }
}

fn cmd_run(
    config_path: &Path,
    goal: Option<String>,
    cycles: Option<u32>,
    model: Option<String>,
) -> Result<i32> {
    let mut config = match load_config(config_path) {
        Ok(config) => config,
        Err(err) => {
            eprintln!("configuration error: {err:#}");
            return Ok(exit_codes::CONFIG);
        }
    };
    apply_overrides(&mut config, goal, cycles, model);
    if let Err(err) = config.validate() {
        eprintln!("configuration error: {err:#}");
        return Ok(exit_codes::CONFIG);
    }

    let cancel = CancelToken::new();
    let scheduler = Scheduler::start(config, cancel)?;
    println!("run {} started", scheduler.run_id());

    let outcome = scheduler.run()?;
    if outcome.reached_done {
        println!(
            "run {} reached DONE after {} cycle(s); artifacts in {}",
            outcome.run_id,
            outcome.cycles_completed,
            outcome.run_dir.display()
        );
        Ok(exit_codes::DONE)
    } else {
        println!(
            "run {} ended without DONE after {} cycle(s); artifacts in {}",
            outcome.run_id,
            outcome.cycles_completed,
            outcome.run_dir.display()
        );
        Ok(exit_codes::ABORTED)
    }
}

fn apply_overrides(
    config: &mut OrchestratorConfig,
    goal: Option<String>,
    cycles: Option<u32>,
    model: Option<String>,
) {
    if let Some(goal) = goal {
        config.goal = goal;
    }
    if let Some(cycles) = cycles {
        config.cycles = cycles;
    }
    if let Some(model) = model {
        for role in &mut config.roles {
            role.model = model.clone();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_run_with_flags() {
        let cli = Cli::parse_from([
            "conductor",
            "run",
            "--goal",
            "ship it",
            "--cycles",
            "3",
            "--model",
            "model-x",
        ]);
        match cli.command {
            Command::Run {
                config,
                goal,
                cycles,
                model,
            } => {
                assert_eq!(config, PathBuf::from("conductor.toml"));
                assert_eq!(goal.as_deref(), Some("ship it"));
                assert_eq!(cycles, Some(3));
                assert_eq!(model.as_deref(), Some("model-x"));
            }
        }
    }

    #[test]
    fn overrides_replace_goal_cycles_and_models() {
        let mut config = OrchestratorConfig::default();
        apply_overrides(
            &mut config,
            Some("new goal".to_string()),
            Some(5),
            Some("model-y".to_string()),
        );
        assert_eq!(config.goal, "new goal");
        assert_eq!(config.cycles, 5);
        assert!(config.roles.iter().all(|role| role.model == "model-y"));
    }
}
