//! Multi-role orchestrator for an interactive assistant app-server.
//!
//! A run executes one goal across a fixed sequence of roles (by default
//! planner, architect, implementer, integrator). Each role is a long-lived
//! app-server subprocess spoken to over newline-delimited JSON. Per turn the
//! scheduler builds a prompt, streams the role's events, extracts a JSON
//! payload from the assistant text (repairing when necessary), optionally
//! materialises proposed files under the workspace root, and forwards the
//! reduced payload to the next role until a role signals DONE or the cycle
//! budget runs out.

pub mod catalog;
pub mod core;
pub mod exit_codes;
pub mod io;
pub mod logging;
pub mod scheduler;
pub mod test_support;
