//! Stable exit codes for conductor CLI commands.

/// Run completed after a role signalled DONE.
pub const DONE: i32 = 0;
/// Run aborted, was cancelled, or exhausted its cycle budget without a DONE.
pub const ABORTED: i32 = 1;
/// Configuration was invalid; no transport was started.
pub const CONFIG: i32 = 2;
