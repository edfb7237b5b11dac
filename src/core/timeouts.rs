//! Timeout selection for role turns.
//!
//! Two timeout triples come from configuration: one for planner-policy roles
//! and one for everything else. Resolution clamps the result into the
//! supported window so a bad config cannot hang a turn forever or spin it.

use std::time::Duration;

use crate::catalog::TimeoutPolicy;

pub const MIN_TIMEOUT_S: u64 = 1;
pub const MAX_TIMEOUT_S: u64 = 3600;
pub const DEFAULT_HANDSHAKE_S: u64 = 15;

/// Timeout inputs sourced from configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeoutSettings {
    pub handshake_s: u64,
    pub idle_default_s: u64,
    pub overall_default_s: u64,
    pub idle_planner_s: u64,
    pub overall_planner_s: u64,
}

/// Timeouts applied to a single role turn.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TurnTimeouts {
    /// Budget for the `initialize` → `thread/started` handshake.
    pub handshake: Duration,
    /// Reset only by item deltas and completed items.
    pub idle: Duration,
    /// Fixed wall-clock bound for the whole turn.
    pub overall: Duration,
}

/// Pick the applicable timeouts for a role. Invariant after clamping:
/// `1s <= idle <= overall <= 3600s`.
pub fn resolve(policy: TimeoutPolicy, settings: &TimeoutSettings) -> TurnTimeouts {
    let (idle_s, overall_s) = match policy {
        TimeoutPolicy::Planner => (settings.idle_planner_s, settings.overall_planner_s),
        TimeoutPolicy::Default => (settings.idle_default_s, settings.overall_default_s),
    };

    let idle_s = idle_s.clamp(MIN_TIMEOUT_S, MAX_TIMEOUT_S);
    let overall_s = overall_s.clamp(idle_s, MAX_TIMEOUT_S);
    let handshake_s = if settings.handshake_s == 0 {
        DEFAULT_HANDSHAKE_S
    } else {
        settings.handshake_s
    };

    TurnTimeouts {
        handshake: Duration::from_secs(handshake_s),
        idle: Duration::from_secs(idle_s),
        overall: Duration::from_secs(overall_s),
    }
}
