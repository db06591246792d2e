// src/core/roles/mod.rs

//! The three per-role top-level loops (C1 wired up against C2–C5): the
//! primary's child-connection sanity check, the standby's upstream
//! supervision and election driving, and the witness's lightweight
//! notification wait. Each loop owns nothing but a tick interval and the
//! shared [`LoopContext`] — every externally-observable action goes through
//! a collaborator trait so the loop itself stays unit-testable.

pub mod primary;
pub mod standby;
pub mod witness;

use crate::core::context::LoopContext;
use std::time::Duration;

/// The subset of the configuration file every role loop needs, regardless
/// of which role it drives. Role-specific options live alongside each
/// loop's own collaborator trait instead of here.
pub struct RoleConfig {
    pub monitor_interval: Duration,
    pub reconnect_attempts: u32,
    pub reconnect_interval: Duration,
    pub primary_notification_timeout: Duration,
    pub election_rerun_interval: Duration,
    pub degraded_monitoring_timeout: Duration,
    pub promote_command: String,
    pub follow_command: String,
    pub failover_validation_command: Option<String>,
    pub child_nodes_disconnect_command: Option<String>,
    pub always_promote: bool,
    pub manual_failover: bool,
    pub primary_visibility_consensus: bool,
    pub standby_disconnect_on_failover: bool,
    pub sibling_nodes_disconnect_timeout: Duration,
    pub repmgrd_standby_startup_timeout: Duration,
    pub child_nodes_check_interval: Duration,
    pub child_nodes_connected_min_count: Option<usize>,
    pub child_nodes_disconnect_min_count: Option<usize>,
    pub child_nodes_disconnect_timeout: Duration,
    pub child_nodes_connected_include_witness: bool,
    pub witness_sync_interval: Duration,
}

/// Whether a role loop should do real work this tick, as opposed to idling
/// through a `pause` request while still responding to shutdown.
pub fn is_active(ctx: &LoopContext) -> bool {
    !ctx.flags.is_paused()
}

pub fn shutting_down(ctx: &LoopContext) -> bool {
    ctx.flags.is_shutdown_requested()
}

/// What a role loop exited to report to whatever orchestrates role
/// transitions above it. Only the primary loop currently produces
/// `RoleChanged`, for a former primary that comes back online as a standby
/// after an external switchover.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoleOutcome {
    ShuttingDown,
    RoleChanged,
}
