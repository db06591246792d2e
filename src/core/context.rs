// src/core/context.rs

//! Bundles the mutable state a role loop carries between ticks — pid,
//! failover state, monitoring state, cached upstream info — into one
//! object threaded through C1–C5, the way the teacher's `MasterMonitor`
//! bundles `Arc<Mutex<MasterState>>` with a small set of fields instead of
//! file-scope globals.

use crate::core::child_tracker::ChildTracker;
use crate::core::metadata::NodeRecord;
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MonitoringState {
    Normal,
    Degraded,
}

/// The mutable fields a single role loop iteration reads and writes: the
/// cached upstream/local/primary node records and the current degraded
/// monitoring window, all scoped to one loop's lifetime.
#[derive(Debug)]
pub struct LoopState {
    pub upstream_node_info: Option<NodeRecord>,
    pub local_node_info: Option<NodeRecord>,
    pub primary_node_id: Option<i32>,
    pub monitoring_state: MonitoringState,
    pub degraded_since: Option<DateTime<Utc>>,
}

impl Default for LoopState {
    fn default() -> Self {
        Self {
            upstream_node_info: None,
            local_node_info: None,
            primary_node_id: None,
            monitoring_state: MonitoringState::Normal,
            degraded_since: None,
        }
    }
}

impl LoopState {
    pub fn enter_degraded(&mut self, now: DateTime<Utc>) {
        if self.monitoring_state == MonitoringState::Normal {
            self.monitoring_state = MonitoringState::Degraded;
            self.degraded_since = Some(now);
        }
    }

    pub fn leave_degraded(&mut self) {
        self.monitoring_state = MonitoringState::Normal;
        self.degraded_since = None;
    }

    pub fn degraded_elapsed(&self, now: DateTime<Utc>) -> Option<chrono::Duration> {
        self.degraded_since.map(|since| now - since)
    }
}

/// Process-wide state shared by the signal handlers and whichever role
/// loop is currently running: the pause gate and the shutdown flag.
#[derive(Debug, Default)]
pub struct GlobalFlags {
    paused: AtomicBool,
    reload_requested: AtomicBool,
    shutdown_requested: AtomicBool,
}

impl GlobalFlags {
    pub fn is_paused(&self) -> bool {
        self.paused.load(Ordering::Relaxed)
    }

    pub fn set_paused(&self, paused: bool) {
        self.paused.store(paused, Ordering::Relaxed);
    }

    pub fn request_reload(&self) {
        self.reload_requested.store(true, Ordering::Relaxed);
    }

    pub fn take_reload_requested(&self) -> bool {
        self.reload_requested.swap(false, Ordering::Relaxed)
    }

    pub fn request_shutdown(&self) {
        self.shutdown_requested.store(true, Ordering::Relaxed);
    }

    pub fn is_shutdown_requested(&self) -> bool {
        self.shutdown_requested.load(Ordering::Relaxed)
    }
}

/// Bundles one role loop's mutable state plus the shared global flags.
/// Cloning a `LoopContext` shares the same underlying state — it exists to
/// be handed to spawned sub-tasks (the per-tick child-tracker diff, for
/// instance) the way `MasterMonitor` is cloned per sub-task.
#[derive(Clone)]
pub struct LoopContext {
    pub node_id: i32,
    state: Arc<Mutex<LoopState>>,
    pub flags: Arc<GlobalFlags>,
    pub child_tracker: Arc<Mutex<ChildTracker>>,
}

impl LoopContext {
    pub fn new(node_id: i32) -> Self {
        Self {
            node_id,
            state: Arc::new(Mutex::new(LoopState::default())),
            flags: Arc::new(GlobalFlags::default()),
            child_tracker: Arc::new(Mutex::new(ChildTracker::new())),
        }
    }

    pub fn with_state<R>(&self, f: impl FnOnce(&mut LoopState) -> R) -> R {
        f(&mut self.state.lock())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degrades_and_recovers() {
        let mut state = LoopState::default();
        let t0 = Utc::now();
        state.enter_degraded(t0);
        assert_eq!(state.monitoring_state, MonitoringState::Degraded);
        // Entering degraded twice does not reset the clock.
        state.enter_degraded(t0 + chrono::Duration::seconds(5));
        assert_eq!(state.degraded_since, Some(t0));
        state.leave_degraded();
        assert_eq!(state.monitoring_state, MonitoringState::Normal);
        assert!(state.degraded_since.is_none());
    }

    #[test]
    fn pause_gate_reflects_last_write() {
        let flags = GlobalFlags::default();
        assert!(!flags.is_paused());
        flags.set_paused(true);
        assert!(flags.is_paused());
    }

    #[test]
    fn reload_flag_is_consumed_once() {
        let flags = GlobalFlags::default();
        flags.request_reload();
        assert!(flags.take_reload_requested());
        assert!(!flags.take_reload_requested());
    }
}
