// src/core/roles/primary.rs

//! The primary's monitoring loop: no upstream to watch, so the only
//! ongoing work is the per-tick child-connection diff (§4.6) and a sanity
//! check that this node still believes itself primary.

use crate::core::child_tracker::{Attachment, ChildEntry, ChildEvent, ChildTracker};
use crate::core::commands::{self, Placeholders};
use crate::core::context::LoopContext;
use crate::core::error::Result;
use crate::core::metadata::{EventKind, MetadataGateway, NodeRole};
use crate::core::roles::{RoleConfig, RoleOutcome};
use async_trait::async_trait;
use chrono::Utc;
use tokio::time::sleep;
use tracing::{info, warn};

/// What a single tick discovered, beyond the child-tracker events it
/// already emitted: whether the local node still believes itself primary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum TickResult {
    Continue,
    NoLongerPrimary,
}

/// What the primary loop needs from a live connection that the gateway
/// itself doesn't model: the set of currently-connected replica PIDs, and a
/// sanity check that promotion hasn't happened out from under this process.
#[async_trait]
pub trait PrimaryCollaborators: Send + Sync {
    /// Node ids found in `pg_stat_replication` (or the teacher-style
    /// equivalent) this tick.
    async fn connected_child_node_ids(&self) -> Result<Vec<i32>>;

    /// False if this node's own connection no longer reports
    /// `pg_is_in_recovery() = false` — someone promoted elsewhere, or this
    /// process has fallen behind reality.
    async fn still_primary(&self) -> bool;
}

pub async fn run<G, C>(gateway: &G, collaborators: &C, ctx: &LoopContext, config: &RoleConfig) -> Result<RoleOutcome>
where
    G: MetadataGateway + ?Sized,
    C: PrimaryCollaborators + ?Sized,
{
    let _ = gateway
        .append_event(Some(ctx.node_id), EventKind::RepmgrdStart, true, "monitoring started as primary")
        .await;

    loop {
        if super::shutting_down(ctx) {
            let _ = gateway
                .append_event(Some(ctx.node_id), EventKind::RepmgrdShutdown, true, "monitoring stopped")
                .await;
            return Ok(RoleOutcome::ShuttingDown);
        }
        if ctx.flags.take_reload_requested() {
            info!("reload requested; configuration will be re-read on the next tick by the caller");
        }
        if super::is_active(ctx) {
            match tick(gateway, collaborators, ctx, config).await {
                Ok(TickResult::Continue) => {}
                Ok(TickResult::NoLongerPrimary) => {
                    info!("local node is now in recovery; handing off to the standby loop");
                    return Ok(RoleOutcome::RoleChanged);
                }
                Err(e) => warn!("primary monitoring tick failed: {}", e),
            }
        }
        sleep(config.monitor_interval).await;
    }
}

async fn tick<G, C>(gateway: &G, collaborators: &C, ctx: &LoopContext, config: &RoleConfig) -> Result<TickResult>
where
    G: MetadataGateway + ?Sized,
    C: PrimaryCollaborators + ?Sized,
{
    if !collaborators.still_primary().await {
        warn!("local node no longer reports itself as primary; a promotion may have happened elsewhere");
        return Ok(TickResult::NoLongerPrimary);
    }

    let known = gateway.list_child_nodes(ctx.node_id).await?;
    let known_pairs: Vec<(i32, NodeRole)> = known.iter().map(|n| (n.node_id, n.role)).collect();
    let live = collaborators.connected_child_node_ids().await?;

    let events = {
        let mut tracker = ctx.child_tracker.lock();
        if tracker.is_empty() && !known.is_empty() {
            *tracker = ChildTracker::seed(
                known
                    .iter()
                    .map(|n| ChildEntry {
                        node_id: n.node_id,
                        role: n.role,
                        attached: if live.contains(&n.node_id) { Attachment::Attached } else { Attachment::Unknown },
                        detached_at: None,
                    })
                    .collect(),
            );
            Vec::new()
        } else {
            tracker.reconcile(&live, &known_pairs, Utc::now())
        }
    };

    for (node_id, event) in &events {
        let (kind, detail) = match event {
            ChildEvent::NewConnect => (EventKind::ChildNodeNewConnect, "child node connected for the first time"),
            ChildEvent::Reconnect => (EventKind::ChildNodeReconnect, "child node reconnected"),
            ChildEvent::Disconnect => (EventKind::ChildNodeDisconnect, "child node disconnected"),
        };
        let _ = gateway.append_event(Some(*node_id), kind, true, detail).await;
    }

    let connected = ctx.child_tracker.lock().connected_count(config.child_nodes_connected_include_witness);
    if let Some(min) = config.child_nodes_connected_min_count {
        if connected < min {
            warn!("connected child node count {} is below the configured minimum {}", connected, min);
        }
    }

    if let Some(disconnect_min) = config.child_nodes_disconnect_min_count {
        maybe_run_disconnect_command(gateway, ctx, config, disconnect_min).await;
    }

    Ok(TickResult::Continue)
}

/// Computes the S6 threshold (`total_known - disconnect_min_count + 1`) and
/// fires `child_nodes_disconnect_command` at most once per below-threshold
/// episode, once every currently detached child has stayed detached for
/// `child_nodes_disconnect_timeout`. The fired flag resets as soon as the
/// connected count recovers to the threshold, so a later dip fires again.
async fn maybe_run_disconnect_command<G: MetadataGateway + ?Sized>(
    gateway: &G,
    ctx: &LoopContext,
    config: &RoleConfig,
    disconnect_min_count: usize,
) {
    let mut tracker = ctx.child_tracker.lock();
    let threshold = tracker.disconnect_threshold(disconnect_min_count);
    let connected = tracker.connected_count(config.child_nodes_connected_include_witness);

    if connected >= threshold {
        tracker.set_disconnect_command_fired(false);
        return;
    }

    if tracker.disconnect_command_fired() {
        return;
    }

    let grace = chrono::Duration::from_std(config.child_nodes_disconnect_timeout).unwrap_or(chrono::Duration::zero());
    if !tracker.all_detached_past(grace, Utc::now()) {
        return;
    }

    tracker.set_disconnect_command_fired(true);
    drop(tracker);

    if let Some(template) = &config.child_nodes_disconnect_command {
        let placeholders = Placeholders { primary_node_id: Some(ctx.node_id), ..Default::default() };
        if let Err(e) = commands::run(template, &placeholders).await {
            warn!("child_nodes_disconnect_command failed: {}", e);
        }
        let _ = gateway
            .append_event(
                Some(ctx.node_id),
                EventKind::ChildNodesDisconnectCommand,
                true,
                &format!("connected count {connected} below threshold {threshold}"),
            )
            .await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::{NewPrimaryNotification, NodeRecord, NodeStatus, VotingRow};
    use std::sync::atomic::{AtomicBool, Ordering};
    use std::sync::Mutex;

    struct FakeGateway {
        children: Vec<NodeRecord>,
        events: Mutex<Vec<EventKind>>,
    }

    #[async_trait]
    impl MetadataGateway for FakeGateway {
        async fn get_node(&self, _: i32) -> Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn get_primary(&self) -> Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn list_active_siblings(&self, _: i32, _: i32) -> Result<Vec<NodeRecord>> {
            unimplemented!()
        }
        async fn list_child_nodes(&self, _: i32) -> Result<Vec<NodeRecord>> {
            Ok(self.children.clone())
        }
        async fn replace_nodes(&self, _: Vec<NodeRecord>) -> Result<()> {
            unimplemented!()
        }
        async fn set_active(&self, _: i32, _: bool) -> Result<()> {
            unimplemented!()
        }
        async fn set_upstream(&self, _: i32, _: Option<i32>) -> Result<()> {
            unimplemented!()
        }
        async fn mark_primary(&self, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn read_term(&self, _: i32) -> Result<VotingRow> {
            unimplemented!()
        }
        async fn increment_term(&self, _: i32) -> Result<i64> {
            unimplemented!()
        }
        async fn mark_vote_initiated(&self, _: i32, _: i64) -> Result<bool> {
            unimplemented!()
        }
        async fn reset_voting(&self, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn publish_new_primary_notification(&self, _: i32, _: Option<NewPrimaryNotification>) -> Result<()> {
            unimplemented!()
        }
        async fn read_new_primary_notification(&self, _: i32) -> Result<Option<NewPrimaryNotification>> {
            unimplemented!()
        }
        async fn read_node_status(&self, _: i32) -> Result<Option<NodeStatus>> {
            unimplemented!()
        }
        async fn record_pid(&self, _: i32, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn record_upstream_last_seen(&self, _: i32, _: Option<i32>, _: f64) -> Result<()> {
            unimplemented!()
        }
        async fn append_event(&self, _: Option<i32>, kind: EventKind, _: bool, _: &str) -> Result<()> {
            self.events.lock().unwrap().push(kind);
            Ok(())
        }
    }

    struct FakeCollaborators {
        live: Vec<i32>,
        primary: AtomicBool,
    }

    #[async_trait]
    impl PrimaryCollaborators for FakeCollaborators {
        async fn connected_child_node_ids(&self) -> Result<Vec<i32>> {
            Ok(self.live.clone())
        }
        async fn still_primary(&self) -> bool {
            self.primary.load(Ordering::SeqCst)
        }
    }

    fn child(id: i32) -> NodeRecord {
        NodeRecord {
            node_id: id,
            name: format!("node{id}"),
            role: NodeRole::Standby,
            upstream_node_id: Some(1),
            conninfo: format!("host=n{id}"),
            repl_conninfo: format!("host=n{id} replication=database"),
            priority: 100,
            location: "A".to_string(),
            active: true,
        }
    }

    fn config() -> RoleConfig {
        RoleConfig {
            monitor_interval: std::time::Duration::from_millis(10),
            reconnect_attempts: 1,
            reconnect_interval: std::time::Duration::from_millis(10),
            primary_notification_timeout: std::time::Duration::from_secs(1),
            election_rerun_interval: std::time::Duration::from_secs(1),
            degraded_monitoring_timeout: std::time::Duration::from_secs(1),
            promote_command: String::new(),
            follow_command: String::new(),
            failover_validation_command: None,
            child_nodes_disconnect_command: None,
            always_promote: false,
            manual_failover: false,
            primary_visibility_consensus: false,
            standby_disconnect_on_failover: false,
            sibling_nodes_disconnect_timeout: std::time::Duration::from_secs(1),
            repmgrd_standby_startup_timeout: std::time::Duration::from_secs(1),
            child_nodes_check_interval: std::time::Duration::from_secs(1),
            child_nodes_connected_min_count: None,
            child_nodes_disconnect_min_count: None,
            child_nodes_disconnect_timeout: std::time::Duration::from_secs(10),
            child_nodes_connected_include_witness: true,
            witness_sync_interval: std::time::Duration::from_secs(1),
        }
    }

    #[tokio::test]
    async fn tick_skips_entirely_when_no_longer_primary() {
        let gateway = FakeGateway { children: vec![child(2)], events: Mutex::new(Vec::new()) };
        let collaborators = FakeCollaborators { live: vec![2], primary: AtomicBool::new(false) };
        let ctx = LoopContext::new(1);
        let result = tick(&gateway, &collaborators, &ctx, &config()).await.unwrap();
        assert_eq!(result, TickResult::NoLongerPrimary);
        assert!(gateway.events.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn tick_emits_new_connect_events_on_first_sighting() {
        let gateway = FakeGateway { children: vec![child(2), child(3)], events: Mutex::new(Vec::new()) };
        let collaborators = FakeCollaborators { live: vec![2, 3], primary: AtomicBool::new(true) };
        let ctx = LoopContext::new(1);
        tick(&gateway, &collaborators, &ctx, &config()).await.unwrap();
        assert_eq!(ctx.child_tracker.lock().connected_count(true), 2);
    }

    #[tokio::test]
    async fn disconnect_command_fires_once_past_timeout_and_resets_on_recovery() {
        let gateway = FakeGateway { children: vec![child(2), child(3), child(4)], events: Mutex::new(Vec::new()) };
        let ctx = LoopContext::new(1);
        let mut cfg = config();
        cfg.child_nodes_disconnect_min_count = Some(1);
        cfg.child_nodes_disconnect_timeout = std::time::Duration::from_secs(0);

        let collaborators = FakeCollaborators { live: vec![2, 3, 4], primary: AtomicBool::new(true) };
        tick(&gateway, &collaborators, &ctx, &cfg).await.unwrap();

        let collaborators = FakeCollaborators { live: vec![3, 4], primary: AtomicBool::new(true) };
        tick(&gateway, &collaborators, &ctx, &cfg).await.unwrap();
        assert_eq!(gateway.events.lock().unwrap().iter().filter(|k| **k == EventKind::ChildNodesDisconnectCommand).count(), 1);
        assert!(ctx.child_tracker.lock().disconnect_command_fired());

        tick(&gateway, &collaborators, &ctx, &cfg).await.unwrap();
        assert_eq!(gateway.events.lock().unwrap().iter().filter(|k| **k == EventKind::ChildNodesDisconnectCommand).count(), 1);

        let collaborators = FakeCollaborators { live: vec![2, 3, 4], primary: AtomicBool::new(true) };
        tick(&gateway, &collaborators, &ctx, &cfg).await.unwrap();
        assert!(!ctx.child_tracker.lock().disconnect_command_fired());

        let collaborators = FakeCollaborators { live: vec![3, 4], primary: AtomicBool::new(true) };
        tick(&gateway, &collaborators, &ctx, &cfg).await.unwrap();
        assert_eq!(gateway.events.lock().unwrap().iter().filter(|k| **k == EventKind::ChildNodesDisconnectCommand).count(), 2);
    }
}
