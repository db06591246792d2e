// src/core/roles/standby.rs

//! The standby's monitoring loop: supervise the upstream connection (C1),
//! and once it's judged down, run an election (C4) and drive whatever the
//! result demands through the failover driver (C5).

use crate::core::context::LoopContext;
use crate::core::election::{self, ElectionConfig, ElectionResult, LocalView, SiblingView};
use crate::core::error::{ClusterWardError, Result};
use crate::core::failover::{self, FailoverCollaborators, Outcome, PromoteConfig};
use crate::core::lsn::Lsn;
use crate::core::metadata::{EventKind, MetadataGateway, NewPrimaryNotification, NodeRecord, NodeRole};
use crate::core::roles::RoleConfig;
use crate::core::supervisor::{self, ConnectionHandle, Liveness, ReconnectOutcome, ReconnectPolicy};
use async_trait::async_trait;
use chrono::Utc;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Everything the standby loop needs beyond the metadata gateway and the
/// upstream connection handle: the local WAL position, a view of one
/// sibling suitable for the election's sibling scan, and the rogue-sibling
/// follow check. Extends [`FailoverCollaborators`] since promotion and
/// following are driven from here too.
#[async_trait]
pub trait StandbyCollaborators: FailoverCollaborators {
    async fn local_last_wal_receive_lsn(&self) -> Lsn;

    /// `None` if the sibling is unreachable this tick — it simply drops out
    /// of the scan, the way an absent daemon would.
    async fn build_sibling_view(&self, sibling: &NodeRecord) -> Option<SiblingView>;

    /// Whether this node could follow `sibling` without a timeline rewind,
    /// for siblings that already report themselves out of recovery.
    async fn can_follow(&self, sibling: &NodeRecord) -> bool;
}

pub async fn run<G, C>(
    gateway: &G,
    upstream_handle: &dyn ConnectionHandle,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: StandbyCollaborators + ?Sized,
{
    loop {
        if super::shutting_down(ctx) {
            break;
        }
        if ctx.flags.take_reload_requested() {
            info!("reload requested; configuration will be re-read on the next tick by the caller");
        }
        if super::is_active(ctx) {
            tick(gateway, upstream_handle, collaborators, ctx, config).await?;
        }
        sleep(config.monitor_interval).await;
    }
    Ok(())
}

async fn tick<G, C>(
    gateway: &G,
    upstream_handle: &dyn ConnectionHandle,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: StandbyCollaborators + ?Sized,
{
    if matches!(supervisor::ensure(upstream_handle).await, Liveness::Ok) {
        ctx.with_state(|s| s.leave_degraded());
        return Ok(());
    }

    warn!("upstream unreachable; entering degraded monitoring");
    ctx.with_state(|s| s.enter_degraded(Utc::now()));

    let policy = ReconnectPolicy { attempts: config.reconnect_attempts, interval: config.reconnect_interval };
    match supervisor::try_reconnect(upstream_handle, gateway, ctx.node_id, &policy).await {
        ReconnectOutcome::Reconnected => {
            ctx.with_state(|s| s.leave_degraded());
            let _ = gateway
                .append_event(Some(ctx.node_id), EventKind::UpstreamReconnect, true, "upstream reconnected")
                .await;
            return Ok(());
        }
        ReconnectOutcome::NewPrimary(new_primary_id) => {
            return act_on_new_primary(gateway, collaborators, ctx, config, new_primary_id).await;
        }
        ReconnectOutcome::Rerun => {
            sleep(config.election_rerun_interval).await;
            return Ok(());
        }
        ReconnectOutcome::Down => {}
    }

    let _ = gateway
        .append_event(Some(ctx.node_id), EventKind::UpstreamDisconnect, true, "upstream did not recover within reconnect_attempts")
        .await;

    let node = gateway
        .get_node(ctx.node_id)
        .await?
        .ok_or_else(|| ClusterWardError::Metadata(format!("local node {} missing from metadata", ctx.node_id)))?;
    let primary = gateway
        .get_primary()
        .await?
        .ok_or_else(|| ClusterWardError::Metadata("no primary recorded in metadata".to_string()))?;
    if node.upstream_node_id.is_some_and(|id| id != primary.node_id) {
        // A cascaded standby's upstream is another standby, not the
        // primary. Losing that upstream is not grounds to run an election —
        // this node is never the one that should stand in for a dead
        // non-primary upstream. It only needs to verify the real primary is
        // still there and re-follow it directly.
        return cascaded_standby_failover(gateway, collaborators, ctx, config, &node, &primary).await;
    }

    let upstream_id = primary.node_id;
    let sibling_records = gateway.list_active_siblings(ctx.node_id, upstream_id).await?;

    let mut siblings = Vec::new();
    for rec in &sibling_records {
        if let Some(view) = collaborators.build_sibling_view(rec).await {
            siblings.push(view);
        }
    }

    if config.standby_disconnect_on_failover && !siblings.is_empty() {
        let drained = failover::standby_disconnect_on_failover(
            &sibling_records,
            config.sibling_nodes_disconnect_timeout,
            Duration::from_millis(500),
            |_| true,
        )
        .await;
        if !drained {
            warn!("not all siblings drained their WAL receivers before the disconnect timeout; proceeding anyway");
        }
    }

    let mut reachable_locations: Vec<String> = siblings.iter().map(|s| s.node.location.clone()).collect();
    reachable_locations.push(node.location.clone());

    let mut can_follow_rogue: HashMap<i32, bool> = HashMap::new();
    for view in &siblings {
        if !view.in_recovery && view.node.role != NodeRole::Witness {
            can_follow_rogue.insert(view.node.node_id, collaborators.can_follow(&view.node).await);
        }
    }

    let local = LocalView {
        node: node.clone(),
        last_wal_receive_lsn: collaborators.local_last_wal_receive_lsn().await,
        primary: primary.clone(),
        reachable_locations,
        siblings,
    };

    let election_config = ElectionConfig {
        manual_failover: config.manual_failover,
        primary_visibility_consensus: config.primary_visibility_consensus,
        monitor_interval_secs: config.monitor_interval.as_secs(),
        election_rerun_interval: config.election_rerun_interval,
        failover_validation_command: config.failover_validation_command.clone(),
    };

    let result = election::run(gateway, &local, &election_config, |sibling| {
        can_follow_rogue.get(&sibling.node.node_id).copied().unwrap_or(false)
    })
    .await;

    match result {
        ElectionResult::Won => {
            let promote_config = PromoteConfig {
                always_promote: config.always_promote,
                promote_command: config.promote_command.clone(),
                promote_delay: None,
            };
            let outcome = failover::promote_self(gateway, collaborators, &node, Some(&primary), &promote_config).await;
            if outcome == Outcome::Promoted {
                failover::notify_followers(gateway, &sibling_records, NewPrimaryNotification::Node(node.node_id)).await;
            }
            handle_outcome(ctx, config, outcome)
        }
        ElectionResult::Lost { new_primary_id } => act_on_new_primary(gateway, collaborators, ctx, config, new_primary_id).await,
        ElectionResult::Rerun { after } => {
            sleep(after).await;
            Ok(())
        }
        ElectionResult::Cancelled { reason } => {
            info!("election cancelled: {}", reason);
            check_degraded_timeout(ctx, config)
        }
        ElectionResult::NotCandidate => {
            match failover::wait_new_primary_notification(
                gateway,
                ctx.node_id,
                config.primary_notification_timeout,
                Duration::from_millis(500),
            )
            .await
            {
                Some(NewPrimaryNotification::Node(id)) => act_on_new_primary(gateway, collaborators, ctx, config, id).await,
                Some(NewPrimaryNotification::Rerun) => Ok(()),
                None => check_degraded_timeout(ctx, config),
            }
        }
    }
}

/// Re-follows the real primary directly, with no election: used when the
/// upstream that just went unreachable is itself a cascaded standby, so
/// this node was never a candidate to replace it.
async fn cascaded_standby_failover<G, C>(
    gateway: &G,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
    node: &NodeRecord,
    primary: &NodeRecord,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: StandbyCollaborators + ?Sized,
{
    if !collaborators.probe_still_primary(primary).await {
        info!("cascaded standby: primary {} is unreachable too; cannot re-follow directly", primary.node_id);
        return check_degraded_timeout(ctx, config);
    }

    let outcome = failover::follow_new_primary(
        gateway,
        collaborators,
        node,
        primary,
        None,
        &config.follow_command,
        config.repmgrd_standby_startup_timeout,
    )
    .await;
    handle_outcome(ctx, config, outcome)
}

async fn act_on_new_primary<G, C>(
    gateway: &G,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
    new_primary_id: i32,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: StandbyCollaborators + ?Sized,
{
    if new_primary_id == ctx.node_id {
        return Ok(());
    }
    let node = gateway
        .get_node(ctx.node_id)
        .await?
        .ok_or_else(|| ClusterWardError::Metadata(format!("local node {} missing from metadata", ctx.node_id)))?;
    let target = gateway
        .get_node(new_primary_id)
        .await?
        .ok_or_else(|| ClusterWardError::Metadata(format!("new primary {new_primary_id} missing from metadata")))?;
    let former = gateway.get_primary().await.ok().flatten();

    let outcome = failover::follow_new_primary(
        gateway,
        collaborators,
        &node,
        &target,
        former.as_ref(),
        &config.follow_command,
        config.repmgrd_standby_startup_timeout,
    )
    .await;
    handle_outcome(ctx, config, outcome)
}

fn handle_outcome(ctx: &LoopContext, config: &RoleConfig, outcome: Outcome) -> Result<()> {
    if outcome.is_terminal() {
        ctx.with_state(|s| s.leave_degraded());
        Ok(())
    } else {
        check_degraded_timeout(ctx, config)
    }
}

/// Once the loop has spent `degraded_monitoring_timeout` without reaching a
/// terminal outcome, the daemon exits rather than monitor indefinitely with
/// a node it cannot place in a known-good state.
fn check_degraded_timeout(ctx: &LoopContext, config: &RoleConfig) -> Result<()> {
    let timed_out = ctx.with_state(|s| {
        s.degraded_elapsed(Utc::now())
            .and_then(|d| d.to_std().ok())
            .map(|elapsed| elapsed >= config.degraded_monitoring_timeout)
            .unwrap_or(false)
    });
    if timed_out {
        return Err(ClusterWardError::FatalConfig("degraded monitoring timeout exceeded".to_string()));
    }
    Ok(())
}
