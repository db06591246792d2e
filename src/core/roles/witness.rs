// src/core/roles/witness.rs

//! The witness loop: a witness node holds no data and is never a
//! candidate. It maintains a connection to whichever node it currently
//! considers primary; on loss it attempts a bounded reconnect, and on
//! failure it drives the witness's reduced failover subset (wait for a
//! "new primary" notification, then follow). Independently of connection
//! state, it periodically resyncs its copy of the node table from the
//! primary.

use crate::core::context::LoopContext;
use crate::core::error::{ClusterWardError, Result};
use crate::core::failover::{self, FailoverCollaborators};
use crate::core::metadata::{EventKind, MetadataGateway, NewPrimaryNotification};
use crate::core::roles::RoleConfig;
use crate::core::supervisor::{self, ConnectionHandle, Liveness, ReconnectOutcome, ReconnectPolicy};
use async_trait::async_trait;
use chrono::Utc;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// A witness has no replication state of its own to probe, but it does
/// need to promote/follow machinery (inherited from [`FailoverCollaborators`])
/// for the "follow new primary" step, and a way to resync its node-table
/// copy from whichever node it currently considers primary.
#[async_trait]
pub trait WitnessCollaborators: FailoverCollaborators {
    /// Refreshes this witness's local record of the cluster's node table
    /// from `primary_id`. Returns `false` if `primary_id` could not be
    /// reached at all.
    async fn sync_from(&self, primary_id: i32) -> bool;
}

pub async fn run<G, C>(
    gateway: &G,
    primary_handle: &dyn ConnectionHandle,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: WitnessCollaborators + ?Sized,
{
    let mut since_last_sync = std::time::Instant::now();

    loop {
        if super::shutting_down(ctx) {
            break;
        }
        if ctx.flags.take_reload_requested() {
            info!("reload requested; configuration will be re-read on the next tick by the caller");
        }
        if super::is_active(ctx) {
            tick(gateway, primary_handle, collaborators, ctx, config).await?;

            if since_last_sync.elapsed() >= config.witness_sync_interval {
                if let Some(primary_id) = ctx.with_state(|s| s.primary_node_id) {
                    if !collaborators.sync_from(primary_id).await {
                        warn!("witness resync against primary {} failed; will retry next interval", primary_id);
                    }
                }
                since_last_sync = std::time::Instant::now();
            }
        }
        sleep(config.monitor_interval).await;
    }

    Ok(())
}

async fn tick<G, C>(
    gateway: &G,
    primary_handle: &dyn ConnectionHandle,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: WitnessCollaborators + ?Sized,
{
    if let Ok(Some(notification)) = gateway.read_new_primary_notification(ctx.node_id).await {
        handle_notification(gateway, ctx, notification).await;
    }

    if matches!(supervisor::ensure(primary_handle).await, Liveness::Ok) {
        ctx.with_state(|s| s.leave_degraded());
        return Ok(());
    }

    warn!("primary unreachable; entering degraded monitoring");
    ctx.with_state(|s| s.enter_degraded(Utc::now()));

    let policy = ReconnectPolicy { attempts: config.reconnect_attempts, interval: config.reconnect_interval };
    match supervisor::try_reconnect(primary_handle, gateway, ctx.node_id, &policy).await {
        ReconnectOutcome::Reconnected => {
            ctx.with_state(|s| s.leave_degraded());
            let _ = gateway
                .append_event(Some(ctx.node_id), EventKind::UpstreamReconnect, true, "primary reconnected")
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
        .append_event(
            Some(ctx.node_id),
            EventKind::UpstreamDisconnect,
            true,
            "primary did not recover within reconnect_attempts",
        )
        .await;

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

/// A witness never stands for election and never runs `follow_command` —
/// it only needs to know who to track next, and to refresh its node-table
/// copy from them. Mirrors `handle_notification`'s no-command path rather
/// than the standby/primary `follow_new_primary` machinery.
async fn act_on_new_primary<G, C>(
    gateway: &G,
    collaborators: &C,
    ctx: &LoopContext,
    config: &RoleConfig,
    new_primary_id: i32,
) -> Result<()>
where
    G: MetadataGateway + ?Sized,
    C: WitnessCollaborators + ?Sized,
{
    if new_primary_id == ctx.node_id {
        return Ok(());
    }

    ctx.with_state(|s| s.primary_node_id = Some(new_primary_id));

    if collaborators.sync_from(new_primary_id).await {
        let _ = gateway
            .append_event(
                Some(ctx.node_id),
                EventKind::StandbyReconnect,
                true,
                &format!("witness now tracks primary {new_primary_id}"),
            )
            .await;
        ctx.with_state(|s| s.leave_degraded());
        Ok(())
    } else {
        warn!("witness resync against new primary {} failed", new_primary_id);
        check_degraded_timeout(ctx, config)
    }
}

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

async fn handle_notification<G: MetadataGateway + ?Sized>(
    gateway: &G,
    ctx: &LoopContext,
    notification: NewPrimaryNotification,
) {
    match notification {
        NewPrimaryNotification::Node(new_primary_id) => {
            ctx.with_state(|s| s.primary_node_id = Some(new_primary_id));
            let _ = gateway
                .append_event(
                    Some(ctx.node_id),
                    EventKind::StandbyReconnect,
                    true,
                    &format!("witness now tracks primary {new_primary_id}"),
                )
                .await;
        }
        NewPrimaryNotification::Rerun => {
            info!("election rerun notification received; witness has nothing to act on");
        }
    }
}
