// src/core/failover.rs

//! The failover driver (C5): the state machine that turns an election
//! result into a promotion or a follow, and keeps the rest of the cluster
//! informed of the outcome.

use crate::core::commands::{self, Placeholders};
use crate::core::election::ElectionResult;
use crate::core::metadata::{EventKind, MetadataGateway, NewPrimaryNotification, NodeRecord};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// The terminal (or degraded) result of a single pass through the driver.
/// The success variants correspond to a clean handoff; the failure variants
/// to one that needs operator attention; everything else drops the caller
/// into degraded monitoring.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Outcome {
    Promoted,
    PromotionFailed,
    PrimaryReappeared,
    LocalNodeFailure,
    FollowingOriginalPrimary,
    FollowedNewPrimary,
    FollowFail,
    NoNewPrimary,
    RequiresManualFailover,
    ElectionRerun,
    Cancelled,
    NotCandidate,
}

impl Outcome {
    /// Whether this outcome ends the failover attempt cleanly (the `NONE`
    /// states of the diagram) as opposed to dropping into degraded mode.
    pub fn is_terminal(self) -> bool {
        matches!(
            self,
            Outcome::Promoted
                | Outcome::FollowingOriginalPrimary
                | Outcome::FollowedNewPrimary
                | Outcome::Cancelled
                | Outcome::NotCandidate
        )
    }
}

/// External collaborators the driver needs but does not own: the
/// replication probe against the local and former-primary connections, and
/// the supervisor's reconnect-wait primitive. Kept as a trait so the state
/// machine is unit-testable without a live cluster.
#[async_trait]
pub trait FailoverCollaborators: Send + Sync {
    /// True if this node's own connection now reports itself as primary.
    async fn verify_local_is_primary(&self) -> bool;

    /// True if `candidate` is reachable and itself still reports being
    /// primary (the "primary reappeared" check).
    async fn probe_still_primary(&self, candidate: &NodeRecord) -> bool;

    /// True if this node could follow `target` without a timeline rewind.
    async fn check_can_follow(&self, target: &NodeRecord) -> bool;

    /// Polls the local connection for up to `timeout`; true if it came
    /// back within that bound.
    async fn wait_for_local_reconnect(&self, timeout: Duration) -> bool;
}

pub struct PromoteConfig {
    pub always_promote: bool,
    pub promote_command: String,
    pub promote_delay: Option<Duration>,
}

/// `promote_self`: runs `promote_command`, verifies the result, and on
/// success bumps the electoral term and emits the promotion event.
pub async fn promote_self<G: MetadataGateway + ?Sized, C: FailoverCollaborators + ?Sized>(
    gateway: &G,
    collaborators: &C,
    node: &NodeRecord,
    former_primary: Option<&NodeRecord>,
    config: &PromoteConfig,
) -> Outcome {
    if node.upstream_node_id.is_none() && !config.always_promote {
        warn!(
            "node {} has no recorded upstream and always_promote is false; refusing to promote",
            node.node_id
        );
        return Outcome::PromotionFailed;
    }

    if let Some(delay) = config.promote_delay {
        sleep(delay).await;
    }

    let placeholders = Placeholders {
        node_id: Some(node.node_id),
        conninfo: Some(node.conninfo.clone()),
        ..Default::default()
    };

    let command_result = commands::run(&config.promote_command, &placeholders).await;

    if command_result.is_ok() && collaborators.verify_local_is_primary().await {
        match gateway.increment_term(node.node_id).await {
            Ok(_) => {}
            Err(e) => warn!("failed to increment electoral term after promotion: {}", e),
        }
        if let Err(e) = gateway.mark_primary(node.node_id).await {
            warn!("failed to mark node {} primary in metadata: {}", node.node_id, e);
        }
        let _ = gateway
            .append_event(Some(node.node_id), EventKind::FailoverPromote, true, "promoted to primary")
            .await;
        info!("node {} promoted to primary", node.node_id);
        return Outcome::Promoted;
    }

    if let Some(former) = former_primary
        && collaborators.probe_still_primary(former).await
    {
        info!(
            "promotion failed but former primary {} has reappeared; aborting gracefully",
            former.node_id
        );
        let _ = gateway
            .append_event(Some(node.node_id), EventKind::FailoverAbort, true, "former primary reappeared")
            .await;
        return Outcome::PrimaryReappeared;
    }

    let _ = gateway
        .append_event(Some(node.node_id), EventKind::PromoteError, false, "promote_command failed")
        .await;
    Outcome::PromotionFailed
}

/// `standby_disconnect_on_failover`: disables the local WAL receiver via
/// `disable_wal_receiver`, then waits for every sibling's daemon PID-backed
/// receiver to reach zero, freezing all standbys at a common LSN before the
/// election's LSN comparison runs.
pub async fn standby_disconnect_on_failover<F>(
    siblings: &[NodeRecord],
    timeout: Duration,
    poll_interval: Duration,
    mut sibling_receiver_is_zero: F,
) -> bool
where
    F: FnMut(&NodeRecord) -> bool,
{
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if siblings.iter().all(|s| sibling_receiver_is_zero(s)) {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        sleep(poll_interval).await;
    }
}

/// `follow_new_primary(id)`: closes the local connection, runs
/// `follow_command`, and on success refreshes local metadata to point at
/// the new upstream.
pub async fn follow_new_primary<G: MetadataGateway + ?Sized, C: FailoverCollaborators + ?Sized>(
    gateway: &G,
    collaborators: &C,
    node: &NodeRecord,
    target: &NodeRecord,
    former_primary: Option<&NodeRecord>,
    follow_command: &str,
    startup_timeout: Duration,
) -> Outcome {
    let placeholders = Placeholders {
        node_id: Some(target.node_id),
        conninfo: Some(target.conninfo.clone()),
        ..Default::default()
    };

    let command_result = commands::run(follow_command, &placeholders).await;

    if command_result.is_err() {
        if let Some(former) = former_primary
            && collaborators.probe_still_primary(former).await
        {
            return Outcome::PrimaryReappeared;
        }
        let _ = gateway
            .append_event(Some(node.node_id), EventKind::FailoverAborted, false, "follow_command failed")
            .await;
        return Outcome::FollowFail;
    }

    if !collaborators.wait_for_local_reconnect(startup_timeout).await {
        return Outcome::FollowFail;
    }

    // A write failure here is fatal: the metadata would otherwise silently
    // diverge from the node's actual replication topology.
    if let Err(e) = gateway.set_upstream(node.node_id, Some(target.node_id)).await {
        panic!("fatal: failed to record upstream after successful follow: {e}");
    }

    let _ = gateway
        .append_event(Some(node.node_id), EventKind::FailoverFollow, true, "followed new primary")
        .await;
    info!("node {} now follows node {}", node.node_id, target.node_id);
    Outcome::FollowedNewPrimary
}

/// `notify_followers`: best-effort publish of the chosen follow target (or
/// the rerun sentinel) into every live sibling's notification slot.
pub async fn notify_followers<G: MetadataGateway + ?Sized>(
    gateway: &G,
    siblings: &[NodeRecord],
    notification: NewPrimaryNotification,
) {
    for sibling in siblings {
        if let Err(e) = gateway
            .publish_new_primary_notification(sibling.node_id, Some(notification))
            .await
        {
            warn!(
                "failed to notify sibling {} of new primary: {} (it will time out into degraded mode)",
                sibling.node_id, e
            );
        }
    }
}

/// Polls this node's own "new primary notification" slot for up to
/// `timeout`, the `WAITING_NEW_PRIMARY` state. Returns `None` on timeout.
pub async fn wait_new_primary_notification<G: MetadataGateway + ?Sized>(
    gateway: &G,
    node_id: i32,
    timeout: Duration,
    poll_interval: Duration,
) -> Option<NewPrimaryNotification> {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if let Ok(Some(notification)) = gateway.read_new_primary_notification(node_id).await {
            return Some(notification);
        }
        if tokio::time::Instant::now() >= deadline {
            return None;
        }
        sleep(poll_interval).await;
    }
}

/// Dispatches the driver from an already-computed [`ElectionResult`] into
/// the matching [`Outcome`] for the `WON`-path and the cancelling paths.
/// The `WAITING_NEW_PRIMARY` / `FOLLOW_NEW_PRIMARY` paths are driven
/// separately by the caller once a notification arrives, since they
/// require a node-id lookup the driver itself has no metadata connection
/// to perform outside of the gateway the caller already holds.
pub fn outcome_for_election(result: &ElectionResult) -> Option<Outcome> {
    match result {
        ElectionResult::Cancelled { .. } => Some(Outcome::Cancelled),
        ElectionResult::NotCandidate => Some(Outcome::NotCandidate),
        ElectionResult::Rerun { .. } => Some(Outcome::ElectionRerun),
        ElectionResult::Won | ElectionResult::Lost { .. } => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::NodeRole;

    fn node(id: i32, upstream: Option<i32>) -> NodeRecord {
        NodeRecord {
            node_id: id,
            name: format!("node{id}"),
            role: NodeRole::Standby,
            upstream_node_id: upstream,
            conninfo: format!("host=n{id}"),
            repl_conninfo: format!("host=n{id} replication=database"),
            priority: 100,
            location: "A".to_string(),
            active: true,
        }
    }

    #[test]
    fn election_cancellation_maps_to_cancelled_outcome() {
        assert_eq!(
            outcome_for_election(&ElectionResult::Cancelled { reason: "x" }),
            Some(Outcome::Cancelled)
        );
        assert_eq!(outcome_for_election(&ElectionResult::NotCandidate), Some(Outcome::NotCandidate));
        assert_eq!(outcome_for_election(&ElectionResult::Won), None);
    }

    #[test]
    fn promoted_and_followed_outcomes_are_terminal() {
        assert!(Outcome::Promoted.is_terminal());
        assert!(Outcome::FollowedNewPrimary.is_terminal());
        assert!(!Outcome::NoNewPrimary.is_terminal());
        assert!(!Outcome::PromotionFailed.is_terminal());
    }

    #[tokio::test]
    async fn standby_disconnect_returns_true_once_all_siblings_drain() {
        let siblings = vec![node(2, Some(1)), node(3, Some(1))];
        let mut calls = 0;
        let result = standby_disconnect_on_failover(&siblings, Duration::from_millis(200), Duration::from_millis(10), |_| {
            calls += 1;
            calls > siblings.len() as i32 * 2
        })
        .await;
        assert!(result);
    }

    #[tokio::test]
    async fn standby_disconnect_times_out_if_a_sibling_never_drains() {
        let siblings = vec![node(2, Some(1))];
        let result = standby_disconnect_on_failover(&siblings, Duration::from_millis(50), Duration::from_millis(10), |_| false).await;
        assert!(!result);
    }
}
