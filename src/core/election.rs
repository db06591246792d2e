// src/core/election.rs

//! The election engine (C4): picks the standby that should promote when
//! the primary is lost, guarded against split-brain and minority partitions.

use crate::core::commands::{self, Placeholders};
use crate::core::lsn::Lsn;
use crate::core::metadata::{MetadataGateway, NodeRecord};
use crate::core::probe::ReplicationProbe;
use std::time::Duration;
use tracing::{debug, info, warn};

/// The outcome of an election attempt. Carries only what the caller needs
/// to act — no shared mutable state is threaded through here.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ElectionResult {
    /// This node should promote itself.
    Won,
    /// A specific other node should be (or already was) promoted; the
    /// caller should follow it.
    Lost { new_primary_id: i32 },
    /// No action: stay in or enter degraded mode.
    Cancelled { reason: &'static str },
    /// Sleep `after`, then run the election again.
    Rerun { after: Duration },
    /// This node must never become primary.
    NotCandidate,
}

/// One sibling's view, as scanned over a short-lived connection during the
/// election. A sibling absent from the scan (daemon not running, or
/// unreachable) never appears here — it simply cannot vote or be notified.
#[derive(Debug, Clone)]
pub struct SiblingView {
    pub node: NodeRecord,
    pub last_wal_receive_lsn: Lsn,
    pub in_recovery: bool,
    pub observed_upstream_id: Option<i32>,
    pub upstream_last_seen_seconds_ago: Option<f64>,
    pub daemon_pid_present: bool,
}

/// Everything the election needs about the local node, gathered once per
/// attempt by the caller (a role loop) before invoking [`run`].
pub struct LocalView {
    pub node: NodeRecord,
    pub last_wal_receive_lsn: Lsn,
    pub primary: NodeRecord,
    pub reachable_locations: Vec<String>,
    pub siblings: Vec<SiblingView>,
}

/// Election-tunable configuration, drawn from the `[AMBIENT]` configuration
/// layer (§6 of the option table).
pub struct ElectionConfig {
    pub manual_failover: bool,
    pub primary_visibility_consensus: bool,
    pub monitor_interval_secs: u64,
    pub election_rerun_interval: Duration,
    pub failover_validation_command: Option<String>,
}

/// Runs one election attempt. `probe_sibling` lets the caller plug in a
/// live [`ReplicationProbe`] per sibling for the rogue-primary check
/// without this module owning any connections itself.
pub async fn run<G: MetadataGateway + ?Sized>(
    gateway: &G,
    local: &LocalView,
    config: &ElectionConfig,
    check_rogue_sibling: impl Fn(&SiblingView) -> bool,
) -> ElectionResult {
    if config.manual_failover {
        return ElectionResult::NotCandidate;
    }
    if local.node.priority == 0 {
        // A priority-0 node never stands. Unlike `Lost`, there is no other
        // node to name here yet, so this falls through to degraded-timeout
        // monitoring rather than claiming a winner.
        return ElectionResult::Cancelled { reason: "priority zero: never a candidate" };
    }

    let term = match gateway.read_term(local.node.node_id).await {
        Ok(row) => row.current_term,
        Err(e) => {
            warn!("failed to read electoral term: {}", e);
            return ElectionResult::Cancelled { reason: "term unreadable" };
        }
    };
    match gateway.mark_vote_initiated(local.node.node_id, term).await {
        Ok(false) => {
            debug!("node {} already initiated voting in term {}", local.node.node_id, term);
            return ElectionResult::Cancelled { reason: "already initiated this term" };
        }
        Err(e) => {
            warn!("failed to mark vote initiated: {}", e);
            return ElectionResult::Cancelled { reason: "voting row unwritable" };
        }
        Ok(true) => {}
    }

    // Guard 1: primary-location presence (the network-split guard).
    if !local
        .reachable_locations
        .iter()
        .any(|loc| loc == &local.primary.location)
    {
        info!(
            "no reachable node in primary's location `{}`; cancelling election",
            local.primary.location
        );
        return ElectionResult::Cancelled { reason: "primary location unreachable" };
    }

    // Guard 2: primary still visible somewhere (only the initiator thinks
    // it's gone).
    if config.primary_visibility_consensus {
        let fresh_threshold = 2.0 * config.monitor_interval_secs as f64;
        if local.siblings.iter().any(|s| {
            s.observed_upstream_id == Some(local.primary.node_id)
                && s.upstream_last_seen_seconds_ago.map(|t| t < fresh_threshold).unwrap_or(false)
        }) {
            info!("a sibling still sees the primary recently; cancelling election");
            return ElectionResult::Cancelled { reason: "primary visible to a sibling" };
        }
    }

    // Guard 3: quorum.
    let shared_upstream_nodes = local.siblings.len() + 1; // including self
    let visible_nodes = local.siblings.iter().filter(|s| s.daemon_pid_present).count() + 1;
    if visible_nodes <= shared_upstream_nodes / 2 {
        info!(
            "quorum guard triggered: visible={} shared={}",
            visible_nodes, shared_upstream_nodes
        );
        return ElectionResult::Cancelled { reason: "no qualified majority" };
    }

    // Guard 4: rogue / already-promoted sibling.
    for sibling in &local.siblings {
        if !sibling.in_recovery && sibling.node.role != crate::core::metadata::NodeRole::Witness {
            if check_rogue_sibling(sibling) {
                info!(
                    "sibling {} already acts as primary and can be followed; cancelling",
                    sibling.node.node_id
                );
                return ElectionResult::Cancelled { reason: "rogue sibling already primary" };
            } else {
                warn!(
                    "sibling {} reports itself out of recovery but cannot be followed; ignoring",
                    sibling.node.node_id
                );
            }
        }
    }

    // Candidate selection among eligible siblings (daemon live, priority
    // already implied eligible by presence in `siblings`) plus self.
    let mut candidates: Vec<(i32, Lsn, i32)> = local
        .siblings
        .iter()
        .filter(|s| s.daemon_pid_present && s.node.priority > 0)
        .map(|s| (s.node.node_id, s.last_wal_receive_lsn, s.node.priority))
        .collect();
    candidates.push((local.node.node_id, local.last_wal_receive_lsn, local.node.priority));

    // Single-sibling fast path.
    if local.siblings.is_empty() {
        return if local.reachable_locations.contains(&local.primary.location) {
            ElectionResult::Won
        } else {
            ElectionResult::NotCandidate
        };
    }

    candidates.sort_by(|a, b| {
        b.1.cmp(&a.1) // higher LSN first
            .then_with(|| b.2.cmp(&a.2)) // then higher priority
            .then_with(|| a.0.cmp(&b.0)) // then lower node_id
    });

    let winner_id = candidates[0].0;

    if winner_id != local.node.node_id {
        return ElectionResult::Lost { new_primary_id: winner_id };
    }

    if let Some(validation_command) = &config.failover_validation_command {
        let placeholders = Placeholders {
            node_id: Some(local.node.node_id),
            conninfo: Some(local.node.conninfo.clone()),
            last_wal_receive_lsn: Some(local.last_wal_receive_lsn.to_string()),
            upstream_node_id: local.node.upstream_node_id,
            location: Some(local.node.location.clone()),
            primary_node_id: None,
        };
        match commands::run(validation_command, &placeholders).await {
            Ok(()) => ElectionResult::Won,
            Err(_) => ElectionResult::Rerun { after: config.election_rerun_interval },
        }
    } else {
        ElectionResult::Won
    }
}

/// The rogue-sibling check: can `sibling` be followed without a rewind?
/// Split out so callers holding live connections can build the closure
/// `run` expects from a real [`ReplicationProbe`] pair.
pub async fn can_follow_rogue_sibling(
    local_lsn: Lsn,
    local_probe: &dyn ReplicationProbe,
    sibling_probe: &dyn ReplicationProbe,
) -> bool {
    local_probe.check_node_can_follow(local_lsn, sibling_probe).await.unwrap_or(false)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::metadata::NodeRole;

    fn node(id: i32, priority: i32, location: &str) -> NodeRecord {
        NodeRecord {
            node_id: id,
            name: format!("node{id}"),
            role: NodeRole::Standby,
            upstream_node_id: Some(1),
            conninfo: format!("host=n{id}"),
            repl_conninfo: format!("host=n{id} replication=database"),
            priority,
            location: location.to_string(),
            active: true,
        }
    }

    fn base_config() -> ElectionConfig {
        ElectionConfig {
            manual_failover: false,
            primary_visibility_consensus: false,
            monitor_interval_secs: 2,
            election_rerun_interval: Duration::from_secs(10),
            failover_validation_command: None,
        }
    }

    fn sibling(id: i32, priority: i32, lsn: Lsn, location: &str, pid_present: bool) -> SiblingView {
        SiblingView {
            node: node(id, priority, location),
            last_wal_receive_lsn: lsn,
            in_recovery: true,
            observed_upstream_id: Some(1),
            upstream_last_seen_seconds_ago: Some(0.5),
            daemon_pid_present: pid_present,
        }
    }

    /// A gateway fake that only implements what `election::run` actually
    /// touches (`read_term`, `mark_vote_initiated`); everything else would
    /// indicate a test exercising a path this module doesn't own.
    struct FakeGateway {
        term: i64,
        already_initiated: bool,
    }

    #[async_trait::async_trait]
    impl MetadataGateway for FakeGateway {
        async fn get_node(&self, _: i32) -> crate::core::error::Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn get_primary(&self) -> crate::core::error::Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn list_active_siblings(&self, _: i32, _: i32) -> crate::core::error::Result<Vec<NodeRecord>> {
            unimplemented!()
        }
        async fn list_child_nodes(&self, _: i32) -> crate::core::error::Result<Vec<NodeRecord>> {
            unimplemented!()
        }
        async fn replace_nodes(&self, _: Vec<NodeRecord>) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn set_active(&self, _: i32, _: bool) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn set_upstream(&self, _: i32, _: Option<i32>) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn mark_primary(&self, _: i32) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn read_term(&self, node_id: i32) -> crate::core::error::Result<crate::core::metadata::VotingRow> {
            Ok(crate::core::metadata::VotingRow {
                node_id,
                current_term: self.term,
                vote_initiated_in_term: None,
            })
        }
        async fn increment_term(&self, _: i32) -> crate::core::error::Result<i64> {
            unimplemented!()
        }
        async fn mark_vote_initiated(&self, _: i32, _: i64) -> crate::core::error::Result<bool> {
            Ok(!self.already_initiated)
        }
        async fn reset_voting(&self, _: i32) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn publish_new_primary_notification(
            &self,
            _: i32,
            _: Option<crate::core::metadata::NewPrimaryNotification>,
        ) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn read_new_primary_notification(
            &self,
            _: i32,
        ) -> crate::core::error::Result<Option<crate::core::metadata::NewPrimaryNotification>> {
            unimplemented!()
        }
        async fn read_node_status(&self, _: i32) -> crate::core::error::Result<Option<crate::core::metadata::NodeStatus>> {
            unimplemented!()
        }
        async fn record_pid(&self, _: i32, _: i32) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn record_upstream_last_seen(&self, _: i32, _: Option<i32>, _: f64) -> crate::core::error::Result<()> {
            unimplemented!()
        }
        async fn append_event(
            &self,
            _: Option<i32>,
            _: crate::core::metadata::EventKind,
            _: bool,
            _: &str,
        ) -> crate::core::error::Result<()> {
            unimplemented!()
        }
    }

    fn fresh_gateway() -> FakeGateway {
        FakeGateway { term: 4, already_initiated: false }
    }

    #[tokio::test]
    async fn priority_zero_node_never_wins() {
        let local = LocalView {
            node: node(2, 0, "A"),
            last_wal_receive_lsn: Lsn::from_parts(0, 0x600),
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![],
        };
        let result = run(&fresh_gateway(), &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Cancelled { reason: "priority zero: never a candidate" });
    }

    #[tokio::test]
    async fn manual_failover_is_never_a_candidate() {
        let mut config = base_config();
        config.manual_failover = true;
        let local = LocalView {
            node: node(2, 100, "A"),
            last_wal_receive_lsn: Lsn::ZERO,
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![],
        };
        assert_eq!(run(&fresh_gateway(), &local, &config, |_| false).await, ElectionResult::NotCandidate);
    }

    #[tokio::test]
    async fn already_initiated_this_term_cancels() {
        let local = LocalView {
            node: node(2, 100, "A"),
            last_wal_receive_lsn: Lsn::ZERO,
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![],
        };
        let gateway = FakeGateway { term: 4, already_initiated: true };
        let result = run(&gateway, &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Cancelled { reason: "already initiated this term" });
    }

    #[tokio::test]
    async fn location_guard_cancels_when_primary_location_unreachable() {
        let local = LocalView {
            node: node(2, 100, "B"),
            last_wal_receive_lsn: Lsn::from_parts(0, 0x500),
            primary: node(1, 100, "A"),
            reachable_locations: vec!["B".to_string()],
            siblings: vec![sibling(3, 100, Lsn::from_parts(0, 0x400), "B", true)],
        };
        let result = run(&fresh_gateway(), &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Cancelled { reason: "primary location unreachable" });
    }

    #[tokio::test]
    async fn quorum_guard_cancels_when_minority_visible() {
        let local = LocalView {
            node: node(2, 100, "A"),
            last_wal_receive_lsn: Lsn::from_parts(0, 0x500),
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![
                sibling(3, 100, Lsn::from_parts(0, 0x400), "A", false),
                sibling(4, 100, Lsn::from_parts(0, 0x400), "A", false),
            ],
        };
        let result = run(&fresh_gateway(), &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Cancelled { reason: "no qualified majority" });
    }

    #[tokio::test]
    async fn higher_lsn_sibling_wins_over_local() {
        let local = LocalView {
            node: node(2, 100, "A"),
            last_wal_receive_lsn: Lsn::from_parts(0, 0x500),
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![sibling(3, 100, Lsn::from_parts(0, 0x600), "A", true)],
        };
        let result = run(&fresh_gateway(), &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Lost { new_primary_id: 3 });
    }

    #[tokio::test]
    async fn local_wins_clean_election_with_no_validation_command() {
        let local = LocalView {
            node: node(3, 100, "A"),
            last_wal_receive_lsn: Lsn::from_parts(0, 0x600),
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![sibling(2, 100, Lsn::from_parts(0, 0x500), "A", true)],
        };
        let result = run(&fresh_gateway(), &local, &base_config(), |_| false).await;
        assert_eq!(result, ElectionResult::Won);
    }

    #[test]
    fn single_sibling_fast_path_wins_in_primary_location() {
        let local = LocalView {
            node: node(2, 100, "A"),
            last_wal_receive_lsn: Lsn::ZERO,
            primary: node(1, 100, "A"),
            reachable_locations: vec!["A".to_string()],
            siblings: vec![],
        };
        assert!(local.siblings.is_empty());
        assert!(local.reachable_locations.contains(&local.primary.location));
    }
}
