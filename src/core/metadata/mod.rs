// src/core/metadata/mod.rs

//! The metadata gateway (C2): typed reads/writes of node records, voting
//! rows, the event log, and the ephemeral per-node shared state, all of
//! which live in tables inside the monitored database.
//!
//! Expressed as a trait so the election engine, failover driver, and role
//! loops can be exercised against an in-memory fake without a live Postgres
//! cluster.

pub mod postgres;

use crate::core::error::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

/// The role a node record claims for itself. The primary accepts writes;
/// standbys replay its WAL; the witness holds no data.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum NodeRole {
    Primary,
    Standby,
    Witness,
}

/// A persisted node record: one per cluster member. The record is
/// authoritative on the current primary; standbys hold an
/// eventually-consistent replica of it.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeRecord {
    pub node_id: i32,
    pub name: String,
    pub role: NodeRole,
    pub upstream_node_id: Option<i32>,
    pub conninfo: String,
    pub repl_conninfo: String,
    /// Non-negative; 0 = never a candidate.
    pub priority: i32,
    pub location: String,
    pub active: bool,
}

/// The per-node voting row. `current_term` only increases; a node may
/// initiate voting at most once per term.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct VotingRow {
    pub node_id: i32,
    pub current_term: i64,
    pub vote_initiated_in_term: Option<i64>,
}

/// The event-kind enum emitted to the append-only event log. The daemon
/// never reads these back; they exist for operators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, strum_macros::Display)]
#[strum(serialize_all = "snake_case")]
pub enum EventKind {
    RepmgrdStart,
    RepmgrdReload,
    RepmgrdShutdown,
    LocalDisconnect,
    LocalReconnect,
    UpstreamDisconnect,
    UpstreamReconnect,
    StandbyReconnect,
    FailoverPromote,
    FailoverFollow,
    FailoverAbort,
    FailoverAborted,
    PromoteError,
    StandbyFailure,
    StandbyRecovery,
    StandbyDisconnectManual,
    ChildNodeDisconnect,
    ChildNodeReconnect,
    ChildNodeNewConnect,
    ChildNodesDisconnectCommand,
}

/// The sentinel published into a node's "new primary notification" slot
/// when the cluster has decided to retry the election instead of settling
/// on a winner.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NewPrimaryNotification {
    Node(i32),
    Rerun,
}

impl NewPrimaryNotification {
    pub fn encode(self) -> String {
        match self {
            NewPrimaryNotification::Node(id) => id.to_string(),
            NewPrimaryNotification::Rerun => "rerun".to_string(),
        }
    }

    pub fn decode(raw: &str) -> Option<Self> {
        if raw.eq_ignore_ascii_case("rerun") {
            Some(NewPrimaryNotification::Rerun)
        } else {
            raw.parse::<i32>().ok().map(NewPrimaryNotification::Node)
        }
    }
}

/// A snapshot of a peer's ephemeral shared state, as published by its own
/// running daemon. Used by the election's sibling scan and by the
/// follower-notification protocol. A node with no live daemon (`pid` is
/// `None`) cannot vote or be notified.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct NodeStatus {
    pub pid: Option<i32>,
    pub last_observed_upstream_id: Option<i32>,
    pub upstream_last_seen_seconds_ago: Option<f64>,
}

#[async_trait]
pub trait MetadataGateway: Send + Sync {
    async fn get_node(&self, node_id: i32) -> Result<Option<NodeRecord>>;

    async fn get_primary(&self) -> Result<Option<NodeRecord>>;

    /// Active siblings sharing `upstream_id`, excluding `node_id` itself.
    async fn list_active_siblings(
        &self,
        node_id: i32,
        upstream_id: i32,
    ) -> Result<Vec<NodeRecord>>;

    async fn list_child_nodes(&self, primary_id: i32) -> Result<Vec<NodeRecord>>;

    /// Replaces the local `clusterward.nodes` table with exactly `nodes`:
    /// rows for node ids not present in `nodes` are removed, the rest are
    /// upserted. Used by the witness to refresh its own non-replicated copy
    /// of the node-record set from whatever node it is currently tracking.
    async fn replace_nodes(&self, nodes: Vec<NodeRecord>) -> Result<()>;

    async fn set_active(&self, node_id: i32, active: bool) -> Result<()>;

    /// Failure here is fatal exactly once: after a successful `follow`,
    /// the caller must treat an error from this call as unrecoverable —
    /// the metadata would otherwise silently diverge from reality.
    async fn set_upstream(&self, node_id: i32, upstream_node_id: Option<i32>) -> Result<()>;

    async fn mark_primary(&self, node_id: i32) -> Result<()>;

    async fn read_term(&self, node_id: i32) -> Result<VotingRow>;

    /// Bumps and returns the new term for `node_id`.
    async fn increment_term(&self, node_id: i32) -> Result<i64>;

    /// Returns `true` if this node had not yet initiated voting in `term`
    /// (and the flag is now set), `false` if it already had.
    async fn mark_vote_initiated(&self, node_id: i32, term: i64) -> Result<bool>;

    async fn reset_voting(&self, node_id: i32) -> Result<()>;

    async fn publish_new_primary_notification(
        &self,
        node_id: i32,
        notification: Option<NewPrimaryNotification>,
    ) -> Result<()>;

    async fn read_new_primary_notification(
        &self,
        node_id: i32,
    ) -> Result<Option<NewPrimaryNotification>>;

    async fn read_node_status(&self, node_id: i32) -> Result<Option<NodeStatus>>;

    async fn record_pid(&self, node_id: i32, pid: i32) -> Result<()>;

    async fn record_upstream_last_seen(
        &self,
        node_id: i32,
        upstream_id: Option<i32>,
        seconds_ago: f64,
    ) -> Result<()>;

    /// Appends an event-log entry. `node_id` is nullable: when absent,
    /// only the external notification command (if configured) runs.
    async fn append_event(
        &self,
        node_id: Option<i32>,
        kind: EventKind,
        success: bool,
        details: &str,
    ) -> Result<()>;
}
