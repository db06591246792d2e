// src/core/metadata/postgres.rs

//! The Postgres-backed implementation of the metadata gateway, reading and
//! writing the `clusterward.*` tables described in SPEC_FULL.md §3.

use super::{EventKind, MetadataGateway, NewPrimaryNotification, NodeRecord, NodeRole, NodeStatus, VotingRow};
use crate::core::error::{ClusterWardError, Result};
use async_trait::async_trait;
use tokio_postgres::{Client, NoTls};
use tracing::warn;

/// Owns a single exclusive connection to one database in the cluster, the
/// way each daemon owns exactly one handle to its local node (and, when
/// different, one to its upstream and one to the primary).
pub struct PostgresMetadataGateway {
    client: Client,
}

impl PostgresMetadataGateway {
    /// Opens a fresh connection and spawns the background I/O driver task
    /// tokio-postgres requires. The returned gateway owns `client`
    /// exclusively; dropping it closes the connection.
    pub async fn connect(conninfo: &str) -> Result<Self> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
            .await
            .map_err(|e| ClusterWardError::Transport {
                node: conninfo.to_string(),
                message: e.to_string(),
            })?;

        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("metadata gateway connection driver exited: {}", e);
            }
        });

        Ok(Self { client })
    }

    pub(crate) fn row_to_node(row: &tokio_postgres::Row) -> Result<NodeRecord> {
        let role_str: String = row.try_get("role").map_err(map_pg_err)?;
        let role = match role_str.as_str() {
            "primary" => NodeRole::Primary,
            "standby" => NodeRole::Standby,
            "witness" => NodeRole::Witness,
            other => return Err(ClusterWardError::Metadata(format!("unknown role `{other}`"))),
        };
        Ok(NodeRecord {
            node_id: row.try_get("node_id").map_err(map_pg_err)?,
            name: row.try_get("name").map_err(map_pg_err)?,
            role,
            upstream_node_id: row.try_get("upstream_node_id").map_err(map_pg_err)?,
            conninfo: row.try_get("conninfo").map_err(map_pg_err)?,
            repl_conninfo: row.try_get("repl_conninfo").map_err(map_pg_err)?,
            priority: row.try_get("priority").map_err(map_pg_err)?,
            location: row.try_get("location").map_err(map_pg_err)?,
            active: row.try_get("active").map_err(map_pg_err)?,
        })
    }
}

fn map_pg_err(e: tokio_postgres::Error) -> ClusterWardError {
    ClusterWardError::Metadata(e.to_string())
}

pub(crate) const NODE_COLUMNS: &str =
    "node_id, name, role, upstream_node_id, conninfo, repl_conninfo, priority, location, active";

#[async_trait]
impl MetadataGateway for PostgresMetadataGateway {
    async fn get_node(&self, node_id: i32) -> Result<Option<NodeRecord>> {
        let row = self
            .client
            .query_opt(
                &format!("SELECT {NODE_COLUMNS} FROM clusterward.nodes WHERE node_id = $1"),
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn get_primary(&self) -> Result<Option<NodeRecord>> {
        let row = self
            .client
            .query_opt(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM clusterward.nodes WHERE role = 'primary' AND active LIMIT 1"
                ),
                &[],
            )
            .await
            .map_err(map_pg_err)?;
        row.as_ref().map(Self::row_to_node).transpose()
    }

    async fn list_active_siblings(
        &self,
        node_id: i32,
        upstream_id: i32,
    ) -> Result<Vec<NodeRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM clusterward.nodes \
                     WHERE upstream_node_id = $1 AND node_id != $2 AND active"
                ),
                &[&upstream_id, &node_id],
            )
            .await
            .map_err(map_pg_err)?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn list_child_nodes(&self, primary_id: i32) -> Result<Vec<NodeRecord>> {
        let rows = self
            .client
            .query(
                &format!(
                    "SELECT {NODE_COLUMNS} FROM clusterward.nodes WHERE upstream_node_id = $1"
                ),
                &[&primary_id],
            )
            .await
            .map_err(map_pg_err)?;
        rows.iter().map(Self::row_to_node).collect()
    }

    async fn replace_nodes(&self, nodes: Vec<NodeRecord>) -> Result<()> {
        let keep_ids: Vec<i32> = nodes.iter().map(|n| n.node_id).collect();
        self.client
            .execute(
                "DELETE FROM clusterward.nodes WHERE node_id != ALL($1)",
                &[&keep_ids],
            )
            .await
            .map_err(map_pg_err)?;

        for node in &nodes {
            let role_str = match node.role {
                NodeRole::Primary => "primary",
                NodeRole::Standby => "standby",
                NodeRole::Witness => "witness",
            };
            self.client
                .execute(
                    &format!(
                        "INSERT INTO clusterward.nodes ({NODE_COLUMNS}) \
                         VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9) \
                         ON CONFLICT (node_id) DO UPDATE SET \
                             name = $2, role = $3, upstream_node_id = $4, conninfo = $5, \
                             repl_conninfo = $6, priority = $7, location = $8, active = $9"
                    ),
                    &[
                        &node.node_id,
                        &node.name,
                        &role_str,
                        &node.upstream_node_id,
                        &node.conninfo,
                        &node.repl_conninfo,
                        &node.priority,
                        &node.location,
                        &node.active,
                    ],
                )
                .await
                .map_err(map_pg_err)?;
        }

        Ok(())
    }

    async fn set_active(&self, node_id: i32, active: bool) -> Result<()> {
        self.client
            .execute(
                "UPDATE clusterward.nodes SET active = $1 WHERE node_id = $2",
                &[&active, &node_id],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn set_upstream(&self, node_id: i32, upstream_node_id: Option<i32>) -> Result<()> {
        self.client
            .execute(
                "UPDATE clusterward.nodes SET upstream_node_id = $1 WHERE node_id = $2",
                &[&upstream_node_id, &node_id],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn mark_primary(&self, node_id: i32) -> Result<()> {
        self.client
            .execute(
                "UPDATE clusterward.nodes SET role = 'primary', upstream_node_id = NULL \
                 WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn read_term(&self, node_id: i32) -> Result<VotingRow> {
        let row = self
            .client
            .query_opt(
                "SELECT node_id, current_term, vote_initiated_in_term \
                 FROM clusterward.voting WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        match row {
            Some(row) => Ok(VotingRow {
                node_id: row.try_get("node_id").map_err(map_pg_err)?,
                current_term: row.try_get("current_term").map_err(map_pg_err)?,
                vote_initiated_in_term: row.try_get("vote_initiated_in_term").map_err(map_pg_err)?,
            }),
            None => {
                self.client
                    .execute(
                        "INSERT INTO clusterward.voting (node_id, current_term) VALUES ($1, 0) \
                         ON CONFLICT (node_id) DO NOTHING",
                        &[&node_id],
                    )
                    .await
                    .map_err(map_pg_err)?;
                Ok(VotingRow {
                    node_id,
                    current_term: 0,
                    vote_initiated_in_term: None,
                })
            }
        }
    }

    async fn increment_term(&self, node_id: i32) -> Result<i64> {
        let row = self
            .client
            .query_one(
                "UPDATE clusterward.voting SET current_term = current_term + 1 \
                 WHERE node_id = $1 RETURNING current_term",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        row.try_get("current_term").map_err(map_pg_err)
    }

    async fn mark_vote_initiated(&self, node_id: i32, term: i64) -> Result<bool> {
        let row = self
            .client
            .query_one(
                "UPDATE clusterward.voting SET vote_initiated_in_term = $2 \
                 WHERE node_id = $1 \
                   AND (vote_initiated_in_term IS NULL OR vote_initiated_in_term < $2) \
                 RETURNING node_id",
                &[&node_id, &term],
            )
            .await;
        match row {
            Ok(_) => Ok(true),
            Err(e) if e.code().is_none() => Ok(false),
            Err(e) => {
                // query_one on zero rows surfaces as an error with no SQLSTATE;
                // that is the "already initiated" case, not a real failure.
                if e.to_string().contains("query returned no rows") {
                    Ok(false)
                } else {
                    Err(map_pg_err(e))
                }
            }
        }
    }

    async fn reset_voting(&self, node_id: i32) -> Result<()> {
        self.client
            .execute(
                "UPDATE clusterward.voting SET vote_initiated_in_term = NULL WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn publish_new_primary_notification(
        &self,
        node_id: i32,
        notification: Option<NewPrimaryNotification>,
    ) -> Result<()> {
        let encoded = notification.map(|n| n.encode());
        self.client
            .execute(
                "INSERT INTO clusterward.node_status (node_id, new_primary_notification, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (node_id) DO UPDATE SET new_primary_notification = $2, updated_at = now()",
                &[&node_id, &encoded],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn read_new_primary_notification(
        &self,
        node_id: i32,
    ) -> Result<Option<NewPrimaryNotification>> {
        let row = self
            .client
            .query_opt(
                "SELECT new_primary_notification FROM clusterward.node_status WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(row
            .and_then(|r| r.get::<_, Option<String>>("new_primary_notification"))
            .and_then(|raw| NewPrimaryNotification::decode(&raw)))
    }

    async fn read_node_status(&self, node_id: i32) -> Result<Option<NodeStatus>> {
        let row = self
            .client
            .query_opt(
                "SELECT pid, last_observed_upstream_id, upstream_last_seen_seconds_ago \
                 FROM clusterward.node_status WHERE node_id = $1",
                &[&node_id],
            )
            .await
            .map_err(map_pg_err)?;
        row.map(|row| {
            Ok(NodeStatus {
                pid: row.try_get("pid").map_err(map_pg_err)?,
                last_observed_upstream_id: row
                    .try_get("last_observed_upstream_id")
                    .map_err(map_pg_err)?,
                upstream_last_seen_seconds_ago: row
                    .try_get("upstream_last_seen_seconds_ago")
                    .map_err(map_pg_err)?,
            })
        })
        .transpose()
    }

    async fn record_pid(&self, node_id: i32, pid: i32) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO clusterward.node_status (node_id, pid, updated_at) \
                 VALUES ($1, $2, now()) \
                 ON CONFLICT (node_id) DO UPDATE SET pid = $2, updated_at = now()",
                &[&node_id, &pid],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn record_upstream_last_seen(
        &self,
        node_id: i32,
        upstream_id: Option<i32>,
        seconds_ago: f64,
    ) -> Result<()> {
        self.client
            .execute(
                "INSERT INTO clusterward.node_status \
                     (node_id, last_observed_upstream_id, upstream_last_seen_seconds_ago, updated_at) \
                 VALUES ($1, $2, $3, now()) \
                 ON CONFLICT (node_id) DO UPDATE SET \
                     last_observed_upstream_id = $2, \
                     upstream_last_seen_seconds_ago = $3, \
                     updated_at = now()",
                &[&node_id, &upstream_id, &seconds_ago],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }

    async fn append_event(
        &self,
        node_id: Option<i32>,
        kind: EventKind,
        success: bool,
        details: &str,
    ) -> Result<()> {
        // A `None` node id means the caller wants only its external
        // notification hook to fire, with no event-log row. Nothing to do
        // here.
        let Some(node_id) = node_id else {
            return Ok(());
        };
        self.client
            .execute(
                "INSERT INTO clusterward.events (node_id, event_kind, success, occurred_at, details) \
                 VALUES ($1, $2, $3, now(), $4)",
                &[&node_id, &kind.to_string(), &success, &details],
            )
            .await
            .map_err(map_pg_err)?;
        Ok(())
    }
}
