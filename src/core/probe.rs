// src/core/probe.rs

//! The replication probe (C3): a thin layer over Postgres's own recovery
//! and WAL-position introspection functions. Every method here issues one
//! query against a node's `conninfo` connection; none of them interpret
//! the result beyond parsing it into a typed value.

use crate::core::error::{ClusterWardError, Result};
use crate::core::lsn::Lsn;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::time::Duration;
use tokio_postgres::Client;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryType {
    Primary,
    Standby,
}

/// Snapshot of a standby's replication position, as seen from that standby's
/// own connection.
#[derive(Debug, Clone, Copy)]
pub struct ReplicationInfo {
    pub receive_lsn: Option<Lsn>,
    pub replay_lsn: Option<Lsn>,
    pub last_replay_timestamp: Option<DateTime<Utc>>,
    /// Mirrors `pg_is_wal_replay_paused()`. A paused sibling is logged, not
    /// disqualified from the scan on that basis alone.
    pub wal_replay_paused: bool,
}

/// The result of `identify_system`: the node's database system identifier,
/// current timeline and latest flushed position. The system identifier
/// distinguishes genuinely unrelated clusters (restored from a different
/// base backup, say) from a timeline fork within the same cluster.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SystemIdentity {
    pub system_id: u64,
    pub timeline_id: i32,
    pub xlog_pos: Lsn,
}

#[async_trait]
pub trait ReplicationProbe: Send + Sync {
    async fn recovery_type(&self) -> Result<RecoveryType>;

    /// Only meaningful when `recovery_type` is `Standby`.
    async fn replication_info(&self) -> Result<ReplicationInfo>;

    /// Only meaningful when `recovery_type` is `Primary`.
    async fn primary_current_lsn(&self) -> Result<Lsn>;

    /// The PID of the local `walreceiver` process, if one is running.
    async fn wal_receiver_pid(&self) -> Result<Option<i32>>;

    async fn identify_system(&self) -> Result<SystemIdentity>;

    /// The `.history` file entries this node has recorded for ancestor
    /// timeline `since_timeline`: pairs of `(timeline, switch_lsn)`, oldest
    /// first, where `switch_lsn` is the point at which that ancestor ended
    /// (the fork point). An empty vector means no history file exists
    /// (timeline 1, or a cluster with no prior promotions).
    async fn timeline_history(&self, since_timeline: i32) -> Result<Vec<(i32, Lsn)>>;

    /// Checks whether this node could follow `upstream` without a timeline
    /// rewind: reject if the two nodes' system
    /// identifiers differ; on a shared timeline, this node's LSN must not
    /// exceed upstream's current LSN; on a higher upstream timeline, the
    /// history file must show that timeline's fork point at or beyond this
    /// node's LSN.
    async fn check_node_can_follow(&self, local_lsn: Lsn, upstream: &dyn ReplicationProbe) -> Result<bool> {
        let mine = self.identify_system().await?;
        let theirs = upstream.identify_system().await?;

        if mine.system_id != theirs.system_id {
            return Ok(false);
        }

        if mine.timeline_id == theirs.timeline_id {
            return Ok(local_lsn <= theirs.xlog_pos);
        }

        if theirs.timeline_id < mine.timeline_id {
            // This node is already ahead of the candidate upstream's
            // timeline; following it would require a rewind.
            return Ok(false);
        }

        let history = upstream.timeline_history(mine.timeline_id).await?;
        Ok(history
            .iter()
            .find(|(tli, _)| *tli == mine.timeline_id)
            .map(|(_, fork_lsn)| *fork_lsn >= local_lsn)
            .unwrap_or(false))
    }
}

/// Queries a single Postgres connection's replication state directly,
/// the way `pg_exporter`'s replication collectors and the risk-monitor's
/// `DatabaseReplicationManager::get_replication_lag` do.
///
/// `identify_system`/`timeline_history` speak the Postgres replication
/// *protocol* (the same `IDENTIFY_SYSTEM`/`TIMELINE_HISTORY` commands
/// `pg_basebackup` and a walreceiver use), not plain SQL, so they need a
/// connection opened with `replication=database` in its conninfo — kept as
/// a second, optional client since the plain-SQL queries above don't
/// require replication mode.
pub struct PostgresProbe<'a> {
    client: &'a Client,
    repl_client: Option<&'a Client>,
}

impl<'a> PostgresProbe<'a> {
    pub fn new(client: &'a Client) -> Self {
        Self { client, repl_client: None }
    }

    pub fn with_replication(client: &'a Client, repl_client: &'a Client) -> Self {
        Self { client, repl_client: Some(repl_client) }
    }

    fn map_err(e: tokio_postgres::Error) -> ClusterWardError {
        ClusterWardError::Transport {
            node: "probe".to_string(),
            message: e.to_string(),
        }
    }

    fn repl_client(&self) -> Result<&Client> {
        self.repl_client.ok_or_else(|| {
            ClusterWardError::FatalConfig(
                "replication protocol command issued without a replication-mode connection".to_string(),
            )
        })
    }

    async fn simple_query_rows(client: &Client, query: &str) -> Result<Vec<tokio_postgres::SimpleQueryRow>> {
        use tokio_postgres::SimpleQueryMessage;
        let messages = client.simple_query(query).await.map_err(Self::map_err)?;
        Ok(messages
            .into_iter()
            .filter_map(|m| match m {
                SimpleQueryMessage::Row(row) => Some(row),
                _ => None,
            })
            .collect())
    }
}

#[async_trait]
impl ReplicationProbe for PostgresProbe<'_> {
    async fn recovery_type(&self) -> Result<RecoveryType> {
        let row = self
            .client
            .query_one("SELECT pg_is_in_recovery()", &[])
            .await
            .map_err(Self::map_err)?;
        let in_recovery: bool = row.try_get(0).map_err(Self::map_err)?;
        Ok(if in_recovery {
            RecoveryType::Standby
        } else {
            RecoveryType::Primary
        })
    }

    async fn replication_info(&self) -> Result<ReplicationInfo> {
        let row = self
            .client
            .query_one(
                "SELECT pg_last_wal_receive_lsn()::text, \
                        pg_last_wal_replay_lsn()::text, \
                        pg_last_xact_replay_timestamp(), \
                        pg_is_wal_replay_paused()",
                &[],
            )
            .await
            .map_err(Self::map_err)?;

        let receive_lsn: Option<String> = row.try_get(0).map_err(Self::map_err)?;
        let replay_lsn: Option<String> = row.try_get(1).map_err(Self::map_err)?;
        let last_replay_timestamp: Option<DateTime<Utc>> = row.try_get(2).map_err(Self::map_err)?;
        let wal_replay_paused: bool = row.try_get(3).map_err(Self::map_err)?;

        Ok(ReplicationInfo {
            receive_lsn: receive_lsn.and_then(|s| s.parse().ok()),
            replay_lsn: replay_lsn.and_then(|s| s.parse().ok()),
            last_replay_timestamp,
            wal_replay_paused,
        })
    }

    async fn primary_current_lsn(&self) -> Result<Lsn> {
        let row = self
            .client
            .query_one("SELECT pg_current_wal_lsn()::text", &[])
            .await
            .map_err(Self::map_err)?;
        let text: String = row.try_get(0).map_err(Self::map_err)?;
        text.parse().map_err(|_| ClusterWardError::Metadata(format!("malformed LSN `{text}`")))
    }

    async fn wal_receiver_pid(&self) -> Result<Option<i32>> {
        let row = self
            .client
            .query_opt("SELECT pid FROM pg_stat_wal_receiver", &[])
            .await
            .map_err(Self::map_err)?;
        row.map(|r| r.try_get(0).map_err(Self::map_err)).transpose()
    }

    async fn identify_system(&self) -> Result<SystemIdentity> {
        let repl = self.repl_client()?;
        let rows = Self::simple_query_rows(repl, "IDENTIFY_SYSTEM").await?;
        let row = rows
            .first()
            .ok_or_else(|| ClusterWardError::Metadata("IDENTIFY_SYSTEM returned no row".to_string()))?;

        let system_id: u64 = row
            .get(0)
            .ok_or_else(|| ClusterWardError::Metadata("IDENTIFY_SYSTEM missing systemid column".to_string()))?
            .parse()
            .map_err(|_| ClusterWardError::Metadata("IDENTIFY_SYSTEM returned a non-numeric systemid".to_string()))?;

        let timeline_id: i32 = row
            .get(1)
            .ok_or_else(|| ClusterWardError::Metadata("IDENTIFY_SYSTEM missing timeline column".to_string()))?
            .parse()
            .map_err(|_| ClusterWardError::Metadata("IDENTIFY_SYSTEM returned a non-numeric timeline".to_string()))?;

        let xlog_pos: Lsn = row
            .get(2)
            .ok_or_else(|| ClusterWardError::Metadata("IDENTIFY_SYSTEM missing xlogpos column".to_string()))?
            .parse()
            .map_err(|_| ClusterWardError::Metadata("IDENTIFY_SYSTEM returned a malformed xlogpos".to_string()))?;

        Ok(SystemIdentity { system_id, timeline_id, xlog_pos })
    }

    async fn timeline_history(&self, since_timeline: i32) -> Result<Vec<(i32, Lsn)>> {
        let repl = self.repl_client()?;
        let query = format!("TIMELINE_HISTORY {since_timeline}");
        let rows = match Self::simple_query_rows(repl, &query).await {
            Ok(rows) => rows,
            // Timeline 1 has no history file; an empty history is the
            // correct answer, not an error.
            Err(_) if since_timeline == 1 => return Ok(Vec::new()),
            Err(e) => return Err(e),
        };
        let Some(row) = rows.first() else {
            return Ok(Vec::new());
        };
        let content = row.get(1).unwrap_or("");
        Ok(parse_timeline_history(content))
    }
}

/// Parses a Postgres `.history` file body: one line per ancestor timeline,
/// `parentTLI<TAB>switchLSN<TAB>reason`, with blank lines and `#` comments
/// ignored.
fn parse_timeline_history(content: &str) -> Vec<(i32, Lsn)> {
    content
        .lines()
        .filter_map(|line| {
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                return None;
            }
            let mut fields = trimmed.split_whitespace();
            let tli = fields.next()?.parse::<i32>().ok()?;
            let lsn = fields.next()?.parse::<Lsn>().ok()?;
            Some((tli, lsn))
        })
        .collect()
}

/// A short statement timeout for the cheap liveness probe used by the
/// connection supervisor, not the replication-state queries above.
pub const PING_TIMEOUT: Duration = Duration::from_secs(5);

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_history_file_ignoring_blanks_and_comments() {
        let content = "\
# comment line
1\t0/3000028\tno recovery target specified

2\t0/5000090\tno recovery target specified
";
        assert_eq!(
            parse_timeline_history(content),
            vec![(1, Lsn::from_parts(0, 0x3000028)), (2, Lsn::from_parts(0, 0x5000090))]
        );
    }

    #[test]
    fn empty_history_file_yields_no_timelines() {
        assert_eq!(parse_timeline_history(""), Vec::<(i32, Lsn)>::new());
    }

    struct FixedProbe {
        identity: SystemIdentity,
        history: Vec<(i32, Lsn)>,
    }

    #[async_trait]
    impl ReplicationProbe for FixedProbe {
        async fn recovery_type(&self) -> Result<RecoveryType> {
            Ok(RecoveryType::Standby)
        }
        async fn replication_info(&self) -> Result<ReplicationInfo> {
            unimplemented!()
        }
        async fn primary_current_lsn(&self) -> Result<Lsn> {
            unimplemented!()
        }
        async fn wal_receiver_pid(&self) -> Result<Option<i32>> {
            unimplemented!()
        }
        async fn identify_system(&self) -> Result<SystemIdentity> {
            Ok(self.identity)
        }
        async fn timeline_history(&self, _since_timeline: i32) -> Result<Vec<(i32, Lsn)>> {
            Ok(self.history.clone())
        }
    }

    #[tokio::test]
    async fn mismatched_system_identifiers_cannot_follow() {
        let mine = FixedProbe {
            identity: SystemIdentity { system_id: 1, timeline_id: 2, xlog_pos: Lsn::from_parts(0, 0x500) },
            history: vec![],
        };
        let theirs = FixedProbe {
            identity: SystemIdentity { system_id: 2, timeline_id: 2, xlog_pos: Lsn::from_parts(0, 0x600) },
            history: vec![],
        };
        assert!(!mine.check_node_can_follow(Lsn::from_parts(0, 0x400), &theirs).await.unwrap());
    }

    #[tokio::test]
    async fn same_timeline_follows_iff_local_lsn_not_ahead() {
        let theirs = FixedProbe {
            identity: SystemIdentity { system_id: 9, timeline_id: 2, xlog_pos: Lsn::from_parts(0, 0x600) },
            history: vec![],
        };
        let mine = FixedProbe { identity: SystemIdentity { system_id: 9, timeline_id: 2, xlog_pos: Lsn::ZERO }, history: vec![] };
        assert!(mine.check_node_can_follow(Lsn::from_parts(0, 0x500), &theirs).await.unwrap());
        assert!(!mine.check_node_can_follow(Lsn::from_parts(0, 0x700), &theirs).await.unwrap());
    }

    #[tokio::test]
    async fn higher_upstream_timeline_requires_fork_point_at_or_beyond_local_lsn() {
        let theirs = FixedProbe {
            identity: SystemIdentity { system_id: 9, timeline_id: 3, xlog_pos: Lsn::from_parts(0, 0x900) },
            history: vec![(2, Lsn::from_parts(0, 0x600))],
        };
        let mine = FixedProbe { identity: SystemIdentity { system_id: 9, timeline_id: 2, xlog_pos: Lsn::ZERO }, history: vec![] };

        assert!(mine.check_node_can_follow(Lsn::from_parts(0, 0x500), &theirs).await.unwrap());
        assert!(!mine.check_node_can_follow(Lsn::from_parts(0, 0x700), &theirs).await.unwrap());
    }

    #[tokio::test]
    async fn fork_point_missing_from_history_cannot_follow() {
        let theirs = FixedProbe {
            identity: SystemIdentity { system_id: 9, timeline_id: 3, xlog_pos: Lsn::from_parts(0, 0x900) },
            history: vec![],
        };
        let mine = FixedProbe { identity: SystemIdentity { system_id: 9, timeline_id: 2, xlog_pos: Lsn::ZERO }, history: vec![] };
        assert!(!mine.check_node_can_follow(Lsn::from_parts(0, 0x100), &theirs).await.unwrap());
    }
}
