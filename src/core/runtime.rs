// src/core/runtime.rs

//! `[AMBIENT]` Wires the trait-based collaborators (C1/C3's `ConnectionHandle`
//! and `ReplicationProbe`, C5's `FailoverCollaborators`, and each role loop's
//! own collaborator trait) to real `tokio_postgres` connections. Kept
//! separate from `metadata::postgres` and `probe` themselves so those two
//! stay unit-testable in isolation; this module is the part that actually
//! owns sockets.

use crate::core::election::SiblingView;
use crate::core::error::{ClusterWardError, Result};
use crate::core::failover::FailoverCollaborators;
use crate::core::lsn::Lsn;
use crate::core::metadata::postgres::{PostgresMetadataGateway, NODE_COLUMNS};
use crate::core::metadata::{MetadataGateway, NodeRecord};
use crate::core::probe::{PostgresProbe, RecoveryType, ReplicationProbe};
use crate::core::roles::primary::PrimaryCollaborators;
use crate::core::roles::standby::StandbyCollaborators;
use crate::core::roles::witness::WitnessCollaborators;
use crate::core::supervisor::{ConnectionHandle, Liveness};
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::Mutex;
use tokio_postgres::{Client, NoTls};
use tracing::warn;

/// A single replaceable connection to one cluster member's `conninfo`.
/// `reopen` drops and replaces the client; callers hold the lock across
/// the query they issue so a concurrent `ping`/`reopen` never observes a
/// half-replaced client.
pub struct PgConnection {
    conninfo: String,
    inner: Mutex<Option<Client>>,
}

impl PgConnection {
    pub fn new(conninfo: impl Into<String>) -> Self {
        Self { conninfo: conninfo.into(), inner: Mutex::new(None) }
    }

    pub async fn connect(conninfo: impl Into<String>) -> Result<Self> {
        let handle = Self::new(conninfo);
        if !handle.reopen().await {
            return Err(ClusterWardError::Transport {
                node: handle.conninfo.clone(),
                message: "initial connection failed".to_string(),
            });
        }
        Ok(handle)
    }

    pub async fn lock(&self) -> tokio::sync::MutexGuard<'_, Option<Client>> {
        self.inner.lock().await
    }

    async fn open(conninfo: &str) -> Result<Client> {
        let (client, connection) = tokio_postgres::connect(conninfo, NoTls).await.map_err(|e| {
            ClusterWardError::Transport { node: conninfo.to_string(), message: e.to_string() }
        })?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                warn!("connection driver exited: {}", e);
            }
        });
        Ok(client)
    }
}

#[async_trait]
impl ConnectionHandle for PgConnection {
    async fn ping(&self) -> Liveness {
        let mut guard = self.inner.lock().await;
        let Some(client) = guard.as_ref() else {
            return Liveness::Down;
        };
        match tokio::time::timeout(crate::core::probe::PING_TIMEOUT, client.simple_query("SELECT 1")).await {
            Ok(Ok(_)) => Liveness::Ok,
            Ok(Err(_)) => {
                *guard = None;
                Liveness::Down
            }
            Err(_) => Liveness::Unknown,
        }
    }

    async fn reopen(&self) -> bool {
        let mut guard = self.inner.lock().await;
        match Self::open(&self.conninfo).await {
            Ok(client) => {
                *guard = Some(client);
                true
            }
            Err(e) => {
                warn!("reopen of {} failed: {}", self.conninfo, e);
                false
            }
        }
    }
}

/// Opens a short-lived plain connection for a one-off probe (an election
/// sibling scan, a "is the former primary still primary" check). The
/// spawned driver task is aborted once the caller is done with `client` —
/// callers open, use, and drop these within a single function body.
async fn open_short_lived(conninfo: &str) -> Result<(Client, tokio::task::JoinHandle<()>)> {
    let (client, connection) = tokio_postgres::connect(conninfo, NoTls)
        .await
        .map_err(|e| ClusterWardError::Transport { node: conninfo.to_string(), message: e.to_string() })?;
    let driver = tokio::spawn(connection);
    Ok((client, driver))
}

async fn probe_recovery_type(conninfo: &str) -> Result<RecoveryType> {
    let (client, driver) = open_short_lived(conninfo).await?;
    let result = PostgresProbe::new(&client).recovery_type().await;
    driver.abort();
    result
}

/// Opens a connection with `replication=database` set in `repl_conninfo`,
/// for the `IDENTIFY_SYSTEM`/`TIMELINE_HISTORY` protocol commands.
async fn open_replication(repl_conninfo: &str) -> Result<(Client, tokio::task::JoinHandle<()>)> {
    open_short_lived(repl_conninfo).await
}

/// The production collaborator bundle for a role loop: owns the local
/// node's persistent connection, a handle to the shared metadata gateway
/// (for the sibling-status lookups the election scan needs), and knows how
/// to open short-lived connections to siblings and candidate upstreams for
/// the checks the state machine needs.
pub struct PostgresRuntime<G: MetadataGateway + ?Sized> {
    pub local: PgConnection,
    pub local_conninfo: String,
    pub local_repl_conninfo: String,
    pub gateway: Arc<G>,
}

impl<G: MetadataGateway + ?Sized> PostgresRuntime<G> {
    pub async fn new(conninfo: String, repl_conninfo: String, gateway: Arc<G>) -> Result<Self> {
        let local = PgConnection::connect(conninfo.clone()).await?;
        Ok(Self { local, local_conninfo: conninfo, local_repl_conninfo: repl_conninfo, gateway })
    }

    async fn local_current_lsn(&self) -> Result<Lsn> {
        let guard = self.local.lock().await;
        let client = guard.as_ref().ok_or_else(|| ClusterWardError::Transport {
            node: self.local_conninfo.clone(),
            message: "no local connection".to_string(),
        })?;
        PostgresProbe::new(client).replication_info().await.map(|i| i.receive_lsn.unwrap_or(Lsn::ZERO))
    }
}

#[async_trait]
impl<G: MetadataGateway + ?Sized> FailoverCollaborators for PostgresRuntime<G> {
    async fn verify_local_is_primary(&self) -> bool {
        let guard = self.local.lock().await;
        match guard.as_ref() {
            Some(client) => matches!(PostgresProbe::new(client).recovery_type().await, Ok(RecoveryType::Primary)),
            None => false,
        }
    }

    async fn probe_still_primary(&self, candidate: &NodeRecord) -> bool {
        matches!(probe_recovery_type(&candidate.conninfo).await, Ok(RecoveryType::Primary))
    }

    async fn check_can_follow(&self, target: &NodeRecord) -> bool {
        let local_lsn = match self.local_current_lsn().await {
            Ok(lsn) => lsn,
            Err(_) => return false,
        };
        let (local_repl, local_handle) = match open_replication(&self.local_repl_conninfo).await {
            Ok(pair) => pair,
            Err(_) => return false,
        };
        let (target_repl, target_handle) = match open_replication(&target.repl_conninfo).await {
            Ok(pair) => pair,
            Err(_) => {
                local_handle.abort();
                return false;
            }
        };
        let local_probe = PostgresProbe::with_replication(&local_repl, &local_repl);
        let target_probe = PostgresProbe::with_replication(&target_repl, &target_repl);
        let result = local_probe.check_node_can_follow(local_lsn, &target_probe).await.unwrap_or(false);
        local_handle.abort();
        target_handle.abort();
        result
    }

    async fn wait_for_local_reconnect(&self, timeout: Duration) -> bool {
        let deadline = tokio::time::Instant::now() + timeout;
        loop {
            if self.local.reopen().await && matches!(self.local.ping().await, Liveness::Ok) {
                return true;
            }
            if tokio::time::Instant::now() >= deadline {
                return false;
            }
            tokio::time::sleep(Duration::from_millis(500).min(timeout)).await;
        }
    }
}

#[async_trait]
impl<G: MetadataGateway + ?Sized> StandbyCollaborators for PostgresRuntime<G> {
    async fn local_last_wal_receive_lsn(&self) -> Lsn {
        self.local_current_lsn().await.unwrap_or(Lsn::ZERO)
    }

    async fn build_sibling_view(&self, sibling: &NodeRecord) -> Option<SiblingView> {
        let status = self.gateway.read_node_status(sibling.node_id).await.ok().flatten();
        let Some(status) = status else {
            // No ephemeral status row means no live daemon on that node;
            // it cannot vote or be notified.
            return None;
        };
        if status.pid.is_none() {
            return None;
        }

        let (client, driver) = open_short_lived(&sibling.conninfo).await.ok()?;
        let probe_result: Result<(RecoveryType, Lsn)> = async {
            let probe = PostgresProbe::new(&client);
            let recovery = probe.recovery_type().await?;
            let lsn = match recovery {
                RecoveryType::Standby => {
                    let info = probe.replication_info().await?;
                    if info.wal_replay_paused {
                        warn!("sibling {} has WAL replay paused", sibling.node_id);
                    }
                    info.receive_lsn.unwrap_or(Lsn::ZERO)
                }
                RecoveryType::Primary => probe.primary_current_lsn().await?,
            };
            Ok((recovery, lsn))
        }
        .await;
        driver.abort();
        let (recovery, lsn) = probe_result.ok()?;

        Some(SiblingView {
            node: sibling.clone(),
            last_wal_receive_lsn: lsn,
            in_recovery: recovery == RecoveryType::Standby,
            observed_upstream_id: status.last_observed_upstream_id,
            upstream_last_seen_seconds_ago: status.upstream_last_seen_seconds_ago,
            daemon_pid_present: true,
        })
    }

    async fn can_follow(&self, sibling: &NodeRecord) -> bool {
        self.check_can_follow(sibling).await
    }
}

#[async_trait]
impl<G: MetadataGateway + ?Sized> PrimaryCollaborators for PostgresRuntime<G> {
    async fn connected_child_node_ids(&self) -> Result<Vec<i32>> {
        // Child standbys connect with `application_name` set to their own
        // node id, the way the teacher's cluster nodes identify themselves
        // to `pg_stat_replication`.
        let guard = self.local.lock().await;
        let client = guard.as_ref().ok_or_else(|| ClusterWardError::Transport {
            node: self.local_conninfo.clone(),
            message: "no local connection".to_string(),
        })?;
        let rows = client
            .query("SELECT application_name FROM pg_stat_replication", &[])
            .await
            .map_err(|e| ClusterWardError::Transport { node: self.local_conninfo.clone(), message: e.to_string() })?;
        Ok(rows
            .iter()
            .filter_map(|row| row.try_get::<_, String>(0).ok())
            .filter_map(|name| name.parse::<i32>().ok())
            .collect())
    }

    async fn still_primary(&self) -> bool {
        self.verify_local_is_primary().await
    }
}

#[async_trait]
impl<G: MetadataGateway + ?Sized> WitnessCollaborators for PostgresRuntime<G> {
    async fn sync_from(&self, primary_id: i32) -> bool {
        let Ok(Some(primary)) = self.gateway.get_node(primary_id).await else {
            return false;
        };
        let Ok((client, driver)) = open_short_lived(&primary.conninfo).await else {
            return false;
        };
        let rows = client.query(&format!("SELECT {NODE_COLUMNS} FROM clusterward.nodes"), &[]).await;
        driver.abort();
        let Ok(rows) = rows else {
            return false;
        };
        let Ok(parsed) = rows.iter().map(PostgresMetadataGateway::row_to_node).collect::<Result<Vec<NodeRecord>>>()
        else {
            return false;
        };

        self.gateway.replace_nodes(parsed).await.is_ok()
    }
}
