// src/core/daemon.rs

//! The top-level orchestration `main` defers to: loads the local node's
//! record to decide which role loop to drive, wires the Postgres-backed
//! collaborators from `runtime`, owns the process-wide signal handling, and
//! maps the eventual error (if any) onto a stable process exit code.
//! Load config, build shared state, spawn the listener, run the monitor —
//! with the monitor itself swapped for whichever per-role loop this node
//! needs.

use crate::config::Config;
use crate::core::context::{GlobalFlags, LoopContext};
use crate::core::error::{ClusterWardError, Result};
use crate::core::metadata::postgres::PostgresMetadataGateway;
use crate::core::metadata::{MetadataGateway, NodeRole};
use crate::core::roles::{primary, standby, witness, RoleOutcome};
use crate::core::runtime::{PgConnection, PostgresRuntime};
use crate::core::status;
use std::sync::Arc;
use tracing::{error, info, warn};

/// Stable, small-integer process exit codes, distinct across releases so
/// a wrapping service manager can distinguish the reason the daemon quit.
#[repr(i32)]
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitCode {
    Success = 0,
    BadConfig = 1,
    DbConnection = 2,
    MonitoringTimeout = 3,
    ServiceError = 4,
}

/// Runs the daemon to completion (clean shutdown, or a fatal error) and
/// resolves the outcome to the process exit code `main` hands to the OS.
pub async fn run(config: Config) -> ExitCode {
    match run_inner(&config).await {
        Ok(()) => ExitCode::Success,
        Err(e) => {
            error!("daemon exiting: {}", e);
            exit_code_for(&e)
        }
    }
}

fn exit_code_for(e: &ClusterWardError) -> ExitCode {
    match e {
        ClusterWardError::Transport { .. } | ClusterWardError::Io(_) => ExitCode::DbConnection,
        ClusterWardError::FatalConfig(msg) if msg.contains("degraded monitoring timeout") => {
            ExitCode::MonitoringTimeout
        }
        ClusterWardError::FatalConfig(_) | ClusterWardError::ConfigParse(_) => ExitCode::BadConfig,
        ClusterWardError::Metadata(_) | ClusterWardError::ExternalCommand { .. } => ExitCode::ServiceError,
    }
}

async fn run_inner(config: &Config) -> Result<()> {
    // A unique run id for this process's lifetime, the same way the
    // teacher's Warden identifies itself to peers — logged here purely for
    // operators correlating log lines across a restart, since this daemon
    // has no peer-to-peer protocol of its own to carry it over.
    let mut run_id_bytes = [0u8; 10];
    if getrandom::fill(&mut run_id_bytes).is_ok() {
        info!("starting with run id {}", hex::encode(run_id_bytes));
    }

    let gateway = Arc::new(PostgresMetadataGateway::connect(&config.conninfo).await?);

    let mut node = gateway.get_node(config.node_id).await?.ok_or_else(|| {
        ClusterWardError::FatalConfig(format!(
            "node {} is not registered in clusterward.nodes",
            config.node_id
        ))
    })?;

    gateway.record_pid(config.node_id, std::process::id() as i32).await?;

    // The primary loop's startup requirement applies at daemon startup
    // regardless of which loop the local record currently names, since a
    // non-active node under automatic failover should never have started
    // monitoring at all.
    if !node.active {
        if config.manual_failover() {
            warn!("local node is marked inactive in metadata; monitoring anyway under manual failover");
        } else {
            return Err(ClusterWardError::FatalConfig(
                "local node is marked inactive in metadata under automatic failover".to_string(),
            ));
        }
    }

    let ctx = Arc::new(LoopContext::new(config.node_id));
    if let Ok(Some(primary_record)) = gateway.get_primary().await {
        ctx.with_state(|s| s.primary_node_id = Some(primary_record.node_id));
    }

    tokio::spawn(await_signals(ctx.flags.clone()));

    if config.status_listen_port != 0 {
        let status_ctx = ctx.clone();
        let port = config.status_listen_port;
        tokio::spawn(async move {
            if let Err(e) = status::run_listener(port, status_ctx).await {
                warn!("status listener exited: {}", e);
            }
        });
    }

    let role_config = config.role_config();

    // The primary loop can hand off into the standby loop mid-process (a
    // former primary rejoining after an external switchover); every other
    // transition ends the daemon.
    loop {
        match node.role {
            NodeRole::Primary => {
                let runtime =
                    PostgresRuntime::new(node.conninfo.clone(), node.repl_conninfo.clone(), gateway.clone()).await?;
                match primary::run(gateway.as_ref(), &runtime, &ctx, &role_config).await? {
                    RoleOutcome::ShuttingDown => return Ok(()),
                    RoleOutcome::RoleChanged => {
                        node = gateway.get_node(config.node_id).await?.ok_or_else(|| {
                            ClusterWardError::Metadata(format!(
                                "local node {} vanished from metadata after role change",
                                config.node_id
                            ))
                        })?;
                        continue;
                    }
                }
            }
            NodeRole::Standby => {
                let runtime =
                    PostgresRuntime::new(node.conninfo.clone(), node.repl_conninfo.clone(), gateway.clone()).await?;
                let upstream_id = node.upstream_node_id.ok_or_else(|| {
                    ClusterWardError::FatalConfig(format!("standby node {} has no configured upstream", node.node_id))
                })?;
                let upstream_node = gateway.get_node(upstream_id).await?.ok_or_else(|| {
                    ClusterWardError::Metadata(format!("upstream node {upstream_id} missing from metadata"))
                })?;
                let upstream_handle = PgConnection::connect(upstream_node.conninfo.clone()).await?;
                return standby::run(gateway.as_ref(), &upstream_handle, &runtime, &ctx, &role_config).await;
            }
            NodeRole::Witness => {
                let runtime =
                    PostgresRuntime::new(node.conninfo.clone(), node.repl_conninfo.clone(), gateway.clone()).await?;
                let primary_id = ctx.with_state(|s| s.primary_node_id).ok_or_else(|| {
                    ClusterWardError::FatalConfig("no primary recorded in metadata for witness to track".to_string())
                })?;
                let primary_node = gateway.get_node(primary_id).await?.ok_or_else(|| {
                    ClusterWardError::Metadata(format!("primary node {primary_id} missing from metadata"))
                })?;
                let primary_handle = PgConnection::connect(primary_node.conninfo.clone()).await?;
                return witness::run(gateway.as_ref(), &primary_handle, &runtime, &ctx, &role_config).await;
            }
        }
    }
}

/// SIGHUP reloads configuration (the role loops themselves reopen the
/// connection and re-read `RoleConfig` on the flag; see each loop's
/// `take_reload_requested` check); SIGINT/SIGTERM request a clean shutdown.
/// Mirrors the teacher's `await_shutdown_signal` in
/// `src/server/connection_loop.rs`, extended with SIGHUP since this daemon
/// (unlike the server) has a reload behavior distinct from shutdown.
#[cfg(unix)]
async fn await_signals(flags: Arc<GlobalFlags>) {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sighup = match signal(SignalKind::hangup()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGHUP handler: {}", e);
            return;
        }
    };
    let mut sigint = match signal(SignalKind::interrupt()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGINT handler: {}", e);
            return;
        }
    };
    let mut sigterm = match signal(SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            warn!("failed to install SIGTERM handler: {}", e);
            return;
        }
    };

    loop {
        tokio::select! {
            _ = sighup.recv() => {
                info!("SIGHUP received; configuration will reload on the next tick");
                flags.request_reload();
            }
            _ = sigint.recv() => {
                info!("SIGINT received; shutting down");
                flags.request_shutdown();
                return;
            }
            _ = sigterm.recv() => {
                info!("SIGTERM received; shutting down");
                flags.request_shutdown();
                return;
            }
        }
    }
}

#[cfg(windows)]
async fn await_signals(flags: Arc<GlobalFlags>) {
    if tokio::signal::ctrl_c().await.is_ok() {
        info!("Ctrl-C received; shutting down");
        flags.request_shutdown();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn transport_errors_map_to_db_connection_exit_code() {
        let e = ClusterWardError::Transport { node: "n1".to_string(), message: "refused".to_string() };
        assert_eq!(exit_code_for(&e), ExitCode::DbConnection);
    }

    #[test]
    fn degraded_timeout_message_maps_to_monitoring_timeout_exit_code() {
        let e = ClusterWardError::FatalConfig("degraded monitoring timeout exceeded".to_string());
        assert_eq!(exit_code_for(&e), ExitCode::MonitoringTimeout);
    }

    #[test]
    fn other_fatal_config_maps_to_bad_config_exit_code() {
        let e = ClusterWardError::FatalConfig("promote_command is required".to_string());
        assert_eq!(exit_code_for(&e), ExitCode::BadConfig);
    }

    #[test]
    fn external_command_failure_maps_to_service_error_exit_code() {
        let e = ClusterWardError::ExternalCommand { command: "x".to_string(), status: Some(1), stderr: String::new() };
        assert_eq!(exit_code_for(&e), ExitCode::ServiceError);
    }
}
