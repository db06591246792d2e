// src/config.rs

//! Parses the daemon's TOML configuration file into a typed [`Config`],
//! following the teacher's `WardenConfig` pattern: `serde`-derived structs,
//! `#[serde(default = "...")]` functions for optional keys, and
//! `humantime_serde` for any field expressed as a duration in the file.

use crate::core::error::{ClusterWardError, Result};
use crate::core::roles::RoleConfig;
use serde::Deserialize;
use std::time::Duration;
use tokio::fs;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FailoverMode {
    Automatic,
    Manual,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionCheckType {
    Ping,
    Query,
}

fn default_failover() -> FailoverMode {
    FailoverMode::Manual
}

fn default_priority() -> i32 {
    100
}

fn default_location() -> String {
    "default".to_string()
}

fn default_monitor_interval_secs() -> u64 {
    2
}

fn default_reconnect_attempts() -> u32 {
    6
}

fn default_reconnect_interval() -> Duration {
    Duration::from_secs(10)
}

fn default_primary_notification_timeout() -> Duration {
    Duration::from_secs(60)
}

fn default_election_rerun_interval() -> Duration {
    Duration::from_secs(15)
}

fn default_degraded_monitoring_timeout() -> Duration {
    Duration::from_secs(300)
}

fn default_child_nodes_check_interval() -> Duration {
    Duration::from_secs(5)
}

fn default_child_nodes_disconnect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_sibling_nodes_disconnect_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_repmgrd_standby_startup_timeout() -> Duration {
    Duration::from_secs(30)
}

fn default_log_status_interval() -> Duration {
    Duration::from_secs(300)
}

fn default_connection_check_type() -> ConnectionCheckType {
    ConnectionCheckType::Ping
}

fn default_status_listen_port() -> u16 {
    0
}

/// The full set of recognised configuration-file options. Fields with no
/// corresponding behaviour in the current role
/// loops are still parsed — an operator's existing config file should
/// never fail to load over an option this daemon doesn't yet act on —
/// and are called out as such in `DESIGN.md`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    pub node_id: i32,
    pub node_name: String,
    pub conninfo: String,
    pub repl_conninfo: String,
    pub upstream_node_id: Option<i32>,

    #[serde(default = "default_priority")]
    pub priority: i32,

    #[serde(default = "default_location")]
    pub location: String,

    #[serde(default = "default_failover")]
    pub failover: FailoverMode,

    pub promote_command: Option<String>,
    pub follow_command: Option<String>,
    pub service_promote_command: Option<String>,
    pub failover_validation_command: Option<String>,
    pub child_nodes_disconnect_command: Option<String>,
    pub repmgrd_service_start_command: Option<String>,
    pub repmgrd_service_stop_command: Option<String>,

    #[serde(default = "default_monitor_interval_secs")]
    pub monitor_interval_secs: u64,

    #[serde(default = "default_reconnect_attempts")]
    pub reconnect_attempts: u32,

    #[serde(with = "humantime_serde", default = "default_reconnect_interval")]
    pub reconnect_interval: Duration,

    #[serde(with = "humantime_serde", default = "default_primary_notification_timeout")]
    pub primary_notification_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_election_rerun_interval")]
    pub election_rerun_interval: Duration,

    #[serde(with = "humantime_serde", default)]
    pub failover_delay: Duration,

    #[serde(with = "humantime_serde", default)]
    pub promote_delay: Duration,

    #[serde(with = "humantime_serde", default = "default_degraded_monitoring_timeout")]
    pub degraded_monitoring_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_child_nodes_check_interval")]
    pub child_nodes_check_interval: Duration,

    pub child_nodes_connected_min_count: Option<usize>,
    pub child_nodes_disconnect_min_count: Option<usize>,

    #[serde(default)]
    pub child_nodes_connected_include_witness: bool,

    #[serde(with = "humantime_serde", default = "default_child_nodes_disconnect_timeout")]
    pub child_nodes_disconnect_timeout: Duration,

    #[serde(with = "humantime_serde", default = "default_child_nodes_check_interval")]
    pub witness_sync_interval: Duration,

    #[serde(default)]
    pub standby_disconnect_on_failover: bool,

    #[serde(with = "humantime_serde", default = "default_sibling_nodes_disconnect_timeout")]
    pub sibling_nodes_disconnect_timeout: Duration,

    #[serde(default)]
    pub primary_visibility_consensus: bool,

    #[serde(default)]
    pub always_promote: bool,

    /// Recognised but not acted on: no per-tick lag table exists in this
    /// implementation's data model (see `DESIGN.md`).
    #[serde(default)]
    pub monitoring_history: bool,

    #[serde(with = "humantime_serde", default = "default_log_status_interval")]
    pub log_status_interval: Duration,

    pub log_file: Option<String>,

    #[serde(default = "default_connection_check_type")]
    pub connection_check_type: ConnectionCheckType,

    #[serde(with = "humantime_serde", default = "default_repmgrd_standby_startup_timeout")]
    pub repmgrd_standby_startup_timeout: Duration,

    /// Recognised but not acted on: the teacher-grounded reconnect backoff
    /// in `supervisor::try_reconnect` always sleeps a fixed interval
    /// rather than aligning to wall-clock boundaries (see `DESIGN.md`).
    #[serde(default)]
    pub reconnect_loop_sync: bool,

    /// `[SUPPLEMENT]` port for the status listener; `0` disables it.
    #[serde(default = "default_status_listen_port")]
    pub status_listen_port: u16,
}

impl Config {
    pub async fn from_file(path: &str) -> Result<Self> {
        let content = fs::read_to_string(path).await.map_err(ClusterWardError::from)?;
        let config: Config = toml::from_str(&content)?;
        config.validate()?;
        Ok(config)
    }

    /// Fatal at startup, not during monitoring: under automatic failover
    /// both commands are required, since a candidate that wins an election
    /// with nothing to run it with can't do anything but sit in
    /// `PROMOTION_FAILED`.
    fn validate(&self) -> Result<()> {
        if self.failover == FailoverMode::Automatic {
            if self.promote_command.as_deref().unwrap_or("").is_empty() {
                return Err(ClusterWardError::FatalConfig(
                    "promote_command is required when failover = automatic".to_string(),
                ));
            }
            if self.follow_command.as_deref().unwrap_or("").is_empty() {
                return Err(ClusterWardError::FatalConfig(
                    "follow_command is required when failover = automatic".to_string(),
                ));
            }
        }
        Ok(())
    }

    pub fn manual_failover(&self) -> bool {
        self.failover == FailoverMode::Manual
    }

    /// Builds the subset every role loop shares, out of the flat file
    /// format operators write.
    pub fn role_config(&self) -> RoleConfig {
        RoleConfig {
            monitor_interval: Duration::from_secs(self.monitor_interval_secs),
            reconnect_attempts: self.reconnect_attempts,
            reconnect_interval: self.reconnect_interval,
            primary_notification_timeout: self.primary_notification_timeout,
            election_rerun_interval: self.election_rerun_interval,
            degraded_monitoring_timeout: self.degraded_monitoring_timeout,
            promote_command: self.promote_command.clone().unwrap_or_default(),
            follow_command: self.follow_command.clone().unwrap_or_default(),
            failover_validation_command: self.failover_validation_command.clone(),
            child_nodes_disconnect_command: self.child_nodes_disconnect_command.clone(),
            always_promote: self.always_promote,
            manual_failover: self.manual_failover(),
            primary_visibility_consensus: self.primary_visibility_consensus,
            standby_disconnect_on_failover: self.standby_disconnect_on_failover,
            sibling_nodes_disconnect_timeout: self.sibling_nodes_disconnect_timeout,
            repmgrd_standby_startup_timeout: self.repmgrd_standby_startup_timeout,
            child_nodes_check_interval: self.child_nodes_check_interval,
            child_nodes_connected_min_count: self.child_nodes_connected_min_count,
            child_nodes_disconnect_min_count: self.child_nodes_disconnect_min_count,
            child_nodes_disconnect_timeout: self.child_nodes_disconnect_timeout,
            child_nodes_connected_include_witness: self.child_nodes_connected_include_witness,
            witness_sync_interval: self.witness_sync_interval,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_toml() -> &'static str {
        r#"
            node_id = 1
            node_name = "node1"
            conninfo = "host=node1 dbname=clusterward"
            repl_conninfo = "host=node1 dbname=clusterward replication=database"
        "#
    }

    #[test]
    fn defaults_fill_in_unset_optional_fields() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert_eq!(config.priority, 100);
        assert_eq!(config.location, "default");
        assert_eq!(config.failover, FailoverMode::Manual);
        assert_eq!(config.monitor_interval_secs, 2);
        assert_eq!(config.degraded_monitoring_timeout, Duration::from_secs(300));
    }

    #[test]
    fn manual_failover_does_not_require_commands() {
        let config: Config = toml::from_str(minimal_toml()).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn automatic_failover_without_promote_command_is_fatal() {
        let toml_str = format!("{}\nfailover = \"automatic\"\n", minimal_toml());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn automatic_failover_with_both_commands_validates() {
        let toml_str = format!(
            "{}\nfailover = \"automatic\"\npromote_command = \"true\"\nfollow_command = \"true\"\n",
            minimal_toml()
        );
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn humantime_durations_parse_from_plain_strings() {
        let toml_str = format!("{}\nreconnect_interval = \"5s\"\n", minimal_toml());
        let config: Config = toml::from_str(&toml_str).unwrap();
        assert_eq!(config.reconnect_interval, Duration::from_secs(5));
    }
}
