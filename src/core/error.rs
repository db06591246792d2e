// src/core/error.rs

//! Defines the primary error type for the daemon.

use std::sync::Arc;
use thiserror::Error;

/// The main error enum, covering the taxonomy in the error-handling design:
/// transport, metadata, election, external-command, and fatal-config failures.
///
/// Using `thiserror` keeps the `From` conversions automatic, matching the
/// conventions of the teacher's `SpinelDBError`.
#[derive(Error, Debug, Clone)]
pub enum ClusterWardError {
    /// A peer (upstream, sibling, or witness) could not be reached at all,
    /// or a probe against it timed out.
    #[error("transport error reaching {node}: {message}")]
    Transport { node: String, message: String },

    /// A metadata read or write failed. Most metadata failures are logged
    /// and swallowed by the caller; this variant exists for the one write
    /// that is fatal (updating `upstream_node_id` after a successful follow).
    #[error("metadata error: {0}")]
    Metadata(String),

    /// An external command (`promote_command`, `follow_command`, ...)
    /// exited non-zero.
    #[error("external command `{command}` failed with status {status:?}: {stderr}")]
    ExternalCommand {
        command: String,
        status: Option<i32>,
        stderr: String,
    },

    /// Configuration is missing something required for the current mode
    /// (e.g. `promote_command` unset under automatic failover), or the
    /// local node record doesn't match what's on disk. These are fatal at
    /// startup.
    #[error("fatal configuration error: {0}")]
    FatalConfig(String),

    #[error("io error: {0}")]
    Io(Arc<std::io::Error>),

    #[error("config parse error: {0}")]
    ConfigParse(String),
}

impl From<std::io::Error> for ClusterWardError {
    fn from(e: std::io::Error) -> Self {
        Self::Io(Arc::new(e))
    }
}

impl From<tokio_postgres::Error> for ClusterWardError {
    fn from(e: tokio_postgres::Error) -> Self {
        Self::Transport {
            node: "unknown".to_string(),
            message: e.to_string(),
        }
    }
}

impl From<toml::de::Error> for ClusterWardError {
    fn from(e: toml::de::Error) -> Self {
        Self::ConfigParse(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, ClusterWardError>;
