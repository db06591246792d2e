// src/core/commands.rs

//! Invocation of administrator-supplied external commands (`promote_command`,
//! `follow_command`, `failover_validation_command`,
//! `child_nodes_disconnect_command`, ...). The daemon treats these as opaque
//! shell processes and only observes their exit code.

use crate::core::error::{ClusterWardError, Result};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{info, warn};

/// The substitution values available to a command template. Which fields
/// apply depends on the call site; unused fields are simply never matched.
#[derive(Debug, Clone, Default)]
pub struct Placeholders {
    /// `%n` — the target node id.
    pub node_id: Option<i32>,
    /// `%a` — the target node's conninfo/endpoint.
    pub conninfo: Option<String>,
    /// `%v` — this node's last observed WAL receive LSN.
    pub last_wal_receive_lsn: Option<String>,
    /// `%u` — the upstream node id this node currently follows.
    pub upstream_node_id: Option<i32>,
    /// `%t` — the failed/target node's location tag.
    pub location: Option<String>,
    /// `%p` — the reporting primary's node id (child-disconnect command only).
    pub primary_node_id: Option<i32>,
}

/// Expands `%`-placeholders in `template`. An unrecognised `%x` sequence is
/// passed through verbatim, including the `%` itself.
pub fn expand(template: &str, placeholders: &Placeholders) -> String {
    let mut out = String::with_capacity(template.len());
    let mut chars = template.chars().peekable();

    while let Some(c) = chars.next() {
        if c != '%' {
            out.push(c);
            continue;
        }
        match chars.peek() {
            Some('n') => {
                chars.next();
                out.push_str(&placeholders.node_id.map(|v| v.to_string()).unwrap_or_default());
            }
            Some('a') => {
                chars.next();
                out.push_str(placeholders.conninfo.as_deref().unwrap_or(""));
            }
            Some('v') => {
                chars.next();
                out.push_str(placeholders.last_wal_receive_lsn.as_deref().unwrap_or(""));
            }
            Some('u') => {
                chars.next();
                out.push_str(
                    &placeholders
                        .upstream_node_id
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            Some('t') => {
                chars.next();
                out.push_str(placeholders.location.as_deref().unwrap_or(""));
            }
            Some('p') => {
                chars.next();
                out.push_str(
                    &placeholders
                        .primary_node_id
                        .map(|v| v.to_string())
                        .unwrap_or_default(),
                );
            }
            _ => out.push('%'),
        }
    }

    out
}

/// Runs `template` (after placeholder expansion) through `/bin/sh -c`,
/// capturing stderr best-effort for the error path. `Ok(())` iff the
/// process exited with status 0.
pub async fn run(template: &str, placeholders: &Placeholders) -> Result<()> {
    let expanded = expand(template, placeholders);
    info!("executing external command: {}", expanded);

    let output = Command::new("/bin/sh")
        .arg("-c")
        .arg(&expanded)
        .stdin(Stdio::null())
        .output()
        .await?;

    if output.status.success() {
        return Ok(());
    }

    let stderr = String::from_utf8_lossy(&output.stderr).into_owned();
    warn!(
        "external command `{}` exited with {:?}: {}",
        expanded,
        output.status.code(),
        stderr
    );
    Err(ClusterWardError::ExternalCommand {
        command: expanded,
        status: output.status.code(),
        stderr,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn substitutes_known_placeholders() {
        let p = Placeholders {
            node_id: Some(3),
            conninfo: Some("host=n3".to_string()),
            ..Default::default()
        };
        assert_eq!(expand("follow --node %n --conn '%a'", &p), "follow --node 3 --conn 'host=n3'");
    }

    #[test]
    fn passes_through_unknown_sequences_verbatim() {
        let p = Placeholders::default();
        assert_eq!(expand("echo 100%% done %z", &p), "echo 100%% done %z");
    }

    #[test]
    fn missing_placeholder_value_expands_to_empty_string() {
        let p = Placeholders::default();
        assert_eq!(expand("id=%n", &p), "id=");
    }
}
