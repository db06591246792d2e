// src/core/supervisor.rs

//! The connection supervisor (C1): liveness probing, bounded reconnect, and
//! the degraded-monitoring timer. Operates purely on the `conninfo` string
//! and a factory for opening fresh handles — it never interprets
//! replication state, that's C3's job.

use crate::core::metadata::{MetadataGateway, NewPrimaryNotification};
use async_trait::async_trait;
use std::time::Duration;
use tokio::time::{sleep, Instant};
use tracing::{debug, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Liveness {
    Ok,
    Down,
    Unknown,
}

/// What a bounded reconnect attempt against a dead upstream discovered:
/// either it gave up counting attempts, or it was short-circuited by a
/// "new primary" notification that arrived while waiting.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconnectOutcome {
    Reconnected,
    NewPrimary(i32),
    Rerun,
    Down,
}

pub struct ReconnectPolicy {
    pub attempts: u32,
    pub interval: Duration,
}

/// The side the supervisor cannot own itself: opening and pinging a
/// concrete connection handle. Kept as a trait so C1's retry/backoff logic
/// is unit-testable against a scripted fake.
#[async_trait]
pub trait ConnectionHandle: Send + Sync {
    /// Cheap transport-level probe (`SELECT 1` with a short statement
    /// timeout), not a replication-state query.
    async fn ping(&self) -> Liveness;

    /// Closes (if needed) and reopens the underlying connection.
    async fn reopen(&self) -> bool;
}

/// `ensure`: reuse the handle if a cheap probe succeeds, otherwise attempt
/// one reopen.
pub async fn ensure(handle: &dyn ConnectionHandle) -> Liveness {
    match handle.ping().await {
        Liveness::Ok => Liveness::Ok,
        _ => {
            if handle.reopen().await {
                handle.ping().await
            } else {
                Liveness::Down
            }
        }
    }
}

/// `try_reconnect`: retries `policy.attempts` times spaced by
/// `policy.interval`, polling the node's own "new primary notification"
/// slot between tries so a standby reconnecting to a dead primary can
/// short-circuit once the cluster has already elected a winner.
pub async fn try_reconnect<G: MetadataGateway + ?Sized>(
    handle: &dyn ConnectionHandle,
    gateway: &G,
    local_node_id: i32,
    policy: &ReconnectPolicy,
) -> ReconnectOutcome {
    for attempt in 1..=policy.attempts {
        if matches!(handle.ping().await, Liveness::Ok) {
            return ReconnectOutcome::Reconnected;
        }

        debug!("reconnect attempt {}/{} failed", attempt, policy.attempts);

        if handle.reopen().await && matches!(handle.ping().await, Liveness::Ok) {
            return ReconnectOutcome::Reconnected;
        }

        if attempt == policy.attempts {
            break;
        }

        let wait_until = Instant::now() + policy.interval;
        loop {
            match gateway.read_new_primary_notification(local_node_id).await {
                Ok(Some(NewPrimaryNotification::Node(id))) => return ReconnectOutcome::NewPrimary(id),
                Ok(Some(NewPrimaryNotification::Rerun)) => return ReconnectOutcome::Rerun,
                _ => {}
            }
            if Instant::now() >= wait_until {
                break;
            }
            sleep(Duration::from_millis(200).min(policy.interval)).await;
        }
    }

    warn!("reconnect exhausted after {} attempts; marking peer down", policy.attempts);
    ReconnectOutcome::Down
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::error::Result;
    use crate::core::metadata::{EventKind, NodeRecord, NodeStatus, VotingRow};
    use std::sync::atomic::{AtomicU32, Ordering};

    struct ScriptedHandle {
        ping_results: Vec<Liveness>,
        calls: AtomicU32,
    }

    #[async_trait]
    impl ConnectionHandle for ScriptedHandle {
        async fn ping(&self) -> Liveness {
            let i = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
            *self.ping_results.get(i).unwrap_or(&Liveness::Down)
        }
        async fn reopen(&self) -> bool {
            false
        }
    }

    struct NotifyingGateway {
        notification: Option<NewPrimaryNotification>,
    }

    #[async_trait]
    impl MetadataGateway for NotifyingGateway {
        async fn get_node(&self, _: i32) -> Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn get_primary(&self) -> Result<Option<NodeRecord>> {
            unimplemented!()
        }
        async fn list_active_siblings(&self, _: i32, _: i32) -> Result<Vec<NodeRecord>> {
            unimplemented!()
        }
        async fn list_child_nodes(&self, _: i32) -> Result<Vec<NodeRecord>> {
            unimplemented!()
        }
        async fn replace_nodes(&self, _: Vec<NodeRecord>) -> Result<()> {
            unimplemented!()
        }
        async fn set_active(&self, _: i32, _: bool) -> Result<()> {
            unimplemented!()
        }
        async fn set_upstream(&self, _: i32, _: Option<i32>) -> Result<()> {
            unimplemented!()
        }
        async fn mark_primary(&self, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn read_term(&self, _: i32) -> Result<VotingRow> {
            unimplemented!()
        }
        async fn increment_term(&self, _: i32) -> Result<i64> {
            unimplemented!()
        }
        async fn mark_vote_initiated(&self, _: i32, _: i64) -> Result<bool> {
            unimplemented!()
        }
        async fn reset_voting(&self, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn publish_new_primary_notification(&self, _: i32, _: Option<NewPrimaryNotification>) -> Result<()> {
            unimplemented!()
        }
        async fn read_new_primary_notification(&self, _: i32) -> Result<Option<NewPrimaryNotification>> {
            Ok(self.notification)
        }
        async fn read_node_status(&self, _: i32) -> Result<Option<NodeStatus>> {
            unimplemented!()
        }
        async fn record_pid(&self, _: i32, _: i32) -> Result<()> {
            unimplemented!()
        }
        async fn record_upstream_last_seen(&self, _: i32, _: Option<i32>, _: f64) -> Result<()> {
            unimplemented!()
        }
        async fn append_event(&self, _: Option<i32>, _: EventKind, _: bool, _: &str) -> Result<()> {
            unimplemented!()
        }
    }

    #[tokio::test]
    async fn ensure_reuses_a_live_handle_without_reopening() {
        let handle = ScriptedHandle { ping_results: vec![Liveness::Ok], calls: AtomicU32::new(0) };
        assert_eq!(ensure(&handle).await, Liveness::Ok);
    }

    #[tokio::test]
    async fn reconnect_short_circuits_on_new_primary_notification() {
        let handle = ScriptedHandle {
            ping_results: vec![Liveness::Down, Liveness::Down],
            calls: AtomicU32::new(0),
        };
        let gateway = NotifyingGateway { notification: Some(NewPrimaryNotification::Node(3)) };
        let policy = ReconnectPolicy { attempts: 5, interval: Duration::from_millis(50) };
        let outcome = try_reconnect(&handle, &gateway, 2, &policy).await;
        assert_eq!(outcome, ReconnectOutcome::NewPrimary(3));
    }

    #[tokio::test]
    async fn reconnect_exhausts_to_down_with_no_notification() {
        let handle = ScriptedHandle { ping_results: vec![], calls: AtomicU32::new(0) };
        let gateway = NotifyingGateway { notification: None };
        let policy = ReconnectPolicy { attempts: 2, interval: Duration::from_millis(10) };
        let outcome = try_reconnect(&handle, &gateway, 2, &policy).await;
        assert_eq!(outcome, ReconnectOutcome::Down);
    }
}
