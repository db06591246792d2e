// src/core/child_tracker.rs

//! The primary's in-memory child-node tracker: an owning, ordered sequence
//! rather than the pointer-linked list the design notes call out, since the
//! only operations needed are append, find-by-id, and remove-by-id.

use crate::core::metadata::NodeRole;
use chrono::{DateTime, Utc};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Attachment {
    Attached,
    Detached,
    Unknown,
}

#[derive(Debug, Clone)]
pub struct ChildEntry {
    pub node_id: i32,
    pub role: NodeRole,
    pub attached: Attachment,
    pub detached_at: Option<DateTime<Utc>>,
}

/// Seeded at primary startup from the replica-status view plus metadata;
/// each tick diffs that view against this list.
#[derive(Debug, Default)]
pub struct ChildTracker {
    children: Vec<ChildEntry>,
    /// Whether `child_nodes_disconnect_command` has already fired for the
    /// current below-threshold episode; cleared once the connected count
    /// recovers, so a second dip fires it again.
    disconnect_command_fired: bool,
}

/// What changed for one child during a tick's diff, driving the event-log
/// emission in the primary role loop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChildEvent {
    NewConnect,
    Reconnect,
    Disconnect,
}

impl ChildTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn seed(entries: Vec<ChildEntry>) -> Self {
        Self { children: entries, disconnect_command_fired: false }
    }

    pub fn find(&self, node_id: i32) -> Option<&ChildEntry> {
        self.children.iter().find(|c| c.node_id == node_id)
    }

    pub fn connected_count(&self, include_witness: bool) -> usize {
        self.children
            .iter()
            .filter(|c| c.attached == Attachment::Attached)
            .filter(|c| include_witness || c.role != NodeRole::Witness)
            .count()
    }

    /// `threshold = total_known - disconnect_min_count + 1`: the minimum
    /// connected count below which `child_nodes_disconnect_command` is
    /// eligible to fire.
    pub fn disconnect_threshold(&self, disconnect_min_count: usize) -> usize {
        self.children.len().saturating_sub(disconnect_min_count) + 1
    }

    /// True once every currently detached child has been detached for at
    /// least `timeout`; false if any detached child is still within the
    /// grace period, or if nothing is detached at all.
    pub fn all_detached_past(&self, timeout: chrono::Duration, now: DateTime<Utc>) -> bool {
        let detached: Vec<&ChildEntry> = self.children.iter().filter(|c| c.attached == Attachment::Detached).collect();
        !detached.is_empty()
            && detached.iter().all(|c| c.detached_at.map(|t| now - t >= timeout).unwrap_or(false))
    }

    pub fn disconnect_command_fired(&self) -> bool {
        self.disconnect_command_fired
    }

    pub fn set_disconnect_command_fired(&mut self, fired: bool) {
        self.disconnect_command_fired = fired;
    }

    pub fn len(&self) -> usize {
        self.children.len()
    }

    pub fn is_empty(&self) -> bool {
        self.children.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &ChildEntry> {
        self.children.iter()
    }

    /// Diffs `live_node_ids` (the replica-status view observed this tick)
    /// against the tracked list, mutating entries and returning the events
    /// that occurred, in the order encountered. Node ids no longer present
    /// in `known_nodes` are removed outright (they left the cluster, not
    /// just disconnected).
    pub fn reconcile(
        &mut self,
        live_node_ids: &[i32],
        known_nodes: &[(i32, NodeRole)],
        now: DateTime<Utc>,
    ) -> Vec<(i32, ChildEvent)> {
        let mut events = Vec::new();

        self.children.retain(|c| known_nodes.iter().any(|(id, _)| *id == c.node_id));

        for &(node_id, role) in known_nodes {
            let is_live = live_node_ids.contains(&node_id);
            match self.children.iter_mut().find(|c| c.node_id == node_id) {
                Some(entry) => match (entry.attached, is_live) {
                    (Attachment::Attached, false) => {
                        entry.attached = Attachment::Detached;
                        entry.detached_at = Some(now);
                        events.push((node_id, ChildEvent::Disconnect));
                    }
                    (Attachment::Detached, true) | (Attachment::Unknown, true) => {
                        entry.attached = Attachment::Attached;
                        entry.detached_at = None;
                        events.push((node_id, ChildEvent::Reconnect));
                    }
                    _ => {}
                },
                None => {
                    self.children.push(ChildEntry {
                        node_id,
                        role,
                        attached: if is_live { Attachment::Attached } else { Attachment::Unknown },
                        detached_at: if is_live { None } else { Some(now) },
                    });
                    if is_live {
                        events.push((node_id, ChildEvent::NewConnect));
                    }
                }
            }
        }

        events
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn known() -> Vec<(i32, NodeRole)> {
        vec![(2, NodeRole::Standby), (3, NodeRole::Standby)]
    }

    #[test]
    fn first_sighting_of_a_live_child_is_a_new_connect() {
        let mut tracker = ChildTracker::new();
        let events = tracker.reconcile(&[2, 3], &known(), Utc::now());
        assert_eq!(events.len(), 2);
        assert!(events.iter().all(|(_, e)| *e == ChildEvent::NewConnect));
        assert_eq!(tracker.connected_count(true), 2);
    }

    #[test]
    fn a_child_dropping_out_of_the_live_view_emits_disconnect() {
        let mut tracker = ChildTracker::new();
        tracker.reconcile(&[2, 3], &known(), Utc::now());
        let events = tracker.reconcile(&[3], &known(), Utc::now());
        assert_eq!(events, vec![(2, ChildEvent::Disconnect)]);
        assert_eq!(tracker.connected_count(true), 1);
    }

    #[test]
    fn a_child_coming_back_emits_reconnect() {
        let mut tracker = ChildTracker::new();
        tracker.reconcile(&[2, 3], &known(), Utc::now());
        tracker.reconcile(&[3], &known(), Utc::now());
        let events = tracker.reconcile(&[2, 3], &known(), Utc::now());
        assert_eq!(events, vec![(2, ChildEvent::Reconnect)]);
    }

    #[test]
    fn a_node_removed_from_the_registry_disappears_entirely() {
        let mut tracker = ChildTracker::new();
        tracker.reconcile(&[2, 3], &known(), Utc::now());
        tracker.reconcile(&[2, 3], &[(2, NodeRole::Standby)], Utc::now());
        assert_eq!(tracker.len(), 1);
        assert!(tracker.find(3).is_none());
    }

    #[test]
    fn disconnect_threshold_matches_s6_fixture() {
        let mut tracker = ChildTracker::new();
        tracker.reconcile(&[2, 3, 4], &[(2, NodeRole::Standby), (3, NodeRole::Standby), (4, NodeRole::Standby)], Utc::now());
        assert_eq!(tracker.disconnect_threshold(1), 3);
    }

    #[test]
    fn all_detached_past_is_false_within_the_grace_period() {
        let mut tracker = ChildTracker::new();
        let t0 = Utc::now();
        tracker.reconcile(&[2, 3], &known(), t0);
        tracker.reconcile(&[3], &known(), t0);
        assert!(!tracker.all_detached_past(chrono::Duration::seconds(10), t0 + chrono::Duration::seconds(1)));
        assert!(tracker.all_detached_past(chrono::Duration::seconds(10), t0 + chrono::Duration::seconds(11)));
    }

    #[test]
    fn all_detached_past_is_false_with_nothing_detached() {
        let tracker = ChildTracker::new();
        assert!(!tracker.all_detached_past(chrono::Duration::seconds(0), Utc::now()));
    }
}
