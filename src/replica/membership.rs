use crate::commitlog::Index;
use std::collections::BTreeSet;
use std::fmt;

/// ReplicaId uniquely names a replica within the cluster. It is the only addressing handle
/// the core uses; the transport resolves it to an actual endpoint.
#[derive(Clone, Hash, Eq, PartialEq, Ord, PartialOrd)]
pub struct ReplicaId(String);

impl ReplicaId {
    pub fn new<S: Into<String>>(id: S) -> Self {
        ReplicaId(id.into())
    }

    pub fn into_inner(self) -> String {
        self.0
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for ReplicaId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// MembershipTracker owns the cluster configuration as this replica currently knows it: the
/// member set, quorum math, and the at-most-one in-flight configuration change.
///
/// The member set changes only when a configuration entry is *applied* (i.e. committed), so
/// quorum overlap between the old and new configurations holds during the transition. The
/// pending marker is set as soon as a configuration entry lands in the log, cleared when the
/// entry applies or is truncated away by a conflicting leader.
pub struct MembershipTracker {
    my_replica_id: ReplicaId,
    members: BTreeSet<ReplicaId>,
    pending_config_index: Option<Index>,
}

impl MembershipTracker {
    pub fn new(my_replica_id: ReplicaId, members: impl IntoIterator<Item = ReplicaId>) -> Self {
        let members: BTreeSet<ReplicaId> = members.into_iter().collect();
        assert!(!members.is_empty(), "cluster must have at least one member");

        MembershipTracker {
            my_replica_id,
            members,
            pending_config_index: None,
        }
    }

    pub fn my_replica_id(&self) -> &ReplicaId {
        &self.my_replica_id
    }

    pub fn is_member(&self, id: &ReplicaId) -> bool {
        self.members.contains(id)
    }

    pub fn is_self_member(&self) -> bool {
        self.members.contains(&self.my_replica_id)
    }

    /// All members except this replica.
    pub fn peer_ids(&self) -> Vec<ReplicaId> {
        self.members
            .iter()
            .filter(|id| **id != self.my_replica_id)
            .cloned()
            .collect()
    }

    pub fn member_ids(&self) -> Vec<ReplicaId> {
        self.members.iter().cloned().collect()
    }

    pub fn num_members(&self) -> usize {
        self.members.len()
    }

    /// floor(N/2) + 1 of the current configuration.
    pub fn quorum_size(&self) -> usize {
        self.members.len() / 2 + 1
    }

    pub fn change_pending(&self) -> bool {
        self.pending_config_index.is_some()
    }

    pub fn mark_change_pending(&mut self, config_entry_index: Index) {
        self.pending_config_index = Some(config_entry_index);
    }

    /// Called after applying the entry at `applied_index`.
    pub fn clear_pending_if_applied(&mut self, applied_index: Index) {
        if let Some(pending) = self.pending_config_index {
            if pending <= applied_index {
                self.pending_config_index = None;
            }
        }
    }

    /// Called after truncating the log suffix starting at `truncate_from`. An in-flight
    /// change whose entry was truncated away is no longer in flight.
    pub fn clear_pending_if_truncated(&mut self, truncate_from: Index) {
        if let Some(pending) = self.pending_config_index {
            if pending >= truncate_from {
                self.pending_config_index = None;
            }
        }
    }

    /// Returns true if the member was not already present.
    pub fn apply_add(&mut self, id: ReplicaId) -> bool {
        self.members.insert(id)
    }

    /// Returns true if the member was present.
    pub fn apply_remove(&mut self, id: &ReplicaId) -> bool {
        self.members.remove(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn tracker(size: usize) -> MembershipTracker {
        let members = (1..=size).map(|i| ReplicaId::new(format!("replica-{}", i)));
        MembershipTracker::new(ReplicaId::new("replica-1"), members)
    }

    #[test]
    fn quorum_size_per_cluster_size() {
        assert_eq!(tracker(1).quorum_size(), 1);
        assert_eq!(tracker(2).quorum_size(), 2);
        assert_eq!(tracker(3).quorum_size(), 2);
        assert_eq!(tracker(4).quorum_size(), 3);
        assert_eq!(tracker(5).quorum_size(), 3);
        assert_eq!(tracker(6).quorum_size(), 4);
        assert_eq!(tracker(7).quorum_size(), 4);
    }

    #[test]
    fn peer_ids_exclude_self() {
        let tracker = tracker(3);

        let peers = tracker.peer_ids();

        assert_eq!(peers.len(), 2);
        assert!(!peers.contains(tracker.my_replica_id()));
    }

    #[test]
    fn add_then_remove_member() {
        let mut tracker = tracker(3);

        assert!(tracker.apply_add(ReplicaId::new("replica-4")));
        assert_eq!(tracker.num_members(), 4);
        assert_eq!(tracker.quorum_size(), 3);

        // Adding again reports no change.
        assert!(!tracker.apply_add(ReplicaId::new("replica-4")));

        assert!(tracker.apply_remove(&ReplicaId::new("replica-4")));
        assert_eq!(tracker.num_members(), 3);
        assert_eq!(tracker.quorum_size(), 2);
    }

    #[test]
    fn pending_change_clears_on_apply() {
        let mut tracker = tracker(3);
        assert!(!tracker.change_pending());

        tracker.mark_change_pending(Index::new(5));
        assert!(tracker.change_pending());

        // Applying an earlier entry leaves the change pending.
        tracker.clear_pending_if_applied(Index::new(4));
        assert!(tracker.change_pending());

        tracker.clear_pending_if_applied(Index::new(5));
        assert!(!tracker.change_pending());
    }

    #[test]
    fn pending_change_clears_on_conflicting_truncation() {
        let mut tracker = tracker(3);
        tracker.mark_change_pending(Index::new(5));

        // Truncating after the entry leaves it in flight.
        tracker.clear_pending_if_truncated(Index::new(6));
        assert!(tracker.change_pending());

        tracker.clear_pending_if_truncated(Index::new(5));
        assert!(!tracker.change_pending());
    }

    #[test]
    fn removed_self_is_no_longer_member() {
        let mut tracker = tracker(3);
        assert!(tracker.is_self_member());

        let self_id = tracker.my_replica_id().clone();
        tracker.apply_remove(&self_id);

        assert!(!tracker.is_self_member());
        assert_eq!(tracker.num_members(), 2);
    }
}
