//! Per-group affinity history.
//!
//! Keeps the assignment in force at each recent topology version so that
//! `primary`/`backup` queries and the exchange can look up owners for a
//! specific version, plus the last ideal assignment computed from membership.

use std::collections::BTreeMap;
use std::sync::Arc;

use arc_swap::ArcSwap;
use parking_lot::RwLock;
use partex_core::TopologyVersion;

use crate::cluster::{ideal_assignment, Assignment, ClusterNode};

/// Versions kept before the oldest is dropped.
const HISTORY_SIZE: usize = 64;

/// Assignment history of one cache group.
pub struct AffinityCache {
    partitions: u32,
    backups: u32,
    history: RwLock<BTreeMap<TopologyVersion, Arc<Assignment>>>,
    ideal: ArcSwap<Assignment>,
}

impl AffinityCache {
    #[must_use]
    pub fn new(partitions: u32, backups: u32) -> Self {
        Self {
            partitions,
            backups,
            history: RwLock::new(BTreeMap::new()),
            ideal: ArcSwap::from_pointee(vec![Vec::new(); partitions as usize]),
        }
    }

    #[must_use]
    pub fn partitions(&self) -> u32 {
        self.partitions
    }

    #[must_use]
    pub fn backups(&self) -> u32 {
        self.backups
    }

    /// Computes and remembers the ideal assignment for `nodes`.
    pub fn calculate(&self, nodes: &[ClusterNode]) -> Arc<Assignment> {
        let ideal = Arc::new(ideal_assignment(nodes, self.partitions, self.backups));
        self.ideal.store(Arc::clone(&ideal));
        ideal
    }

    /// Last ideal assignment computed by [`calculate`](Self::calculate).
    #[must_use]
    pub fn ideal(&self) -> Arc<Assignment> {
        self.ideal.load_full()
    }

    /// Records the assignment in force at `top_ver`.
    pub fn initialize(&self, top_ver: TopologyVersion, assignment: Arc<Assignment>) {
        let mut history = self.history.write();
        history.insert(top_ver, assignment);
        while history.len() > HISTORY_SIZE {
            history.pop_first();
        }
    }

    /// Applies per-partition owner overrides on top of the assignment at
    /// `base` (or the ideal one) and records the result at `top_ver`.
    pub fn apply_change(
        &self,
        top_ver: TopologyVersion,
        change: &BTreeMap<u32, Vec<String>>,
    ) -> Arc<Assignment> {
        let mut assignment: Assignment = self
            .cached(top_ver)
            .map_or_else(|| self.ideal().as_ref().clone(), |a| a.as_ref().clone());
        for (part, owners) in change {
            if let Some(slot) = assignment.get_mut(*part as usize) {
                slot.clone_from(owners);
            }
        }
        let assignment = Arc::new(assignment);
        self.initialize(top_ver, Arc::clone(&assignment));
        assignment
    }

    /// Assignment in force at `top_ver`: the newest recorded version not after it.
    #[must_use]
    pub fn cached(&self, top_ver: TopologyVersion) -> Option<Arc<Assignment>> {
        self.history
            .read()
            .range(..=top_ver)
            .next_back()
            .map(|(_, a)| Arc::clone(a))
    }

    /// Latest recorded assignment.
    #[must_use]
    pub fn current(&self) -> Option<Arc<Assignment>> {
        self.history.read().values().next_back().cloned()
    }

    #[must_use]
    pub fn last_version(&self) -> TopologyVersion {
        self.history
            .read()
            .keys()
            .next_back()
            .copied()
            .unwrap_or(TopologyVersion::NONE)
    }

    /// Owners of `partition` at `top_ver`, primary first.
    #[must_use]
    pub fn owners(&self, top_ver: TopologyVersion, partition: u32) -> Vec<String> {
        self.cached(top_ver)
            .and_then(|a| a.get(partition as usize).cloned())
            .unwrap_or_default()
    }

    /// Forgets historical assignments that reference a departed node.
    /// The latest assignment is always kept.
    pub fn remove_node(&self, node_id: &str) {
        let mut history = self.history.write();
        let latest = history.keys().next_back().copied();
        history.retain(|ver, a| {
            Some(*ver) == latest || !a.iter().any(|owners| owners.iter().any(|n| n == node_id))
        });
    }
}

impl std::fmt::Debug for AffinityCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityCache")
            .field("partitions", &self.partitions)
            .field("backups", &self.backups)
            .field("last_version", &self.last_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn nodes(ids: &[&str]) -> Vec<ClusterNode> {
        ids.iter()
            .enumerate()
            .map(|(i, id)| ClusterNode::server(*id, i as u64 + 1))
            .collect()
    }

    #[test]
    fn cached_returns_newest_not_after_version() {
        let aff = AffinityCache::new(4, 0);
        let a1 = aff.calculate(&nodes(&["a"]));
        aff.initialize(TopologyVersion::new(1, 0), a1);
        let a3 = aff.calculate(&nodes(&["a", "b"]));
        aff.initialize(TopologyVersion::new(3, 0), a3);

        assert_eq!(aff.owners(TopologyVersion::new(2, 0), 1), vec!["a"]);
        assert_eq!(aff.owners(TopologyVersion::new(3, 0), 1), vec!["b"]);
        assert!(aff.cached(TopologyVersion::NONE).is_none());
        assert_eq!(aff.last_version(), TopologyVersion::new(3, 0));
    }

    #[test]
    fn apply_change_overrides_selected_partitions() {
        let aff = AffinityCache::new(3, 0);
        let base = aff.calculate(&nodes(&["a", "b", "c"]));
        aff.initialize(TopologyVersion::new(1, 0), base);
        let change = BTreeMap::from([(1, vec!["c".to_string()])]);
        let applied = aff.apply_change(TopologyVersion::new(2, 0), &change);
        assert_eq!(applied[0], vec!["a"]);
        assert_eq!(applied[1], vec!["c"]);
        assert_eq!(aff.owners(TopologyVersion::new(2, 0), 1), vec!["c"]);
    }

    #[test]
    fn history_is_bounded() {
        let aff = AffinityCache::new(1, 0);
        let a = aff.calculate(&nodes(&["a"]));
        for v in 0..(HISTORY_SIZE as u64 + 10) {
            aff.initialize(TopologyVersion::new(v + 1, 0), Arc::clone(&a));
        }
        assert!(aff.cached(TopologyVersion::new(1, 0)).is_none());
        assert!(aff.current().is_some());
    }
}
