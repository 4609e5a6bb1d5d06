//! Affinity hooks called by the exchange for each kind of topology change.
//!
//! Every group keeps its assignment history in its [`AffinityCache`]; the
//! manager decides, per event, whether the next version carries the previous
//! assignment over, recomputes the ideal one, or needs the coordinator to
//! compute a data-aware assignment centrally.
//!
//! [`AffinityCache`]: super::AffinityCache

use std::collections::BTreeMap;
use std::sync::Arc;

use partex_core::{ExchangeId, TopologyVersion};
use tracing::{debug, info, warn};

use crate::cache::CacheRegistry;
use crate::cluster::{assignment_diff, preserve_owners, AssignmentChange, ClusterNode, DiscoCache};
use crate::partition::CacheGroup;

/// Drives per-group affinity through exchanges.
pub struct AffinityManager {
    registry: Arc<CacheRegistry>,
    late_affinity: bool,
}

impl AffinityManager {
    #[must_use]
    pub fn new(registry: Arc<CacheRegistry>, late_affinity: bool) -> Self {
        Self {
            registry,
            late_affinity,
        }
    }

    #[must_use]
    pub fn late_affinity(&self) -> bool {
        self.late_affinity
    }

    /// Cache start/stop: groups created by this exchange get the ideal
    /// assignment, every other group keeps the one it had.
    pub fn on_cache_change_request(&self, top_ver: TopologyVersion, disco: &DiscoCache, new_groups: &[i32]) {
        for group in self.registry.affinity_groups() {
            if new_groups.contains(&group.group_id()) || group.affinity().current().is_none() {
                self.init_ideal(&group, top_ver, disco);
            } else {
                carry_over(&group, top_ver);
            }
        }
    }

    /// Client join or leave: server membership is unchanged.
    pub fn on_client_event(&self, top_ver: TopologyVersion) {
        for group in self.registry.affinity_groups() {
            carry_over(&group, top_ver);
        }
    }

    /// Server join: every group moves to the ideal assignment of the new membership.
    pub fn on_server_join(&self, top_ver: TopologyVersion, disco: &DiscoCache) {
        for group in self.registry.affinity_groups() {
            self.init_ideal(&group, top_ver, disco);
        }
    }

    /// Server left or failed.
    ///
    /// Returns `true` when late affinity is on and some group has a partition
    /// whose every previous owner is gone; the coordinator then computes the
    /// final assignment once it knows where data survived. Until then each
    /// group runs a provisional assignment: the previous one with the departed
    /// node removed.
    pub fn on_server_left(&self, exch_id: &ExchangeId, disco: &DiscoCache) -> bool {
        let departed = exch_id.node_id.as_str();
        let mut centralized = false;

        for group in self.registry.affinity_groups() {
            let affinity = group.affinity();
            let ideal = affinity.calculate(disco.cache_affinity_nodes());
            if ideal.iter().all(Vec::is_empty) {
                warn!(grp = %group.name(), top_ver = %exch_id.topology_version, "cache group has no affinity nodes");
            }

            let previous = affinity.current();
            let orphaned = previous.as_ref().is_some_and(|prev| {
                prev.iter()
                    .any(|owners| !owners.is_empty() && owners.iter().all(|n| !disco.alive(n) || n == departed))
            });

            let assignment = match previous {
                Some(prev) if self.late_affinity && orphaned => {
                    centralized = true;
                    let provisional = prev
                        .iter()
                        .map(|owners| owners.iter().filter(|n| *n != departed).cloned().collect())
                        .collect();
                    Arc::new(provisional)
                }
                _ => ideal,
            };
            affinity.initialize(exch_id.topology_version, assignment);
            affinity.remove_node(departed);
        }

        if centralized {
            info!(exch_id = %exch_id, "server left with orphaned partitions, affinity will be assigned by coordinator");
        }
        centralized
    }

    /// Coordinator side of centralized affinity: keeps live OWNING holders as
    /// primaries where the ideal primary has no data. Returns, per group, the
    /// partitions whose owners differ from the provisional assignment.
    #[must_use]
    pub fn compute_centralized(&self, top_ver: TopologyVersion) -> AssignmentChange {
        let mut change = AssignmentChange::new();
        for topology in self.registry.topologies() {
            let affinity = topology.group().affinity();
            let ideal = affinity.ideal();
            let preserved = preserve_owners(&ideal, |p| topology.owners(p));
            let current = affinity.cached(top_ver).unwrap_or_else(|| Arc::clone(&ideal));
            let diff = assignment_diff(&current, &preserved);
            if !diff.is_empty() {
                debug!(grp = %topology.group().name(), changed = diff.len(), "computed centralized affinity");
                change.insert(topology.group_id(), diff);
            }
        }
        change
    }

    /// Applies an assignment change broadcast by the coordinator.
    pub fn on_change_affinity_message(&self, top_ver: TopologyVersion, change: &AssignmentChange) {
        let empty = BTreeMap::new();
        for group in self.registry.affinity_groups() {
            let parts = change.get(&group.group_id()).unwrap_or(&empty);
            group.affinity().apply_change(top_ver, parts);
        }
    }

    /// No coordinator is left to compute a centralized assignment: every
    /// group falls back to the ideal one over whatever servers remain.
    pub fn ideal_fallback(&self, top_ver: TopologyVersion, disco: &DiscoCache) {
        for group in self.registry.affinity_groups() {
            self.init_ideal(&group, top_ver, disco);
        }
    }

    /// Servers that left after `disco` was taken get no partitions.
    fn init_ideal(&self, group: &CacheGroup, top_ver: TopologyVersion, disco: &DiscoCache) {
        let nodes: Vec<ClusterNode> = disco
            .cache_affinity_nodes()
            .iter()
            .filter(|n| disco.alive(&n.id))
            .cloned()
            .collect();
        if nodes.is_empty() {
            warn!(grp = %group.name(), top_ver = %top_ver, "cache group has no affinity nodes");
        }
        let ideal = group.affinity().calculate(&nodes);
        group.affinity().initialize(top_ver, ideal);
    }
}

fn carry_over(group: &CacheGroup, top_ver: TopologyVersion) {
    let affinity = group.affinity();
    if let Some(current) = affinity.current() {
        affinity.initialize(top_ver, current);
    }
}

impl std::fmt::Debug for AffinityManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AffinityManager")
            .field("late_affinity", &self.late_affinity)
            .finish_non_exhaustive()
    }
}
