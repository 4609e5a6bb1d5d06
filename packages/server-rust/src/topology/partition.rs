//! Partition topology of a cache group hosted on the local node.
//!
//! Tracks the local partitions of the group together with the last known
//! partition map of every node, and applies exchange results to both:
//! creates affine partitions before an exchange, merges single and full
//! maps, detects lost partitions and rents partitions the node no longer
//! owns by affinity.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use partex_core::{
    ExchangeId, PartitionFullMap, PartitionMap, PartitionState, TopologyVersion, UpdateCounters,
};
use tracing::{debug, warn};

use crate::cluster::DiscoCache;
use crate::error::PartitionError;
use crate::partition::{CacheGroup, LocalPartition, PartitionEvictionListener, PartitionFuture};

struct TopologyInner {
    top_ver: TopologyVersion,
    last_exchange: Option<ExchangeId>,
    disco: Option<Arc<DiscoCache>>,
    locals: BTreeMap<u32, Arc<LocalPartition>>,
    /// Last known map of every node, the local one included.
    node_map: PartitionFullMap,
    counters: UpdateCounters,
    /// Partitions some node has owned at least once.
    owned_once: BTreeSet<u32>,
    lost: BTreeSet<u32>,
}

impl TopologyInner {
    fn alive(&self, node_id: &str) -> bool {
        self.disco.as_ref().map_or(true, |d| d.alive(node_id))
    }

    fn alive_owners(&self, partition: u32) -> Vec<String> {
        self.node_map
            .owners(partition)
            .into_iter()
            .filter(|n| self.alive(n))
            .collect()
    }

    fn record_owned(&mut self) {
        for map in self.node_map.nodes.values() {
            self.owned_once.extend(map.partitions_in(PartitionState::Owning));
        }
    }
}

/// Partition topology of one cache group on a node that hosts it.
pub struct PartitionTopology {
    group: Arc<CacheGroup>,
    inner: RwLock<TopologyInner>,
    update_seq: AtomicU64,
}

impl PartitionTopology {
    /// Creates the topology and registers it for eviction notifications.
    #[must_use]
    pub fn new(group: Arc<CacheGroup>) -> Arc<Self> {
        let local = group.local_node_id().to_string();
        let top = Arc::new(Self {
            group,
            inner: RwLock::new(TopologyInner {
                top_ver: TopologyVersion::NONE,
                last_exchange: None,
                disco: None,
                locals: BTreeMap::new(),
                node_map: PartitionFullMap::new(local, 0),
                counters: UpdateCounters::new(),
                owned_once: BTreeSet::new(),
                lost: BTreeSet::new(),
            }),
            update_seq: AtomicU64::new(1),
        });
        let listener: Weak<PartitionTopology> = Arc::downgrade(&top);
        top.group.set_eviction_listener(listener);
        top
    }

    #[must_use]
    pub fn group(&self) -> &Arc<CacheGroup> {
        &self.group
    }

    #[must_use]
    pub fn group_id(&self) -> i32 {
        self.group.group_id()
    }

    #[must_use]
    pub fn topology_version(&self) -> TopologyVersion {
        self.inner.read().top_ver
    }

    #[must_use]
    pub fn update_seq(&self) -> u64 {
        self.update_seq.load(Ordering::Acquire)
    }

    fn next_update_seq(&self) -> u64 {
        self.update_seq.fetch_add(1, Ordering::AcqRel) + 1
    }

    /// Moves the topology to the version of exchange `exch_id`.
    pub fn update_topology_version(&self, exch_id: &ExchangeId, disco: Arc<DiscoCache>) {
        let mut inner = self.inner.write();
        debug_assert!(
            inner.top_ver <= exch_id.topology_version,
            "topology version went backwards: {} -> {}",
            inner.top_ver,
            exch_id.topology_version
        );
        inner.top_ver = exch_id.topology_version;
        inner.last_exchange = Some(exch_id.clone());
        inner.disco = Some(disco);
    }

    // -----------------------------------------------------------------------
    // Exchange hooks
    // -----------------------------------------------------------------------

    /// Prepares local partitions for exchange `exch_id`.
    ///
    /// Drops a departed node from the node map and creates every partition
    /// the local node is an affinity owner of. Partitions of a group started
    /// by this exchange are owned directly since no node holds data for them;
    /// otherwise they start MOVING.
    ///
    /// # Errors
    ///
    /// Fails if a partition's data store cannot be created.
    pub fn before_exchange(&self, exch_id: &ExchangeId, group_started: bool) -> Result<(), PartitionError> {
        let local = self.group.local_node_id().to_string();
        let mut inner = self.inner.write();

        if exch_id.is_left() {
            inner.node_map.remove_node(&exch_id.node_id);
        }

        let assignment = self.group.affinity().cached(inner.top_ver);
        let Some(assignment) = assignment else {
            warn!(grp = %self.group.name(), top_ver = %inner.top_ver, "no affinity assignment for exchange");
            return Ok(());
        };

        let mut created = 0usize;
        for (pid, owners) in assignment.iter().enumerate() {
            let pid = u32::try_from(pid).unwrap_or(u32::MAX);
            if !owners.iter().any(|n| *n == local) || inner.locals.contains_key(&pid) {
                continue;
            }
            let part = LocalPartition::new(Arc::clone(&self.group), pid)?;
            if group_started {
                part.own();
            }
            inner.locals.insert(pid, part);
            created += 1;
        }

        self.refresh_local(&mut inner);

        debug!(
            grp = %self.group.name(),
            exch_id = %exch_id,
            created,
            locals = inner.locals.len(),
            "partition topology prepared for exchange"
        );
        Ok(())
    }

    /// Applies a node's single map (coordinator side). Returns `true` if it changed the node map.
    pub fn update_single(&self, map: &PartitionMap, counters: Option<&UpdateCounters>) -> bool {
        if map.node_id == self.group.local_node_id() {
            return false;
        }
        let mut inner = self.inner.write();
        if !inner.alive(&map.node_id) {
            debug!(grp = %self.group.name(), node = %map.node_id, "ignoring single map of departed node");
            return false;
        }
        let changed = inner.node_map.put(map.clone());
        if let Some(counters) = counters {
            for (part, cntr) in counters {
                let cur = inner.counters.entry(*part).or_insert(0);
                *cur = (*cur).max(*cntr);
            }
        }
        inner.record_owned();
        changed
    }

    /// Applies the coordinator's full map.
    ///
    /// Local MOVING partitions the full map shows as OWNING are owned; ones it
    /// shows as LOST are marked lost. A full map older than the last
    /// exchange is ignored. Returns `true` if it was applied.
    pub fn update_full(
        &self,
        exch_id: Option<&ExchangeId>,
        full: &PartitionFullMap,
        counters: Option<&UpdateCounters>,
    ) -> bool {
        let local = self.group.local_node_id().to_string();
        let mut inner = self.inner.write();

        if let (Some(id), Some(last)) = (exch_id, inner.last_exchange.as_ref()) {
            if id.topology_version < last.topology_version {
                debug!(grp = %self.group.name(), exch_id = %id, last = %last, "ignoring stale full map");
                return false;
            }
        }

        let mut node_map = full.clone();
        node_map.nodes.retain(|node, _| node == &local || inner.alive(node));

        if let Some(mine) = full.get(&local) {
            for (pid, state) in &mine.states {
                let Some(part) = inner.locals.get(pid) else { continue };
                match (*state, part.state()) {
                    (PartitionState::Owning, PartitionState::Moving) => {
                        part.own();
                    }
                    (PartitionState::Lost, s)
                        if !matches!(s, PartitionState::Lost | PartitionState::Evicted) =>
                    {
                        part.mark_lost();
                    }
                    _ => {}
                }
            }
        }

        // Copies created after the coordinator assembled the map (centralized
        // affinity) settle the same way the coordinator settles MOVING copies.
        let unlisted: Vec<&Arc<LocalPartition>> = inner
            .locals
            .iter()
            .filter(|(pid, part)| {
                part.state() == PartitionState::Moving
                    && full.get(&local).and_then(|m| m.state(**pid)).is_none()
            })
            .map(|(_, part)| part)
            .collect();
        for part in unlisted {
            let live_owner = node_map
                .owners(part.id())
                .iter()
                .any(|n| n != &local && inner.alive(n));
            if live_owner || !inner.owned_once.contains(&part.id()) {
                part.own();
            }
        }

        if let Some(counters) = counters {
            for (pid, part) in &inner.locals {
                if let Some(cntr) = counters.get(pid) {
                    part.set_update_counter(*cntr);
                }
            }
            inner.counters.clone_from(counters);
        }

        inner.node_map = node_map;
        self.refresh_local(&mut inner);
        inner.record_owned();
        true
    }

    /// Full map as seen by the coordinator, with rebalancing settled.
    ///
    /// A MOVING copy becomes OWNING when a live node owns the partition
    /// (its data can be fetched) or when nobody has ever owned it (there is
    /// no data to fetch).
    #[must_use]
    pub fn settled_full_map(&self) -> PartitionFullMap {
        let inner = self.inner.read();
        let mut full = inner.node_map.clone();
        full.node_id = self.group.local_node_id().to_string();
        full.update_seq = self.update_seq();
        full.nodes.retain(|node, _| inner.alive(node));

        let moving: Vec<(String, u32)> = full
            .nodes
            .values()
            .flat_map(|m| {
                m.partitions_in(PartitionState::Moving)
                    .into_iter()
                    .map(|p| (m.node_id.clone(), p))
            })
            .collect();
        for (node, pid) in moving {
            let owned_elsewhere = !full.owners(pid).is_empty();
            if owned_elsewhere || !inner.owned_once.contains(&pid) {
                if let Some(map) = full.nodes.get_mut(&node) {
                    map.set(pid, PartitionState::Owning);
                }
            }
        }
        full
    }

    /// Marks partitions with no live owner as LOST.
    ///
    /// Only partitions some node owned before can be lost. Returns the
    /// newly lost partitions.
    pub fn detect_lost_partitions(&self) -> BTreeSet<u32> {
        let mut inner = self.inner.write();
        let mut lost = BTreeSet::new();

        for pid in 0..self.group.affinity().partitions() {
            if inner.lost.contains(&pid) || !inner.owned_once.contains(&pid) {
                continue;
            }
            if inner.alive_owners(pid).is_empty() {
                lost.insert(pid);
                if let Some(part) = inner.locals.get(&pid).filter(|p| p.state() != PartitionState::Evicted) {
                    part.mark_lost();
                }
            }
        }

        if !lost.is_empty() {
            warn!(grp = %self.group.name(), lost = ?lost, "detected lost partitions");
            inner.lost.extend(lost.iter().copied());
            self.refresh_local(&mut inner);
        }
        lost
    }

    /// Owns every LOST local partition again and forgets the lost set.
    pub fn reset_lost_partitions(&self) {
        let mut inner = self.inner.write();
        for part in inner.locals.values() {
            if part.state() == PartitionState::Lost {
                part.own();
            }
        }
        inner.lost.clear();
        self.refresh_local(&mut inner);
    }

    #[must_use]
    pub fn lost_partitions(&self) -> BTreeSet<u32> {
        self.inner.read().lost.clone()
    }

    /// Rents local partitions the node no longer owns by affinity.
    ///
    /// A MOVING partition is rented right away. An OWNING one waits until
    /// every affinity owner owns its copy, so the data is never dropped
    /// before it exists elsewhere. Returns the rent futures.
    pub fn check_evictions(&self) -> Vec<PartitionFuture> {
        let local = self.group.local_node_id().to_string();
        let to_rent: Vec<Arc<LocalPartition>> = {
            let inner = self.inner.read();
            let Some(assignment) = self.group.affinity().cached(inner.top_ver) else {
                return Vec::new();
            };
            inner
                .locals
                .values()
                .filter(|part| {
                    let owners = assignment
                        .get(part.id() as usize)
                        .map(Vec::as_slice)
                        .unwrap_or_default();
                    if owners.iter().any(|n| *n == local) {
                        return false;
                    }
                    match part.state() {
                        PartitionState::Moving => true,
                        PartitionState::Owning => {
                            let holders = inner.alive_owners(part.id());
                            !owners.is_empty() && owners.iter().all(|n| holders.contains(n))
                        }
                        _ => false,
                    }
                })
                .cloned()
                .collect()
        };

        // Fast eviction completes inline and calls back into
        // `on_partition_evicted`, so renting must happen with no lock held.
        let futs: Vec<PartitionFuture> = to_rent
            .iter()
            .map(|part| {
                debug!(grp = %self.group.name(), part = part.id(), "renting partition no longer owned by affinity");
                part.rent(true)
            })
            .collect();

        if !futs.is_empty() {
            let mut inner = self.inner.write();
            self.refresh_local(&mut inner);
        }
        futs
    }

    /// Rents every local partition, used when the group is stopped.
    pub fn stop(&self) -> Vec<PartitionFuture> {
        let parts: Vec<Arc<LocalPartition>> = self.inner.read().locals.values().cloned().collect();
        parts.iter().map(|p| p.rent(false)).collect()
    }

    /// Forgets a node that left the cluster.
    pub fn on_node_left(&self, node_id: &str) {
        let mut inner = self.inner.write();
        inner.node_map.remove_node(node_id);
    }

    /// Seeds the node map from a topology kept while the group was not hosted locally.
    pub fn import_full(&self, full: &PartitionFullMap, counters: &UpdateCounters) {
        let mut inner = self.inner.write();
        for map in full.nodes.values() {
            if map.node_id != self.group.local_node_id() {
                inner.node_map.put(map.clone());
            }
        }
        for (pid, cntr) in counters {
            let cur = inner.counters.entry(*pid).or_insert(0);
            *cur = (*cur).max(*cntr);
        }
        inner.record_owned();
    }

    // -----------------------------------------------------------------------
    // Views
    // -----------------------------------------------------------------------

    fn build_local_map(&self, inner: &TopologyInner, update_seq: u64) -> PartitionMap {
        let mut map = PartitionMap::new(self.group.local_node_id(), update_seq, inner.top_ver);
        for (pid, part) in &inner.locals {
            let state = part.state();
            if state != PartitionState::Evicted {
                map.set(*pid, state);
            }
        }
        map
    }

    fn refresh_local(&self, inner: &mut TopologyInner) {
        let map = self.build_local_map(inner, self.next_update_seq());
        inner.node_map.nodes.insert(map.node_id.clone(), map);
    }

    /// Current single map of the local node.
    #[must_use]
    pub fn local_partition_map(&self) -> PartitionMap {
        let inner = self.inner.read();
        self.build_local_map(&inner, self.update_seq())
    }

    /// Update counters of the local partitions.
    #[must_use]
    pub fn local_update_counters(&self) -> UpdateCounters {
        self.inner
            .read()
            .locals
            .iter()
            .map(|(pid, part)| (*pid, part.update_counter()))
            .collect()
    }

    /// Merged counters: local ones raised by whatever single maps reported.
    #[must_use]
    pub fn update_counters(&self) -> UpdateCounters {
        let inner = self.inner.read();
        let mut counters = inner.counters.clone();
        for (pid, part) in &inner.locals {
            let cur = counters.entry(*pid).or_insert(0);
            *cur = (*cur).max(part.update_counter());
        }
        counters
    }

    #[must_use]
    pub fn full_map(&self) -> PartitionFullMap {
        self.inner.read().node_map.clone()
    }

    #[must_use]
    pub fn local_partition(&self, partition: u32) -> Option<Arc<LocalPartition>> {
        self.inner.read().locals.get(&partition).cloned()
    }

    #[must_use]
    pub fn local_partitions(&self) -> Vec<Arc<LocalPartition>> {
        self.inner.read().locals.values().cloned().collect()
    }

    /// Live nodes owning `partition` according to the node map.
    #[must_use]
    pub fn owners(&self, partition: u32) -> Vec<String> {
        self.inner.read().alive_owners(partition)
    }
}

impl PartitionEvictionListener for PartitionTopology {
    fn on_partition_evicted(&self, partition: u32, update_seq: bool) {
        let mut inner = self.inner.write();
        let evicted = inner
            .locals
            .get(&partition)
            .is_some_and(|p| p.state() == PartitionState::Evicted);
        if !evicted {
            return;
        }
        inner.locals.remove(&partition);
        if update_seq {
            self.refresh_local(&mut inner);
        } else if let Some(map) = inner.node_map.nodes.get_mut(self.group.local_node_id()) {
            map.remove(partition);
        }
        debug!(grp = %self.group.name(), part = partition, "evicted partition removed from topology");
    }
}

impl std::fmt::Debug for PartitionTopology {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let inner = self.inner.read();
        f.debug_struct("PartitionTopology")
            .field("group", &self.group.name())
            .field("top_ver", &inner.top_ver)
            .field("locals", &inner.locals.len())
            .field("update_seq", &self.update_seq())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use partex_core::EventKind;

    use super::*;
    use crate::cluster::{ClusterNode, ideal_assignment};
    use crate::partition::test_support::{recording_group, GroupOptions};

    fn disco(ver: u64, ids: &[&str]) -> Arc<DiscoCache> {
        let nodes = ids
            .iter()
            .enumerate()
            .map(|(i, id)| ClusterNode::server(*id, i as u64 + 1))
            .collect();
        Arc::new(DiscoCache::new(TopologyVersion::new(ver, 0), nodes))
    }

    fn exch(ver: u64, node: &str, event: EventKind) -> ExchangeId {
        ExchangeId::new(TopologyVersion::new(ver, 0), node, event, ver)
    }

    /// Topology on node "local" with the ideal assignment over `ids` at `ver`.
    fn topology(partitions: u32, ver: u64, ids: &[&str]) -> (Arc<PartitionTopology>, Arc<DiscoCache>) {
        let (group, _) = recording_group(GroupOptions {
            partitions,
            ..GroupOptions::default()
        });
        let d = disco(ver, ids);
        let assignment = ideal_assignment(d.server_nodes(), partitions, 0);
        group
            .affinity()
            .initialize(TopologyVersion::new(ver, 0), Arc::new(assignment));
        let top = PartitionTopology::new(group);
        top.update_topology_version(&exch(ver, "local", EventKind::NodeJoined), Arc::clone(&d));
        (top, d)
    }

    // -- before_exchange --

    #[test]
    fn started_group_owns_affine_partitions() {
        let (top, _) = topology(4, 1, &["local"]);
        top.before_exchange(&exch(1, "local", EventKind::NodeJoined), true)
            .unwrap();
        let map = top.local_partition_map();
        assert_eq!(map.partitions_in(PartitionState::Owning), vec![0, 1, 2, 3]);
        assert_eq!(top.owners(2), vec!["local".to_string()]);
    }

    #[test]
    fn joining_node_creates_moving_partitions() {
        let (top, _) = topology(4, 2, &["a", "local"]);
        top.before_exchange(&exch(2, "local", EventKind::NodeJoined), false)
            .unwrap();
        // Sorted ids: a, local -> local gets odd partitions.
        let map = top.local_partition_map();
        assert_eq!(map.partitions_in(PartitionState::Moving), vec![1, 3]);
        assert!(map.partitions_in(PartitionState::Owning).is_empty());
    }

    // -- full map settlement --

    #[test]
    fn settled_map_owns_moving_copies_of_owned_partitions() {
        let (top, _) = topology(4, 2, &["a", "local"]);
        top.before_exchange(&exch(2, "a", EventKind::NodeJoined), false)
            .unwrap();

        let mut remote = PartitionMap::new("a", 5, TopologyVersion::new(2, 0));
        for p in 0..4 {
            remote.set(p, PartitionState::Owning);
        }
        assert!(top.update_single(&remote, None));

        let full = top.settled_full_map();
        assert_eq!(full.get("local").unwrap().state(1), Some(PartitionState::Owning));

        assert!(top.update_full(Some(&exch(2, "a", EventKind::NodeJoined)), &full, None));
        assert_eq!(top.local_partition(1).unwrap().state(), PartitionState::Owning);
    }

    #[test]
    fn stale_full_map_is_ignored() {
        let (top, _) = topology(2, 3, &["local"]);
        let full = PartitionFullMap::new("x", 1);
        assert!(!top.update_full(Some(&exch(2, "x", EventKind::NodeJoined)), &full, None));
    }

    #[test]
    fn single_map_of_departed_node_is_ignored() {
        let (top, d) = topology(2, 3, &["a", "local"]);
        d.update_alives("a");
        let map = PartitionMap::new("a", 1, TopologyVersion::new(3, 0));
        assert!(!top.update_single(&map, None));
    }

    // -- lost partitions --

    #[test]
    fn partition_without_live_owner_is_lost() {
        let (top, d) = topology(2, 2, &["a", "local"]);
        top.before_exchange(&exch(2, "local", EventKind::NodeJoined), false)
            .unwrap();
        let mut remote = PartitionMap::new("a", 2, TopologyVersion::new(2, 0));
        remote.set(0, PartitionState::Owning);
        remote.set(1, PartitionState::Owning);
        top.update_single(&remote, None);

        d.update_alives("a");
        top.on_node_left("a");
        let lost = top.detect_lost_partitions();
        assert_eq!(lost, BTreeSet::from([0, 1]));
        assert_eq!(top.local_partition(1).unwrap().state(), PartitionState::Lost);

        top.reset_lost_partitions();
        assert!(top.lost_partitions().is_empty());
        assert_eq!(top.local_partition(1).unwrap().state(), PartitionState::Owning);
    }

    // -- evictions --

    #[test]
    fn non_affine_owned_partitions_are_rented_once_new_owner_owns() {
        let (top, _) = topology(2, 1, &["local"]);
        top.before_exchange(&exch(1, "local", EventKind::NodeJoined), true)
            .unwrap();
        assert_eq!(top.local_partitions().len(), 2);

        // "b" joins and takes over part of the partitions.
        let d2 = disco(2, &["local", "b"]);
        let assignment = ideal_assignment(d2.server_nodes(), 2, 0);
        let b_parts: Vec<u32> = (0..2u32)
            .filter(|p| assignment[*p as usize] == vec!["b".to_string()])
            .collect();
        top.group()
            .affinity()
            .initialize(TopologyVersion::new(2, 0), Arc::new(assignment));
        top.update_topology_version(&exch(2, "b", EventKind::NodeJoined), d2);
        top.before_exchange(&exch(2, "b", EventKind::NodeJoined), false)
            .unwrap();

        // New owner has not reported OWNING yet: nothing to rent.
        assert!(top.check_evictions().is_empty());

        let mut remote = PartitionMap::new("b", 3, TopologyVersion::new(2, 0));
        for p in &b_parts {
            remote.set(*p, PartitionState::Owning);
        }
        top.update_single(&remote, None);
        let futs = top.check_evictions();
        assert_eq!(futs.len(), b_parts.len());
        assert!(futs.iter().all(PartitionFuture::is_done));
        for p in &b_parts {
            assert!(top.local_partition(*p).is_none());
            assert_eq!(top.full_map().get("local").unwrap().state(*p), None);
        }
    }

    #[test]
    fn stop_rents_every_partition() {
        let (top, _) = topology(3, 1, &["local"]);
        top.before_exchange(&exch(1, "local", EventKind::NodeJoined), true)
            .unwrap();
        let futs = top.stop();
        assert_eq!(futs.len(), 3);
        assert!(top.local_partitions().is_empty());
    }

    #[test]
    fn counters_merge_local_and_reported() {
        let (top, _) = topology(2, 2, &["a", "local"]);
        top.before_exchange(&exch(2, "local", EventKind::NodeJoined), true)
            .unwrap();
        let part = top.local_partition(1).unwrap();
        part.set_update_counter(7);
        let remote = PartitionMap::new("a", 2, TopologyVersion::new(2, 0));
        top.update_single(&remote, Some(&UpdateCounters::from([(0, 3), (1, 2)])));
        let counters = top.update_counters();
        assert_eq!(counters.get(&0), Some(&3));
        assert_eq!(counters.get(&1), Some(&7));
    }
}
