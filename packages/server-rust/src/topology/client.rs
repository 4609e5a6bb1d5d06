//! Partition topology of a cache group the local node does not host.
//!
//! Client nodes (and servers that have not started a group yet) keep only
//! the cluster-wide view: the last full map and update counters.

use parking_lot::RwLock;
use partex_core::{ExchangeId, PartitionFullMap, PartitionMap, TopologyVersion, UpdateCounters};
use tracing::debug;

#[derive(Debug, Default)]
struct ClientInner {
    top_ver: TopologyVersion,
    node_map: PartitionFullMap,
    counters: UpdateCounters,
}

/// Read-only partition view of a remote cache group.
#[derive(Debug)]
pub struct ClientTopology {
    group_id: i32,
    inner: RwLock<ClientInner>,
}

impl ClientTopology {
    #[must_use]
    pub fn new(group_id: i32) -> Self {
        Self {
            group_id,
            inner: RwLock::new(ClientInner::default()),
        }
    }

    #[must_use]
    pub fn group_id(&self) -> i32 {
        self.group_id
    }

    #[must_use]
    pub fn topology_version(&self) -> TopologyVersion {
        self.inner.read().top_ver
    }

    pub fn update_topology_version(&self, exch_id: &ExchangeId) {
        let mut inner = self.inner.write();
        if exch_id.topology_version > inner.top_ver {
            inner.top_ver = exch_id.topology_version;
        }
        if exch_id.is_left() {
            inner.node_map.remove_node(&exch_id.node_id);
        }
    }

    pub fn update_single(&self, map: &PartitionMap) -> bool {
        self.inner.write().node_map.put(map.clone())
    }

    /// Replaces the view with the coordinator's full map.
    pub fn update_full(&self, exch_id: Option<&ExchangeId>, full: &PartitionFullMap, counters: Option<&UpdateCounters>) -> bool {
        let mut inner = self.inner.write();
        if let Some(id) = exch_id {
            if id.topology_version < inner.top_ver {
                debug!(grp = self.group_id, exch_id = %id, "ignoring stale full map");
                return false;
            }
        }
        inner.node_map = full.clone();
        if let Some(counters) = counters {
            inner.counters.clone_from(counters);
        }
        true
    }

    #[must_use]
    pub fn full_map(&self) -> PartitionFullMap {
        self.inner.read().node_map.clone()
    }

    #[must_use]
    pub fn update_counters(&self) -> UpdateCounters {
        self.inner.read().counters.clone()
    }

    #[must_use]
    pub fn owners(&self, partition: u32) -> Vec<String> {
        self.inner.read().node_map.owners(partition)
    }
}

#[cfg(test)]
mod tests {
    use partex_core::{EventKind, PartitionState};

    use super::*;

    #[test]
    fn full_map_replaces_view_and_left_node_is_dropped() {
        let top = ClientTopology::new(7);
        let mut full = PartitionFullMap::new("crd", 3);
        let mut a = PartitionMap::new("a", 1, TopologyVersion::new(2, 0));
        a.set(0, PartitionState::Owning);
        full.put(a);
        assert!(top.update_full(None, &full, None));
        assert_eq!(top.owners(0), vec!["a".to_string()]);

        top.update_topology_version(&ExchangeId::new(TopologyVersion::new(3, 0), "a", EventKind::NodeFailed, 1));
        assert!(top.owners(0).is_empty());
        assert_eq!(top.topology_version(), TopologyVersion::new(3, 0));

        let stale = ExchangeId::new(TopologyVersion::new(2, 0), "x", EventKind::NodeJoined, 0);
        assert!(!top.update_full(Some(&stale), &full, None));
    }
}
