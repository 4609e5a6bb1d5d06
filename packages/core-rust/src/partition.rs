//! Partition states and the partition maps exchanged between nodes.
//!
//! - [`PartitionState`]: lifecycle state of one partition on one node
//! - [`PartitionMap`]: one node's view of its own partitions
//! - [`PartitionFullMap`]: the coordinator's merged view, node id -> [`PartitionMap`]
//! - [`UpdateCounters`]: per-partition update counters carried next to the maps

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};

use crate::topology::TopologyVersion;

/// Per-partition update counters, keyed by partition id.
pub type UpdateCounters = BTreeMap<u32, u64>;

// ---------------------------------------------------------------------------
// PartitionState
// ---------------------------------------------------------------------------

/// Lifecycle state of a partition on a node.
///
/// The discriminants are stable: they are packed into the low bits of the
/// local partition's atomic state word.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
#[repr(u8)]
pub enum PartitionState {
    /// Receiving data, not yet authoritative.
    Moving = 0,
    /// Authoritative primary or backup copy.
    Owning = 1,
    /// Giving up ownership; will be evicted.
    Renting = 2,
    /// Terminal. Data destroyed.
    Evicted = 3,
    /// Unavailable after data loss.
    Lost = 4,
}

impl PartitionState {
    /// All states in ordinal order.
    pub const ALL: [PartitionState; 5] = [
        PartitionState::Moving,
        PartitionState::Owning,
        PartitionState::Renting,
        PartitionState::Evicted,
        PartitionState::Lost,
    ];

    #[must_use]
    pub const fn ordinal(self) -> u8 {
        self as u8
    }

    /// Inverse of [`ordinal`](Self::ordinal). `None` for unknown ordinals.
    #[must_use]
    pub fn from_ordinal(ordinal: u8) -> Option<Self> {
        Self::ALL.get(usize::from(ordinal)).copied()
    }

    /// `true` for states that still hold (or are receiving) data.
    #[must_use]
    pub fn active(self) -> bool {
        matches!(self, PartitionState::Moving | PartitionState::Owning)
    }
}

impl fmt::Display for PartitionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            PartitionState::Moving => "MOVING",
            PartitionState::Owning => "OWNING",
            PartitionState::Renting => "RENTING",
            PartitionState::Evicted => "EVICTED",
            PartitionState::Lost => "LOST",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// PartitionMap
// ---------------------------------------------------------------------------

/// A single node's partition states for one cache group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionMap {
    pub node_id: String,
    /// Local update sequence of the node at the time the map was taken.
    pub update_seq: u64,
    pub topology_version: TopologyVersion,
    pub states: BTreeMap<u32, PartitionState>,
}

impl PartitionMap {
    #[must_use]
    pub fn new(node_id: impl Into<String>, update_seq: u64, topology_version: TopologyVersion) -> Self {
        Self {
            node_id: node_id.into(),
            update_seq,
            topology_version,
            states: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn state(&self, partition: u32) -> Option<PartitionState> {
        self.states.get(&partition).copied()
    }

    pub fn set(&mut self, partition: u32, state: PartitionState) {
        self.states.insert(partition, state);
    }

    pub fn remove(&mut self, partition: u32) -> Option<PartitionState> {
        self.states.remove(&partition)
    }

    /// Partitions this node currently holds in `state`.
    #[must_use]
    pub fn partitions_in(&self, state: PartitionState) -> Vec<u32> {
        self.states
            .iter()
            .filter(|(_, s)| **s == state)
            .map(|(p, _)| *p)
            .collect()
    }
}

// ---------------------------------------------------------------------------
// PartitionFullMap
// ---------------------------------------------------------------------------

/// Cluster-wide partition map for one cache group: node id -> [`PartitionMap`].
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionFullMap {
    /// Node that assembled this map (the coordinator), empty before the first exchange.
    pub node_id: String,
    pub update_seq: u64,
    pub nodes: BTreeMap<String, PartitionMap>,
}

impl PartitionFullMap {
    #[must_use]
    pub fn new(node_id: impl Into<String>, update_seq: u64) -> Self {
        Self {
            node_id: node_id.into(),
            update_seq,
            nodes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn get(&self, node_id: &str) -> Option<&PartitionMap> {
        self.nodes.get(node_id)
    }

    /// Replaces a node's map if the incoming one is not older.
    ///
    /// Returns `true` when the map was stored.
    pub fn put(&mut self, map: PartitionMap) -> bool {
        match self.nodes.get(&map.node_id) {
            Some(existing) if existing.update_seq > map.update_seq => false,
            _ => {
                self.nodes.insert(map.node_id.clone(), map);
                true
            }
        }
    }

    pub fn remove_node(&mut self, node_id: &str) -> Option<PartitionMap> {
        self.nodes.remove(node_id)
    }

    /// Nodes whose copy of `partition` is in `state`, in node id order.
    #[must_use]
    pub fn nodes_in(&self, partition: u32, state: PartitionState) -> Vec<String> {
        self.nodes
            .values()
            .filter(|m| m.state(partition) == Some(state))
            .map(|m| m.node_id.clone())
            .collect()
    }

    /// Nodes owning `partition`.
    #[must_use]
    pub fn owners(&self, partition: u32) -> Vec<String> {
        self.nodes_in(partition, PartitionState::Owning)
    }
}
