//! Cluster domain types: nodes, discovery events and membership snapshots.
//!
//! These describe what the discovery layer hands to the exchange: who is in
//! the cluster at a given topology version and which event produced it.

use std::collections::{BTreeMap, HashSet};

use parking_lot::RwLock;
use partex_core::{EventKind, TopologyVersion};
use serde::{Deserialize, Serialize};

use super::messages::CustomMessage;

/// Node attribute: the node can unwind a failed cache start cluster-wide.
pub const ATTR_EXCHANGE_ROLLBACK: &str = "partex.exchange.rollback";

/// Node attribute: the node accepts compressed exchange messages.
pub const ATTR_EXCHANGE_COMPRESSION: &str = "partex.exchange.compression";

// ---------------------------------------------------------------------------
// ClusterNode
// ---------------------------------------------------------------------------

/// A member of the cluster as seen by discovery.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClusterNode {
    pub id: String,
    /// Join order assigned by discovery; lower joined earlier.
    pub order: u64,
    /// Client nodes hold no partitions.
    pub client: bool,
    pub attributes: BTreeMap<String, String>,
}

impl ClusterNode {
    #[must_use]
    pub fn server(id: impl Into<String>, order: u64) -> Self {
        Self {
            id: id.into(),
            order,
            client: false,
            attributes: BTreeMap::new(),
        }
    }

    #[must_use]
    pub fn client(id: impl Into<String>, order: u64) -> Self {
        Self {
            client: true,
            ..Self::server(id, order)
        }
    }

    #[must_use]
    pub fn with_attribute(mut self, name: &str, value: impl Into<String>) -> Self {
        self.attributes.insert(name.to_string(), value.into());
        self
    }

    /// Reads a boolean attribute; missing or unparsable counts as `false`.
    #[must_use]
    pub fn attribute_flag(&self, name: &str) -> bool {
        self.attributes
            .get(name)
            .is_some_and(|v| v.eq_ignore_ascii_case("true"))
    }

    #[must_use]
    pub fn supports_compression(&self) -> bool {
        self.attribute_flag(ATTR_EXCHANGE_COMPRESSION)
    }
}

// ---------------------------------------------------------------------------
// DiscoveryEvent
// ---------------------------------------------------------------------------

/// A discovery event that starts an exchange.
#[derive(Debug, Clone)]
pub struct DiscoveryEvent {
    pub kind: EventKind,
    /// Node that joined, left, failed, or sent the custom message.
    pub node: ClusterNode,
    pub topology_version: TopologyVersion,
    /// Payload of a custom event.
    pub message: Option<CustomMessage>,
}

impl DiscoveryEvent {
    #[must_use]
    pub fn new(kind: EventKind, node: ClusterNode, topology_version: TopologyVersion) -> Self {
        Self {
            kind,
            node,
            topology_version,
            message: None,
        }
    }

    #[must_use]
    pub fn custom(node: ClusterNode, topology_version: TopologyVersion, message: CustomMessage) -> Self {
        Self {
            kind: EventKind::Custom,
            node,
            topology_version,
            message: Some(message),
        }
    }
}

// ---------------------------------------------------------------------------
// DiscoCache
// ---------------------------------------------------------------------------

/// Point-in-time membership snapshot for one topology version.
///
/// Server nodes are kept in coordinator order: oldest join order first,
/// ties broken by node id. The alive set shrinks as nodes leave after the
/// snapshot was taken.
#[derive(Debug)]
pub struct DiscoCache {
    version: TopologyVersion,
    all_nodes: Vec<ClusterNode>,
    server_nodes: Vec<ClusterNode>,
    alives: RwLock<HashSet<String>>,
}

impl DiscoCache {
    #[must_use]
    pub fn new(version: TopologyVersion, mut nodes: Vec<ClusterNode>) -> Self {
        nodes.sort_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)));
        let server_nodes: Vec<ClusterNode> = nodes.iter().filter(|n| !n.client).cloned().collect();
        let alives = nodes.iter().map(|n| n.id.clone()).collect();
        Self {
            version,
            all_nodes: nodes,
            server_nodes,
            alives: RwLock::new(alives),
        }
    }

    #[must_use]
    pub fn version(&self) -> TopologyVersion {
        self.version
    }

    #[must_use]
    pub fn all_nodes(&self) -> &[ClusterNode] {
        &self.all_nodes
    }

    /// Server nodes in coordinator order.
    #[must_use]
    pub fn server_nodes(&self) -> &[ClusterNode] {
        &self.server_nodes
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<&ClusterNode> {
        self.all_nodes.iter().find(|n| n.id == id)
    }

    #[must_use]
    pub fn alive(&self, id: &str) -> bool {
        self.alives.read().contains(id)
    }

    /// Marks a node that left after this snapshot was taken.
    pub fn update_alives(&self, left_node_id: &str) {
        self.alives.write().remove(left_node_id);
    }

    /// Oldest server node still alive.
    #[must_use]
    pub fn oldest_alive_server_node(&self) -> Option<&ClusterNode> {
        let alives = self.alives.read();
        self.server_nodes.iter().find(|n| alives.contains(&n.id))
    }

    /// Server nodes able to hold data for a cache.
    ///
    /// Every server node is an affinity node; node filters are not modelled.
    #[must_use]
    pub fn cache_affinity_nodes(&self) -> &[ClusterNode] {
        &self.server_nodes
    }

    /// `true` only if every node in the snapshot advertises `attribute` as true.
    #[must_use]
    pub fn check_attribute(&self, attribute: &str) -> bool {
        self.all_nodes.iter().all(|n| n.attribute_flag(attribute))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn server_nodes_sorted_by_join_order() {
        let cache = DiscoCache::new(
            TopologyVersion::new(3, 0),
            vec![
                ClusterNode::server("c", 3),
                ClusterNode::client("x", 2),
                ClusterNode::server("a", 1),
            ],
        );
        let ids: Vec<&str> = cache.server_nodes().iter().map(|n| n.id.as_str()).collect();
        assert_eq!(ids, vec!["a", "c"]);
        assert_eq!(cache.all_nodes().len(), 3);
    }

    #[test]
    fn oldest_alive_skips_departed() {
        let cache = DiscoCache::new(
            TopologyVersion::new(2, 0),
            vec![ClusterNode::server("a", 1), ClusterNode::server("b", 2)],
        );
        assert_eq!(cache.oldest_alive_server_node().map(|n| n.id.as_str()), Some("a"));
        cache.update_alives("a");
        assert!(!cache.alive("a"));
        assert_eq!(cache.oldest_alive_server_node().map(|n| n.id.as_str()), Some("b"));
    }

    #[test]
    fn check_attribute_requires_all_nodes() {
        let yes = ClusterNode::server("a", 1).with_attribute(ATTR_EXCHANGE_ROLLBACK, "true");
        let no = ClusterNode::server("b", 2);
        let cache = DiscoCache::new(TopologyVersion::new(2, 0), vec![yes.clone(), no]);
        assert!(!cache.check_attribute(ATTR_EXCHANGE_ROLLBACK));

        let cache = DiscoCache::new(TopologyVersion::new(1, 0), vec![yes]);
        assert!(cache.check_attribute(ATTR_EXCHANGE_ROLLBACK));
    }
}
