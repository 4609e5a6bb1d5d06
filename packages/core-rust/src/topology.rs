//! Topology versions and exchange identifiers.
//!
//! Every membership change (node join/leave/fail) bumps the major topology
//! version; custom cluster events (cache start/stop, affinity switches) bump
//! the minor version on top of the current major one.

use std::cmp::Ordering;
use std::fmt;

use serde::{Deserialize, Serialize};

// ---------------------------------------------------------------------------
// TopologyVersion
// ---------------------------------------------------------------------------

/// Monotonically increasing identifier of a cluster membership configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TopologyVersion {
    pub major: u64,
    pub minor: u32,
}

impl TopologyVersion {
    /// Version used before the first exchange completes.
    pub const NONE: TopologyVersion = TopologyVersion { major: 0, minor: 0 };

    #[must_use]
    pub const fn new(major: u64, minor: u32) -> Self {
        Self { major, minor }
    }

    /// Version produced by a custom event on top of this one.
    #[must_use]
    pub const fn next_minor(self) -> Self {
        Self {
            major: self.major,
            minor: self.minor + 1,
        }
    }

    #[must_use]
    pub fn is_none(self) -> bool {
        self == Self::NONE
    }
}

impl Ord for TopologyVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.major
            .cmp(&other.major)
            .then_with(|| self.minor.cmp(&other.minor))
    }
}

impl PartialOrd for TopologyVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for TopologyVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {}]", self.major, self.minor)
    }
}

// ---------------------------------------------------------------------------
// Discovery event kinds
// ---------------------------------------------------------------------------

/// Kind of discovery event that triggered an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum EventKind {
    NodeJoined,
    NodeLeft,
    NodeFailed,
    /// Cluster-wide custom message (cache change, affinity change).
    Custom,
}

impl EventKind {
    /// `true` for departures, both graceful and failure-detected.
    #[must_use]
    pub fn is_left(self) -> bool {
        matches!(self, EventKind::NodeLeft | EventKind::NodeFailed)
    }
}

impl fmt::Display for EventKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            EventKind::NodeJoined => "NODE_JOINED",
            EventKind::NodeLeft => "NODE_LEFT",
            EventKind::NodeFailed => "NODE_FAILED",
            EventKind::Custom => "CUSTOM",
        };
        f.write_str(s)
    }
}

// ---------------------------------------------------------------------------
// ExchangeId
// ---------------------------------------------------------------------------

/// Identity of one partition exchange round.
///
/// Two ids are equal when they describe the same topology change: same
/// version, same event node, same event kind. The `counter` is a node-local
/// sequence number used only for diagnostics and creation order, so it is
/// excluded from equality and hashing.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExchangeId {
    pub topology_version: TopologyVersion,
    /// Node that caused the event (joined, left, or sent the custom message).
    pub node_id: String,
    pub event: EventKind,
    pub counter: u64,
}

impl ExchangeId {
    #[must_use]
    pub fn new(
        topology_version: TopologyVersion,
        node_id: impl Into<String>,
        event: EventKind,
        counter: u64,
    ) -> Self {
        Self {
            topology_version,
            node_id: node_id.into(),
            event,
            counter,
        }
    }

    /// `true` when the exchange was triggered by a node leaving or failing.
    #[must_use]
    pub fn is_left(&self) -> bool {
        self.event.is_left()
    }

    #[must_use]
    pub fn is_joined(&self) -> bool {
        self.event == EventKind::NodeJoined
    }
}

impl PartialEq for ExchangeId {
    fn eq(&self, other: &Self) -> bool {
        self.topology_version == other.topology_version
            && self.node_id == other.node_id
            && self.event == other.event
    }
}

impl Eq for ExchangeId {}

impl std::hash::Hash for ExchangeId {
    fn hash<H: std::hash::Hasher>(&self, state: &mut H) {
        self.topology_version.hash(state);
        self.node_id.hash(state);
        self.event.hash(state);
    }
}

impl Ord for ExchangeId {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_version
            .cmp(&other.topology_version)
            .then_with(|| self.node_id.cmp(&other.node_id))
            .then_with(|| (self.event as u8).cmp(&(other.event as u8)))
    }
}

impl PartialOrd for ExchangeId {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl fmt::Display for ExchangeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ExchangeId[topVer={}, node={}, evt={}, cnt={}]",
            self.topology_version, self.node_id, self.event, self.counter
        )
    }
}
