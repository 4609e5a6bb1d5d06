//! Cache versions and the per-node version generator.
//!
//! A [`CacheVersion`] orders entry updates across the cluster. The generator
//! seeds its order counter from a [`ClockSource`] so versions stay roughly
//! aligned with wall-clock time, and ratchets it forward whenever an exchange
//! reports a higher order seen elsewhere in the cluster.

use std::cmp::Ordering;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::time::{SystemTime, UNIX_EPOCH};

use serde::{Deserialize, Serialize};

use crate::topology::TopologyVersion;

// ---------------------------------------------------------------------------
// CacheVersion
// ---------------------------------------------------------------------------

/// Version stamped on every cache entry update.
///
/// Ordering: topology major version, then order, then node order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CacheVersion {
    pub topology_version: u64,
    pub order: u64,
    pub node_order: u64,
}

impl CacheVersion {
    #[must_use]
    pub const fn new(topology_version: u64, order: u64, node_order: u64) -> Self {
        Self {
            topology_version,
            order,
            node_order,
        }
    }
}

impl Ord for CacheVersion {
    fn cmp(&self, other: &Self) -> Ordering {
        self.topology_version
            .cmp(&other.topology_version)
            .then_with(|| self.order.cmp(&other.order))
            .then_with(|| self.node_order.cmp(&other.node_order))
    }
}

impl PartialOrd for CacheVersion {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

// ---------------------------------------------------------------------------
// Clock
// ---------------------------------------------------------------------------

/// Abstraction over the system clock for dependency injection.
///
/// Tests swap in a fixed clock to make generated versions deterministic.
pub trait ClockSource: Send + Sync {
    /// Milliseconds since Unix epoch.
    fn now(&self) -> u64;
}

/// Clock source backed by `SystemTime`.
#[derive(Debug, Clone, Copy, Default)]
pub struct SystemClock;

impl ClockSource for SystemClock {
    fn now(&self) -> u64 {
        // A clock before the epoch reads as 0; the generator stays monotonic anyway.
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| u64::try_from(d.as_millis()).unwrap_or(u64::MAX))
    }
}

// ---------------------------------------------------------------------------
// VersionGenerator
// ---------------------------------------------------------------------------

/// Thread-safe generator of monotonically increasing [`CacheVersion`]s.
pub struct VersionGenerator {
    node_order: u64,
    topology_version: AtomicU64,
    order: AtomicU64,
    clock: Box<dyn ClockSource>,
}

impl VersionGenerator {
    #[must_use]
    pub fn new(node_order: u64, clock: Box<dyn ClockSource>) -> Self {
        Self {
            node_order,
            topology_version: AtomicU64::new(0),
            order: AtomicU64::new(0),
            clock,
        }
    }

    /// Generator backed by the system clock.
    #[must_use]
    pub fn system(node_order: u64) -> Self {
        Self::new(node_order, Box::new(SystemClock))
    }

    /// Produces the next version for `top_ver`.
    pub fn next(&self, top_ver: TopologyVersion) -> CacheVersion {
        self.topology_version
            .fetch_max(top_ver.major, AtomicOrdering::AcqRel);
        let floor = self.clock.now();
        let prev = self
            .order
            .fetch_update(AtomicOrdering::AcqRel, AtomicOrdering::Acquire, |cur| {
                Some(cur.max(floor.saturating_sub(1)) + 1)
            })
            .unwrap_or_else(|cur| cur);
        let order = prev.max(floor.saturating_sub(1)) + 1;
        CacheVersion::new(top_ver.major, order, self.node_order)
    }

    /// Last version handed out (or learned from the cluster), without advancing.
    #[must_use]
    pub fn last(&self) -> CacheVersion {
        CacheVersion::new(
            self.topology_version.load(AtomicOrdering::Acquire),
            self.order.load(AtomicOrdering::Acquire),
            self.node_order,
        )
    }

    /// Ratchets the order counter so that later versions sort after `order`.
    ///
    /// Called when an exchange reports the highest version seen cluster-wide.
    pub fn on_exchange(&self, order: u64) {
        let prev = self.order.fetch_max(order, AtomicOrdering::AcqRel);
        if order > prev {
            tracing::debug!(prev, order, "version order ratcheted by exchange");
        }
    }

    /// Records a version observed on a remote node.
    pub fn on_received(&self, ver: CacheVersion) {
        self.topology_version
            .fetch_max(ver.topology_version, AtomicOrdering::AcqRel);
        self.on_exchange(ver.order);
    }
}

impl std::fmt::Debug for VersionGenerator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionGenerator")
            .field("node_order", &self.node_order)
            .field("last", &self.last())
            .finish_non_exhaustive()
    }
}
