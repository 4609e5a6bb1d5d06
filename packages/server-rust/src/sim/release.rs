//! In-flight operation and explicit lock tracking for the simulated nodes.
//!
//! Operations and locks are registered with the topology version they
//! started on and held by an RAII [`OperationGuard`]. Release futures for a
//! newer version complete once every older holder dropped its guard.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::Mutex;
use partex_core::TopologyVersion;
use tracing::{debug, error};

use crate::cluster::FailureHandler;
use crate::error::ExchangeError;
use crate::exchange::PartitionReleaseTracker;
use crate::future::GridFuture;

#[derive(Debug, Clone, PartialEq, Eq)]
enum Holder {
    Operation,
    Lock { node_id: String },
}

#[derive(Debug, Clone)]
struct Pending {
    top_ver: TopologyVersion,
    holder: Holder,
    description: String,
}

struct Waiter {
    top_ver: TopologyVersion,
    locks: bool,
    fut: GridFuture<(), ExchangeError>,
}

#[derive(Default)]
struct TrackerState {
    pending: BTreeMap<u64, Pending>,
    waiters: Vec<Waiter>,
}

impl TrackerState {
    fn blocks(&self, top_ver: TopologyVersion, locks: bool) -> bool {
        self.pending
            .values()
            .any(|p| p.top_ver < top_ver && matches!(p.holder, Holder::Lock { .. }) == locks)
    }

    /// Removes waiters that no longer block; the caller completes them after unlocking.
    fn take_released(&mut self) -> Vec<GridFuture<(), ExchangeError>> {
        let (released, waiting): (Vec<Waiter>, Vec<Waiter>) = std::mem::take(&mut self.waiters)
            .into_iter()
            .partition(|w| !self.blocks(w.top_ver, w.locks));
        self.waiters = waiting;
        released.into_iter().map(|w| w.fut).collect()
    }
}

#[derive(Default)]
struct TrackerInner {
    next_id: AtomicU64,
    state: Mutex<TrackerState>,
}

impl TrackerInner {
    fn remove(&self, ids: impl FnOnce(&BTreeMap<u64, Pending>) -> Vec<u64>) {
        let released = {
            let mut state = self.state.lock();
            for id in ids(&state.pending) {
                state.pending.remove(&id);
            }
            state.take_released()
        };
        for fut in released {
            fut.on_done(Ok(()));
        }
    }
}

/// Release tracker backed by RAII guards.
#[derive(Clone, Default)]
pub struct SimReleaseTracker {
    inner: Arc<TrackerInner>,
}

impl SimReleaseTracker {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn register(&self, top_ver: TopologyVersion, holder: Holder, description: String) -> OperationGuard {
        let id = self.inner.next_id.fetch_add(1, Ordering::Relaxed);
        self.inner.state.lock().pending.insert(
            id,
            Pending {
                top_ver,
                holder,
                description,
            },
        );
        OperationGuard {
            inner: Arc::clone(&self.inner),
            id,
        }
    }

    /// Marks an operation mapped on `top_ver` as in flight until the guard drops.
    #[must_use]
    pub fn begin_operation(&self, top_ver: TopologyVersion, description: impl Into<String>) -> OperationGuard {
        self.register(top_ver, Holder::Operation, description.into())
    }

    /// Explicit lock taken on `top_ver` on behalf of `node_id`.
    #[must_use]
    pub fn lock(&self, top_ver: TopologyVersion, node_id: impl Into<String>, description: impl Into<String>) -> OperationGuard {
        self.register(
            top_ver,
            Holder::Lock {
                node_id: node_id.into(),
            },
            description.into(),
        )
    }

    #[must_use]
    pub fn in_flight_count(&self) -> usize {
        self.inner.state.lock().pending.len()
    }

    fn release_future(&self, top_ver: TopologyVersion, locks: bool) -> GridFuture<(), ExchangeError> {
        let mut state = self.inner.state.lock();
        if !state.blocks(top_ver, locks) {
            return GridFuture::completed(Ok(()));
        }
        let fut = GridFuture::new();
        state.waiters.push(Waiter {
            top_ver,
            locks,
            fut: fut.clone(),
        });
        fut
    }
}

impl PartitionReleaseTracker for SimReleaseTracker {
    fn partition_release_future(&self, top_ver: TopologyVersion) -> GridFuture<(), ExchangeError> {
        self.release_future(top_ver, false)
    }

    fn lock_release_future(&self, top_ver: TopologyVersion) -> GridFuture<(), ExchangeError> {
        self.release_future(top_ver, true)
    }

    fn remove_explicit_node_locks(&self, node_id: &str) {
        self.inner.remove(|pending| {
            pending
                .iter()
                .filter(|(_, p)| matches!(&p.holder, Holder::Lock { node_id: n } if n == node_id))
                .map(|(id, _)| *id)
                .collect()
        });
        debug!(node = node_id, "removed explicit locks of departed node");
    }

    fn pending_objects(&self, top_ver: TopologyVersion) -> Vec<String> {
        self.inner
            .state
            .lock()
            .pending
            .values()
            .filter(|p| p.top_ver < top_ver)
            .map(|p| format!("{} (topVer {})", p.description, p.top_ver))
            .collect()
    }
}

impl std::fmt::Debug for SimReleaseTracker {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimReleaseTracker")
            .field("in_flight", &self.in_flight_count())
            .finish()
    }
}

/// Drops its operation or lock from the tracker, even on panic.
pub struct OperationGuard {
    inner: Arc<TrackerInner>,
    id: u64,
}

impl Drop for OperationGuard {
    fn drop(&mut self) {
        let id = self.id;
        self.inner.remove(|_| vec![id]);
    }
}

impl std::fmt::Debug for OperationGuard {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OperationGuard").field("id", &self.id).finish()
    }
}

/// Failure handler that records stop requests instead of exiting.
#[derive(Debug, Default)]
pub struct RecordingFailureHandler {
    reasons: Mutex<Vec<String>>,
}

impl RecordingFailureHandler {
    #[must_use]
    pub fn reasons(&self) -> Vec<String> {
        self.reasons.lock().clone()
    }
}

impl FailureHandler for RecordingFailureHandler {
    fn stop_node(&self, reason: &str) {
        error!(reason, "failure handler asked to stop node");
        self.reasons.lock().push(reason.to_string());
    }
}
