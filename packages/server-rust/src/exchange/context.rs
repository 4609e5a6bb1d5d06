//! Node-level collaborators shared by every exchange future.

use std::sync::Arc;

use partex_core::{TopologyVersion, VersionGenerator};
use tokio::runtime::Handle;

use crate::affinity::AffinityManager;
use crate::cache::CacheRegistry;
use crate::cluster::{ClusterNode, DiscoveryService, ExchangeMessage, ExchangeTransport, FailureHandler};
use crate::config::ExchangeConfig;
use crate::error::{ExchangeError, TransportError};
use crate::future::GridFuture;

/// Thread an exchange call is made from.
///
/// Discovery callbacks must never block, so work started from the discovery
/// thread is handed to the blocking pool.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExecContext {
    Discovery,
    Worker,
}

/// Tracks in-flight operations an exchange must wait out before it swaps
/// partition maps.
pub trait PartitionReleaseTracker: Send + Sync {
    /// Completes when operations started on a topology older than `top_ver` finish.
    fn partition_release_future(&self, top_ver: TopologyVersion) -> GridFuture<(), ExchangeError>;

    /// Completes when explicit locks taken on an older topology are released.
    fn lock_release_future(&self, top_ver: TopologyVersion) -> GridFuture<(), ExchangeError>;

    /// Drops explicit locks held on behalf of a departed node.
    fn remove_explicit_node_locks(&self, node_id: &str);

    /// Human-readable descriptions of what is still in flight, for diagnostics.
    fn pending_objects(&self, top_ver: TopologyVersion) -> Vec<String>;
}

/// Everything an exchange future needs from its node.
pub struct ExchangeContext {
    pub local_node: ClusterNode,
    pub config: Arc<ExchangeConfig>,
    pub registry: Arc<CacheRegistry>,
    pub affinity: Arc<AffinityManager>,
    pub transport: Arc<dyn ExchangeTransport>,
    pub discovery: Arc<dyn DiscoveryService>,
    pub release: Arc<dyn PartitionReleaseTracker>,
    pub failure: Arc<dyn FailureHandler>,
    pub runtime: Handle,
}

impl ExchangeContext {
    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.local_node.id
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        self.local_node.client
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<VersionGenerator> {
        self.registry.versions()
    }

    /// Sends `msg` to `node`, compressed when both sides support it.
    ///
    /// # Errors
    ///
    /// Whatever the transport reports.
    pub fn send(&self, node: &ClusterNode, msg: &ExchangeMessage) -> Result<(), TransportError> {
        let compress =
            self.config.compress_messages && self.local_node.supports_compression() && node.supports_compression();
        self.transport.send(node, msg, compress)
    }
}

impl std::fmt::Debug for ExchangeContext {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeContext")
            .field("local_node", &self.local_node.id)
            .field("client", &self.local_node.client)
            .finish_non_exhaustive()
    }
}
