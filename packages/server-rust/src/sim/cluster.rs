//! Multi-node cluster running in one process.

use std::collections::{BTreeMap, BTreeSet};
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use partex_core::{PartitionFullMap, PartitionState, TopologyVersion, VersionGenerator};
use tokio::runtime::Handle;
use tracing::info;

use super::discovery::SimDiscovery;
use super::network::{SimNetwork, SimTransport};
use super::release::{RecordingFailureHandler, SimReleaseTracker};
use crate::affinity::AffinityManager;
use crate::cache::{CacheConfig, CacheRegistry, RegistryServices, RequestFuture};
use crate::cluster::{ClusterNode, ATTR_EXCHANGE_COMPRESSION, ATTR_EXCHANGE_ROLLBACK};
use crate::config::{ExchangeConfig, PartitionConfig};
use crate::error::{CacheError, TransportError};
use crate::exchange::{ExchangeContext, ExchangeManager};
use crate::gateway::LoggingEvictionSink;
use crate::partition::{DataStoreManager, MemoryDataStoreManager, TaskEvictor};

/// One simulated node and its handles.
#[derive(Debug)]
pub struct SimNode {
    node: ClusterNode,
    manager: Arc<ExchangeManager>,
    release: Arc<SimReleaseTracker>,
    failure: Arc<RecordingFailureHandler>,
}

impl SimNode {
    #[must_use]
    pub fn id(&self) -> &str {
        &self.node.id
    }

    #[must_use]
    pub fn node(&self) -> &ClusterNode {
        &self.node
    }

    #[must_use]
    pub fn manager(&self) -> &Arc<ExchangeManager> {
        &self.manager
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        self.manager.registry()
    }

    #[must_use]
    pub fn release(&self) -> &Arc<SimReleaseTracker> {
        &self.release
    }

    #[must_use]
    pub fn failure(&self) -> &Arc<RecordingFailureHandler> {
        &self.failure
    }

    #[must_use]
    pub fn last_finished_version(&self) -> TopologyVersion {
        self.manager.last_finished_version()
    }

    /// State of every local partition of `cache`'s group.
    #[must_use]
    pub fn partition_states(&self, cache: &str) -> BTreeMap<u32, PartitionState> {
        self.registry()
            .cache(cache)
            .and_then(|c| c.topology().cloned())
            .map(|top| {
                top.local_partitions()
                    .iter()
                    .map(|p| (p.id(), p.state()))
                    .collect()
            })
            .unwrap_or_default()
    }

    /// Partitions of `cache`'s group this node considers lost.
    #[must_use]
    pub fn lost_partitions(&self, cache: &str) -> BTreeSet<u32> {
        self.registry()
            .cache(cache)
            .and_then(|c| c.topology().map(|top| top.lost_partitions()))
            .unwrap_or_default()
    }

    /// Cluster-wide partition map of `cache`'s group as this node sees it.
    #[must_use]
    pub fn full_map(&self, cache: &str) -> Option<PartitionFullMap> {
        let group_id = CacheConfig::new(cache).group_id();
        let registry = self.registry();
        match registry.cache(cache).and_then(|c| c.topology().cloned()) {
            Some(top) => Some(top.full_map()),
            None => registry.existing_client_topology(group_id).map(|t| t.full_map()),
        }
    }

    /// Writes `key` while holding an in-flight operation on the current version.
    ///
    /// # Errors
    ///
    /// Whatever the cache reports: stopped gateway, invalid cache, or no local partition.
    pub fn put(&self, cache: &str, key: &str, value: &[u8]) -> Result<bool, CacheError> {
        let ctx = self
            .registry()
            .cache(cache)
            .ok_or_else(|| CacheError::NoSuchCache(cache.to_string()))?;
        let _op = self
            .release
            .begin_operation(self.last_finished_version(), format!("put {cache}/{key}"));
        ctx.put(key, value.to_vec())
    }

    /// # Errors
    ///
    /// Whatever the cache reports.
    pub fn get(&self, cache: &str, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let ctx = self
            .registry()
            .cache(cache)
            .ok_or_else(|| CacheError::NoSuchCache(cache.to_string()))?;
        ctx.get(key)
    }
}

/// In-process cluster: shared network and discovery plus a set of nodes.
pub struct SimCluster {
    runtime: Handle,
    network: Arc<SimNetwork>,
    discovery: Arc<SimDiscovery>,
    exchange: ExchangeConfig,
    partition: PartitionConfig,
    nodes: Mutex<BTreeMap<String, Arc<SimNode>>>,
    next_order: AtomicU64,
}

impl SimCluster {
    #[must_use]
    pub fn new(runtime: Handle, exchange: ExchangeConfig, partition: PartitionConfig) -> Self {
        Self {
            network: SimNetwork::new(runtime.clone()),
            discovery: SimDiscovery::new(),
            runtime,
            exchange,
            partition,
            nodes: Mutex::new(BTreeMap::new()),
            next_order: AtomicU64::new(0),
        }
    }

    #[must_use]
    pub fn network(&self) -> &Arc<SimNetwork> {
        &self.network
    }

    #[must_use]
    pub fn discovery(&self) -> &Arc<SimDiscovery> {
        &self.discovery
    }

    #[must_use]
    pub fn topology_version(&self) -> TopologyVersion {
        self.discovery.version()
    }

    /// Starts a server node and submits its join.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if discovery is gone.
    pub fn start_node(&self, id: &str) -> Result<Arc<SimNode>, TransportError> {
        self.start(id, false)
    }

    /// # Errors
    ///
    /// [`TransportError::Io`] if discovery is gone.
    pub fn start_client(&self, id: &str) -> Result<Arc<SimNode>, TransportError> {
        self.start(id, true)
    }

    fn start(&self, id: &str, client: bool) -> Result<Arc<SimNode>, TransportError> {
        let order = self.next_order.fetch_add(1, Ordering::Relaxed) + 1;
        let node = if client {
            ClusterNode::client(id, order)
        } else {
            ClusterNode::server(id, order)
        }
        .with_attribute(ATTR_EXCHANGE_ROLLBACK, self.exchange.rollback_supported.to_string())
        .with_attribute(ATTR_EXCHANGE_COMPRESSION, self.exchange.compress_messages.to_string());

        let services = RegistryServices::new(
            id,
            client,
            Arc::new(TaskEvictor::new(self.runtime.clone(), self.partition.evict_poll_interval())),
            Arc::new(VersionGenerator::system(order)),
            Arc::new(self.partition.clone()),
            Arc::new(|_: i32| Arc::new(MemoryDataStoreManager::new()) as Arc<dyn DataStoreManager>),
            Arc::new(LoggingEvictionSink),
        );
        let registry = Arc::new(CacheRegistry::new(services));
        let affinity = Arc::new(AffinityManager::new(Arc::clone(&registry), self.exchange.late_affinity));
        let release = Arc::new(SimReleaseTracker::new());
        let failure = Arc::new(RecordingFailureHandler::default());

        let ctx = Arc::new(ExchangeContext {
            local_node: node.clone(),
            config: Arc::new(self.exchange.clone()),
            registry,
            affinity,
            transport: Arc::new(SimTransport::new(Arc::clone(&self.network), node.clone())),
            discovery: Arc::new(self.discovery.handle(id)),
            release: release.clone(),
            failure: failure.clone(),
            runtime: self.runtime.clone(),
        });
        let manager = ExchangeManager::new(ctx);
        self.network.register(id, &manager);

        let sim_node = Arc::new(SimNode {
            node: node.clone(),
            manager: Arc::clone(&manager),
            release,
            failure,
        });
        self.nodes.lock().insert(id.to_string(), Arc::clone(&sim_node));
        self.discovery.join(node, &manager)?;
        info!(node = id, client, order, "started simulated node");
        Ok(sim_node)
    }

    /// Crashes a node: it vanishes from the network and discovery reports it failed.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if discovery is gone.
    pub fn kill_node(&self, id: &str) -> Result<(), TransportError> {
        self.remove(id, true)
    }

    /// Graceful stop, reported as a left node.
    ///
    /// # Errors
    ///
    /// [`TransportError::Io`] if discovery is gone.
    pub fn stop_node(&self, id: &str) -> Result<(), TransportError> {
        self.remove(id, false)
    }

    fn remove(&self, id: &str, failed: bool) -> Result<(), TransportError> {
        let node = self.nodes.lock().remove(id);
        self.network.unregister(id);
        self.discovery.leave(id, failed)?;
        if let Some(node) = node {
            node.manager.on_node_stop();
        }
        Ok(())
    }

    #[must_use]
    pub fn node(&self, id: &str) -> Option<Arc<SimNode>> {
        self.nodes.lock().get(id).cloned()
    }

    /// Live nodes ordered by id.
    #[must_use]
    pub fn nodes(&self) -> Vec<Arc<SimNode>> {
        self.nodes.lock().values().cloned().collect()
    }

    /// Starts `config` on behalf of node `via`.
    ///
    /// # Errors
    ///
    /// [`TransportError::NodeLeft`] if `via` is not running.
    pub fn start_cache(&self, via: &str, config: CacheConfig) -> Result<RequestFuture, TransportError> {
        let node = self
            .node(via)
            .ok_or_else(|| TransportError::NodeLeft { node_id: via.to_string() })?;
        Ok(node.manager.start_cache(config))
    }

    /// `true` once every live node finished an exchange at or after `ver`.
    #[must_use]
    pub fn settled_at(&self, ver: TopologyVersion) -> bool {
        self.nodes().iter().all(|n| n.last_finished_version() >= ver)
    }

    /// Waits until discovery is idle at some version and every node finished it.
    pub async fn wait_for_version(&self, ver: TopologyVersion, timeout: Duration) -> bool {
        wait_until(timeout, || self.topology_version() >= ver && self.settled_at(ver)).await
    }

    /// Waits until the current topology version is finished on every node.
    pub async fn await_settled(&self, timeout: Duration) -> bool {
        wait_until(timeout, || self.settled_at(self.topology_version())).await
    }
}

impl std::fmt::Debug for SimCluster {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimCluster")
            .field("nodes", &self.nodes.lock().keys().collect::<Vec<_>>())
            .field("discovery", &self.discovery)
            .finish_non_exhaustive()
    }
}

/// Polls `cond` every few milliseconds until it holds or `timeout` elapses.
pub async fn wait_until(timeout: Duration, mut cond: impl FnMut() -> bool) -> bool {
    let deadline = tokio::time::Instant::now() + timeout;
    loop {
        if cond() {
            return true;
        }
        if tokio::time::Instant::now() >= deadline {
            return false;
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
}

/// Awaits `fut` with a timeout, mapping expiry to `None`.
pub async fn with_timeout<F: Future>(timeout: Duration, fut: F) -> Option<F::Output> {
    tokio::time::timeout(timeout, fut).await.ok()
}
