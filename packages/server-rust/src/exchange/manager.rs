//! Registry of exchange futures and the entry point for discovery events
//! and exchange messages.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::{Mutex, RwLock};
use partex_core::{ExchangeId, TopologyVersion};
use tracing::{debug, info, warn};

use super::context::{ExchangeContext, ExecContext};
use super::future::ExchangeFuture;
use crate::cache::{CacheConfig, CacheRegistry, RequestFuture};
use crate::cluster::{CacheChangeBatch, CacheChangeRequest, ClusterNode, CustomMessage, DiscoCache, DiscoveryEvent, ExchangeMessage};
use crate::error::ExchangeError;
use crate::future::{GridFuture, ReconnectFuture};
use crate::topology::ClientTopology;

/// Finished exchanges kept around to answer late messages.
pub const EXCHANGE_HISTORY_SIZE: usize = 32;

/// Creates one [`ExchangeFuture`] per topology change and routes traffic to it.
pub struct ExchangeManager {
    ctx: Arc<ExchangeContext>,
    self_ref: Weak<ExchangeManager>,
    counter: AtomicU64,
    futures: DashMap<ExchangeId, Arc<ExchangeFuture>>,
    last_finished: RwLock<TopologyVersion>,
    /// Most recently queued exchange; the next one initializes after it completes.
    last_queued: Mutex<Option<Arc<ExchangeFuture>>>,
    reconnect: Mutex<Option<GridFuture<(), ExchangeError>>>,
}

impl ExchangeManager {
    #[must_use]
    pub fn new(ctx: Arc<ExchangeContext>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            ctx,
            self_ref: self_ref.clone(),
            counter: AtomicU64::new(0),
            futures: DashMap::new(),
            last_finished: RwLock::new(TopologyVersion::NONE),
            last_queued: Mutex::new(None),
            reconnect: Mutex::new(None),
        })
    }

    #[must_use]
    pub fn context(&self) -> &Arc<ExchangeContext> {
        &self.ctx
    }

    #[must_use]
    pub fn registry(&self) -> &Arc<CacheRegistry> {
        &self.ctx.registry
    }

    #[must_use]
    pub fn last_finished_version(&self) -> TopologyVersion {
        *self.last_finished.read()
    }

    #[must_use]
    pub fn future(&self, exch_id: &ExchangeId) -> Option<Arc<ExchangeFuture>> {
        self.futures.get(exch_id).map(|f| Arc::clone(f.value()))
    }

    /// Unfinished exchanges, oldest first.
    #[must_use]
    pub fn pending_futures(&self) -> Vec<Arc<ExchangeFuture>> {
        let mut pending: Vec<Arc<ExchangeFuture>> = self
            .futures
            .iter()
            .filter(|f| !f.value().is_done())
            .map(|f| Arc::clone(f.value()))
            .collect();
        pending.sort_by(|a, b| a.exchange_id().cmp(b.exchange_id()));
        pending
    }

    /// Client-side view of a group's partition map.
    #[must_use]
    pub fn client_topology(&self, group_id: i32) -> Arc<ClientTopology> {
        self.ctx.registry.client_topology(group_id)
    }

    fn get_or_create(&self, exch_id: &ExchangeId) -> Arc<ExchangeFuture> {
        let fut = self
            .futures
            .entry(exch_id.clone())
            .or_insert_with(|| {
                let fut = ExchangeFuture::new(exch_id.clone(), Arc::clone(&self.ctx));
                let mgr = self.self_ref.clone();
                let id = exch_id.clone();
                fut.done_future().listen(move |res| {
                    if let Some(mgr) = mgr.upgrade() {
                        mgr.on_exchange_done(&id, res);
                    }
                });
                fut
            })
            .clone();
        fut
    }

    // -----------------------------------------------------------------------
    // Discovery
    // -----------------------------------------------------------------------

    /// Handles a discovery event; returns the exchange it started or was routed to.
    pub fn on_discovery_event(
        &self,
        event: DiscoveryEvent,
        disco: Arc<DiscoCache>,
        exec: ExecContext,
    ) -> Option<Arc<ExchangeFuture>> {
        if event.kind.is_left() {
            for fut in self.pending_futures() {
                fut.on_node_left(event.node.clone());
            }
        }

        match &event.message {
            Some(CustomMessage::CacheChangeFailure(msg)) => {
                let fut = self.future(&msg.exchange_id);
                match &fut {
                    Some(fut) => fut.on_cache_change_failure(msg.clone()),
                    None => debug!(exch_id = %msg.exchange_id, "cache change failure for unknown exchange"),
                }
                return fut;
            }
            Some(CustomMessage::AffinityChange(msg)) if !msg.exchange_needed() => {
                let fut = msg.exchange_id.as_ref().and_then(|id| self.future(id));
                match &fut {
                    Some(fut) => fut.on_affinity_change_message(msg.clone()),
                    None => debug!(exch_id = ?msg.exchange_id, "affinity change for unknown exchange"),
                }
                return fut;
            }
            _ => {}
        }

        let counter = self.counter.fetch_add(1, Ordering::Relaxed) + 1;
        let exch_id = ExchangeId::new(event.topology_version, event.node.id.clone(), event.kind, counter);
        let fut = self.get_or_create(&exch_id);
        fut.on_event(event, disco);
        self.enqueue(&fut, exec);
        Some(fut)
    }

    /// Exchanges initialize one at a time in discovery order.
    fn enqueue(&self, fut: &Arc<ExchangeFuture>, exec: ExecContext) {
        let prev = self.last_queued.lock().replace(Arc::clone(fut));
        match prev {
            Some(prev) if !prev.is_done() && !Arc::ptr_eq(&prev, fut) => {
                debug!(exch_id = %fut.exchange_id(), prev = %prev.exchange_id(), "exchange queued behind previous one");
                let next = Arc::clone(fut);
                prev.done_future().listen(move |_| next.init(ExecContext::Discovery));
            }
            _ => fut.init(exec),
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    /// Routes an exchange message from `from` to its future.
    pub fn on_message(&self, from: ClusterNode, msg: ExchangeMessage) {
        let Some(exch_id) = msg.exchange_id().cloned() else {
            debug!(node = %from.id, "ignoring full map without exchange id");
            return;
        };
        if exch_id.topology_version <= self.last_finished_version() && !self.futures.contains_key(&exch_id) {
            debug!(exch_id = %exch_id, node = %from.id, "ignoring message for finished exchange");
            return;
        }

        let fut = self.get_or_create(&exch_id);
        match msg {
            ExchangeMessage::PartitionsSingle(single) => fut.on_receive_single(from, single),
            ExchangeMessage::PartitionsFull(full) => fut.on_receive_full(from, full),
            ExchangeMessage::PartitionsSingleRequest(_) => fut.on_partition_request(from),
        }
    }

    /// Done callback of every future.
    pub fn on_exchange_done(&self, exch_id: &ExchangeId, res: &Result<TopologyVersion, ExchangeError>) {
        if let Ok(top_ver) = res {
            let mut last = self.last_finished.write();
            if *top_ver > *last {
                *last = *top_ver;
            }
        }
        debug!(exch_id = %exch_id, ok = res.is_ok(), "exchange future done");
        self.trim_history();
    }

    fn trim_history(&self) {
        let excess = self.futures.len().saturating_sub(EXCHANGE_HISTORY_SIZE);
        if excess == 0 {
            return;
        }
        let mut done: Vec<ExchangeId> = self
            .futures
            .iter()
            .filter(|f| f.value().is_done())
            .map(|f| f.key().clone())
            .collect();
        done.sort();
        for id in done.into_iter().take(excess) {
            self.futures.remove(&id);
        }
    }

    // -----------------------------------------------------------------------
    // Cache requests
    // -----------------------------------------------------------------------

    /// Asks the cluster to start `config`; completes once the exchange that
    /// started it finishes.
    pub fn start_cache(&self, config: CacheConfig) -> RequestFuture {
        self.submit(CacheChangeRequest::start(config, self.ctx.local_node_id()))
    }

    /// Starts `config` on the local client node only.
    pub fn start_client_cache(&self, config: CacheConfig) -> RequestFuture {
        let mut req = CacheChangeRequest::start(config, self.ctx.local_node_id());
        req.client_start_only = true;
        self.submit(req)
    }

    pub fn stop_cache(&self, name: &str) -> RequestFuture {
        self.submit(CacheChangeRequest::stop(name, self.ctx.local_node_id()))
    }

    fn submit(&self, req: CacheChangeRequest) -> RequestFuture {
        let id = req.request_id;
        let cache = req.cache_name.clone();
        let fut = self.ctx.registry.register_request(id);
        let msg = CustomMessage::CacheChange(CacheChangeBatch { requests: vec![req] });
        if let Err(e) = self.ctx.discovery.send_custom_event(msg) {
            warn!(cache = %cache, error = %e, "failed to send cache change request");
            self.ctx.registry.complete_request(id, Err(e.into()));
        }
        fut
    }

    // -----------------------------------------------------------------------
    // Lifecycle
    // -----------------------------------------------------------------------

    pub fn on_node_stop(&self) {
        let futures: Vec<Arc<ExchangeFuture>> = self.futures.iter().map(|f| Arc::clone(f.value())).collect();
        for fut in futures {
            fut.on_node_stop();
        }
        self.ctx.registry.on_node_stop();
        if let Some(reconnect) = self.reconnect.lock().take() {
            reconnect.on_done(Err(ExchangeError::NodeStopping));
        }
        info!(node = %self.ctx.local_node_id(), "exchange manager stopped");
    }

    /// Client lost the cluster. Pending exchanges fail; cache operations see
    /// the returned future until [`on_reconnected`](Self::on_reconnected).
    pub fn on_disconnected(&self) -> ReconnectFuture {
        let inner = self
            .reconnect
            .lock()
            .get_or_insert_with(GridFuture::new)
            .clone();
        let reconnect = ReconnectFuture::new(inner);
        for fut in self.pending_futures() {
            fut.on_done(Err(ExchangeError::ClientDisconnected));
        }
        self.ctx.registry.on_disconnected(&reconnect);
        warn!(node = %self.ctx.local_node_id(), "client node disconnected");
        reconnect
    }

    /// Client rejoined; caches in `stopped` were lost meanwhile.
    pub fn on_reconnected(&self, stopped: &[String]) {
        self.ctx.registry.on_reconnected(stopped);
        if let Some(reconnect) = self.reconnect.lock().take() {
            reconnect.on_done(Ok(()));
        }
        info!(node = %self.ctx.local_node_id(), stopped = stopped.len(), "client node reconnected");
    }
}

impl std::fmt::Debug for ExchangeManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ExchangeManager")
            .field("node", &self.ctx.local_node_id())
            .field("futures", &self.futures.len())
            .field("last_finished", &self.last_finished_version())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use partex_core::EventKind;

    use super::*;
    use crate::cluster::PartitionsSinglePayload;
    use crate::exchange::test_support::{harness, Harness};

    fn ver(major: u64) -> TopologyVersion {
        TopologyVersion::new(major, 0)
    }

    fn disco(major: u64, ids: &[&str]) -> Arc<DiscoCache> {
        let nodes = ids
            .iter()
            .zip(1u64..)
            .map(|(id, order)| ClusterNode::server(*id, order))
            .collect();
        Arc::new(DiscoCache::new(ver(major), nodes))
    }

    fn join(mgr: &ExchangeManager, major: u64, node: &str, ids: &[&str]) -> Arc<ExchangeFuture> {
        let snapshot = disco(major, ids);
        let joined = snapshot.node(node).cloned().unwrap();
        mgr.on_discovery_event(
            DiscoveryEvent::new(EventKind::NodeJoined, joined, ver(major)),
            snapshot,
            ExecContext::Worker,
        )
        .unwrap()
    }

    fn single(exch_id: ExchangeId) -> ExchangeMessage {
        ExchangeMessage::PartitionsSingle(PartitionsSinglePayload {
            exchange_id: exch_id,
            last_version: None,
            client: false,
            partitions: Default::default(),
            update_counters: Default::default(),
            error: None,
        })
    }

    fn manager(h: &Harness) -> Arc<ExchangeManager> {
        ExchangeManager::new(Arc::clone(&h.ctx))
    }

    // -- discovery --

    #[test]
    fn join_event_runs_exchange_and_records_version() {
        let h = harness("n1");
        let mgr = manager(&h);
        let fut = join(&mgr, 1, "n1", &["n1"]);

        assert!(fut.is_done());
        assert_eq!(mgr.last_finished_version(), ver(1));
        assert!(mgr.pending_futures().is_empty());
        assert!(mgr.future(fut.exchange_id()).is_some());
    }

    #[test]
    fn early_single_is_replayed_after_init() {
        let h = harness("n1");
        let mgr = manager(&h);
        let exch_id = ExchangeId::new(ver(2), "n2", EventKind::NodeJoined, 0);

        mgr.on_message(ClusterNode::server("n2", 2), single(exch_id.clone()));
        let early = mgr.future(&exch_id).unwrap();
        assert!(!early.is_done());

        let fut = join(&mgr, 2, "n2", &["n1", "n2"]);
        assert!(Arc::ptr_eq(&early, &fut));
        assert_eq!(fut.result(), Some(Ok(ver(2))));
    }

    #[test]
    fn stale_messages_are_ignored() {
        let h = harness("n1");
        let mgr = manager(&h);
        join(&mgr, 1, "n1", &["n1"]);
        join(&mgr, 2, "n2", &["n1", "n2"]);
        let before = mgr.futures.len();

        mgr.on_message(
            ClusterNode::server("n9", 9),
            single(ExchangeId::new(ver(1), "n9", EventKind::NodeJoined, 0)),
        );
        assert_eq!(mgr.futures.len(), before);
    }

    #[test]
    fn node_left_reaches_pending_exchanges() {
        let h = harness("n2");
        let mgr = manager(&h);
        let first = join(&mgr, 3, "n3", &["n1", "n2", "n3"]);
        assert_eq!(first.coordinator().as_deref(), Some("n1"));

        mgr.on_discovery_event(
            DiscoveryEvent::new(EventKind::NodeFailed, ClusterNode::server("n1", 1), ver(4)),
            disco(4, &["n2", "n3"]),
            ExecContext::Worker,
        );
        assert!(first.is_coordinator());
        assert_eq!(first.remaining().into_iter().collect::<Vec<_>>(), vec!["n3"]);
    }

    #[test]
    fn history_is_bounded() {
        let h = harness("n1");
        let mgr = manager(&h);
        let total = u64::try_from(EXCHANGE_HISTORY_SIZE).unwrap() + 5;
        for major in 1..=total {
            join(&mgr, major, "n1", &["n1"]);
        }
        assert!(mgr.futures.len() <= EXCHANGE_HISTORY_SIZE);
        assert_eq!(mgr.last_finished_version(), ver(total));
    }

    // -- cache requests --

    #[test]
    fn start_cache_completes_after_its_exchange() {
        let h = harness("n1");
        let mgr = manager(&h);
        join(&mgr, 1, "n1", &["n1"]);

        let request = mgr.start_cache(CacheConfig::new("c").with_partitions(4));
        assert!(!request.is_done());

        let events = h.discovery.events();
        assert_eq!(events.len(), 1);
        let node = ClusterNode::server("n1", 1);
        let top_ver = TopologyVersion::new(1, 1);
        let fut = mgr
            .on_discovery_event(
                DiscoveryEvent::custom(node.clone(), top_ver, events[0].clone()),
                Arc::new(DiscoCache::new(top_ver, vec![node])),
                ExecContext::Worker,
            )
            .unwrap();

        assert_eq!(fut.result(), Some(Ok(top_ver)));
        assert_eq!(request.result(), Some(Ok(())));
        assert!(mgr.registry().cache("c").is_some());
    }

    #[test]
    fn stop_cache_removes_it() {
        let h = harness("n1");
        let mgr = manager(&h);
        h.ctx
            .registry
            .start_cache(&CacheConfig::new("c").with_partitions(4), ver(1))
            .unwrap();
        join(&mgr, 1, "n1", &["n1"]);

        let request = mgr.stop_cache("c");
        let msg = h.discovery.events().pop().unwrap();
        let node = ClusterNode::server("n1", 1);
        let top_ver = TopologyVersion::new(1, 1);
        mgr.on_discovery_event(
            DiscoveryEvent::custom(node.clone(), top_ver, msg),
            Arc::new(DiscoCache::new(top_ver, vec![node])),
            ExecContext::Worker,
        );

        assert_eq!(request.result(), Some(Ok(())));
        assert!(mgr.registry().cache("c").is_none());
    }

    // -- lifecycle --

    #[test]
    fn disconnect_fails_pending_work_until_reconnect() {
        let h = harness("n2");
        let mgr = manager(&h);
        let fut = join(&mgr, 2, "n2", &["n1", "n2"]);
        let request = mgr.start_cache(CacheConfig::new("c"));
        assert!(!fut.is_done());

        let reconnect = mgr.on_disconnected();
        assert!(!reconnect.is_done());
        assert_eq!(fut.result(), Some(Err(ExchangeError::ClientDisconnected)));
        assert_eq!(request.result(), Some(Err(ExchangeError::ClientDisconnected)));

        mgr.on_reconnected(&[]);
        assert_eq!(reconnect.result(), Some(Ok(())));
    }

    #[test]
    fn node_stop_fails_everything() {
        let h = harness("n2");
        let mgr = manager(&h);
        let fut = join(&mgr, 2, "n2", &["n1", "n2"]);
        mgr.on_node_stop();
        assert_eq!(fut.result(), Some(Err(ExchangeError::NodeStopping)));
    }
}
