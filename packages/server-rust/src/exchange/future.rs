//! One partition exchange round.
//!
//! An [`ExchangeFuture`] is created per topology change. Once the discovery
//! event is delivered, [`init`](ExchangeFuture::init) classifies the change,
//! updates affinity and partition topologies, and for a full exchange waits
//! for in-flight operations before swapping partition maps: every server
//! sends its single map to the coordinator (the oldest live server), which
//! merges them and broadcasts the full map. Coordinator failover, rollback of
//! failed cache starts and centralized affinity all hang off the same state.
//!
//! Messages that arrive before `init` finishes are parked on the init future
//! and replayed in arrival order once it completes.

use std::collections::{BTreeMap, BTreeSet};
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::time::{Duration, Instant};

use parking_lot::{Mutex, RwLock};
use partex_core::{CacheVersion, EventKind, ExchangeId, TopologyVersion};
use tracing::{debug, error, info, warn};

use super::actions::ExchangeActions;
use super::context::{ExchangeContext, ExecContext};
use super::release::wait_partition_release;
use crate::cluster::{
    AffinityChangePayload, CacheChangeBatch, CacheChangeFailurePayload, CacheChangeKind, ClusterNode,
    CustomMessage, DiscoCache, DiscoveryEvent, ExchangeMessage, PartitionsFullPayload,
    PartitionsSinglePayload, PartitionsSingleRequestPayload, ATTR_EXCHANGE_ROLLBACK,
};
use crate::error::{ExchangeError, TransportError};
use crate::future::GridFuture;

/// Completion of an exchange: the topology version it produced.
pub type ExchangeDone = GridFuture<TopologyVersion, ExchangeError>;

/// How much of the cluster takes part in an exchange.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExchangeKind {
    /// Every server swaps partition maps through the coordinator.
    All,
    /// Applied on the local node only.
    Client,
    /// Nothing to do beyond moving to the new topology version.
    None,
}

struct EventData {
    event: DiscoveryEvent,
    disco: Arc<DiscoCache>,
}

#[derive(Default)]
struct MuxState {
    crd: Option<ClusterNode>,
    srv_nodes: Vec<ClusterNode>,
    /// Servers the coordinator still expects a single map from.
    remaining: BTreeSet<String>,
    /// Coordinator: processed single maps. Others: maps buffered in case this node takes over.
    single_msgs: BTreeMap<String, PartitionsSinglePayload>,
    /// Full maps from nodes not (yet) known as coordinator.
    full_msgs: BTreeMap<String, PartitionsFullPayload>,
    all_received: bool,
    rollback_sent: bool,
}

/// What to do after a node left, decided under the mux.
enum LeftAction {
    Nothing,
    AllReceived,
    NoServers,
    BecameCoordinator { requests: Vec<ClusterNode>, all_received: bool },
    NewCoordinator { crd: ClusterNode, full: Option<PartitionsFullPayload> },
}

/// State machine of one exchange round.
pub struct ExchangeFuture {
    exch_id: ExchangeId,
    ctx: Arc<ExchangeContext>,
    self_ref: Weak<ExchangeFuture>,

    event: OnceLock<EventData>,
    event_latch: GridFuture<(), ExchangeError>,
    init_started: AtomicBool,
    init_ts: OnceLock<Instant>,
    created: Instant,

    /// Completes when `init` returns; messages wait on it.
    init_fut: GridFuture<(), ExchangeError>,
    done: ExchangeDone,
    completing: AtomicBool,

    mux: Mutex<MuxState>,
    kind: OnceLock<ExchangeKind>,
    actions: RwLock<ExchangeActions>,
    new_groups: Mutex<Vec<i32>>,
    centralized: AtomicBool,

    last_version: Mutex<Option<CacheVersion>>,
    global_errors: Mutex<BTreeMap<String, String>>,
    validation: RwLock<BTreeMap<String, ExchangeError>>,
}

impl ExchangeFuture {
    #[must_use]
    pub fn new(exch_id: ExchangeId, ctx: Arc<ExchangeContext>) -> Arc<Self> {
        Arc::new_cyclic(|self_ref| Self {
            exch_id,
            ctx,
            self_ref: self_ref.clone(),
            event: OnceLock::new(),
            event_latch: GridFuture::new(),
            init_started: AtomicBool::new(false),
            init_ts: OnceLock::new(),
            created: Instant::now(),
            init_fut: GridFuture::new(),
            done: GridFuture::new(),
            completing: AtomicBool::new(false),
            mux: Mutex::new(MuxState::default()),
            kind: OnceLock::new(),
            actions: RwLock::new(ExchangeActions::default()),
            new_groups: Mutex::new(Vec::new()),
            centralized: AtomicBool::new(false),
            last_version: Mutex::new(None),
            global_errors: Mutex::new(BTreeMap::new()),
            validation: RwLock::new(BTreeMap::new()),
        })
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn exchange_id(&self) -> &ExchangeId {
        &self.exch_id
    }

    #[must_use]
    pub fn topology_version(&self) -> TopologyVersion {
        self.exch_id.topology_version
    }

    #[must_use]
    pub fn kind(&self) -> Option<ExchangeKind> {
        self.kind.get().copied()
    }

    #[must_use]
    pub fn discovery_event(&self) -> Option<&DiscoveryEvent> {
        self.event.get().map(|e| &e.event)
    }

    /// `true` if the local node currently coordinates this exchange.
    #[must_use]
    pub fn is_coordinator(&self) -> bool {
        self.mux
            .lock()
            .crd
            .as_ref()
            .is_some_and(|c| c.id == self.ctx.local_node.id)
    }

    #[must_use]
    pub fn coordinator(&self) -> Option<String> {
        self.mux.lock().crd.as_ref().map(|c| c.id.clone())
    }

    /// Servers the coordinator still waits for.
    #[must_use]
    pub fn remaining(&self) -> BTreeSet<String> {
        self.mux.lock().remaining.clone()
    }

    #[must_use]
    pub fn is_centralized(&self) -> bool {
        self.centralized.load(Ordering::Acquire)
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.done.is_done()
    }

    #[must_use]
    pub fn result(&self) -> Option<Result<TopologyVersion, ExchangeError>> {
        self.done.result()
    }

    #[must_use]
    pub fn done_future(&self) -> ExchangeDone {
        self.done.clone()
    }

    pub async fn wait(&self) -> Result<TopologyVersion, ExchangeError> {
        self.done.wait().await
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<TopologyVersion, ExchangeError>> {
        self.done.wait_timeout(timeout)
    }

    /// Time since `init` started, if it has.
    #[must_use]
    pub fn init_time(&self) -> Option<Duration> {
        self.init_ts.get().map(Instant::elapsed)
    }

    /// Highest cache version reported by the single maps merged so far.
    #[must_use]
    pub fn last_version(&self) -> Option<CacheVersion> {
        *self.last_version.lock()
    }

    /// Error an operation on `cache` must fail with after this exchange, if any.
    #[must_use]
    pub fn validate_cache(&self, cache: &str) -> Option<ExchangeError> {
        self.validation.read().get(cache).cloned()
    }

    // -----------------------------------------------------------------------
    // Init
    // -----------------------------------------------------------------------

    /// Hands the triggering discovery event and its membership snapshot to the future.
    pub fn on_event(&self, event: DiscoveryEvent, disco: Arc<DiscoCache>) {
        if self.event.set(EventData { event, disco }).is_ok() {
            self.event_latch.on_done(Ok(()));
        }
    }

    /// Runs the exchange. Called from the discovery thread it only schedules
    /// itself on the blocking pool; otherwise it blocks until the event is
    /// available. Only the first call does anything.
    pub fn init(&self, exec: ExecContext) {
        if exec == ExecContext::Discovery {
            let Some(me) = self.self_ref.upgrade() else { return };
            self.ctx.runtime.spawn_blocking(move || me.init(ExecContext::Worker));
            return;
        }
        if self.init_started.swap(true, Ordering::AcqRel) {
            return;
        }
        if self.done.is_done() {
            self.init_fut.on_done(Ok(()));
            return;
        }
        let _ = self.init_ts.set(Instant::now());

        if let Err(e) = self.event_latch.wait_blocking() {
            self.on_done(Err(e));
            return;
        }
        let Some(ev) = self.event.get() else {
            self.on_done(Err(ExchangeError::Internal("exchange event missing".into())));
            return;
        };

        info!(exch_id = %self.exch_id, evt = %ev.event.kind, node = %ev.event.node.id, "started exchange init");

        if let Err(e) = self.init0(ev) {
            self.on_init_error(ev, e);
        }
        self.init_fut.on_done(Ok(()));
    }

    fn init0(&self, ev: &EventData) -> Result<(), ExchangeError> {
        let local_id = self.ctx.local_node.id.clone();
        {
            let mut mux = self.mux.lock();
            mux.srv_nodes = ev
                .disco
                .server_nodes()
                .iter()
                .filter(|n| ev.disco.alive(&n.id) && self.ctx.discovery.alive(&n.id))
                .cloned()
                .collect();
            mux.crd = mux.srv_nodes.first().cloned();
            if mux.crd.as_ref().is_some_and(|c| c.id == local_id) {
                mux.remaining = mux
                    .srv_nodes
                    .iter()
                    .skip(1)
                    .map(|n| n.id.clone())
                    .collect();
            }
        }

        if self.exch_id.is_left() {
            self.ctx.release.remove_explicit_node_locks(&self.exch_id.node_id);
        }

        let kind = self.classify(ev)?;
        let _ = self.kind.set(kind);
        debug!(exch_id = %self.exch_id, ?kind, crd = ?self.coordinator(), "classified exchange");

        self.update_topologies(&ev.disco);

        match kind {
            ExchangeKind::All => self.distributed_exchange(),
            ExchangeKind::Client => {
                self.client_only_exchange(&ev.disco);
                Ok(())
            }
            ExchangeKind::None => {
                self.on_done(Ok(self.exch_id.topology_version));
                Ok(())
            }
        }
    }

    fn all_or_client(&self) -> ExchangeKind {
        if self.ctx.is_client() {
            ExchangeKind::Client
        } else {
            ExchangeKind::All
        }
    }

    fn classify(&self, ev: &EventData) -> Result<ExchangeKind, ExchangeError> {
        let top_ver = self.exch_id.topology_version;
        let affinity = &self.ctx.affinity;

        match (&ev.event.kind, &ev.event.message) {
            (EventKind::Custom, Some(CustomMessage::CacheChange(batch))) => self.on_cache_change_request(batch, &ev.disco),
            (EventKind::Custom, Some(CustomMessage::AffinityChange(msg))) => {
                affinity.on_change_affinity_message(top_ver, &msg.assignment_change);
                Ok(self.all_or_client())
            }
            (EventKind::Custom, _) => Ok(ExchangeKind::None),
            _ if ev.event.node.client => {
                affinity.on_client_event(top_ver);
                if ev.event.node.id == self.ctx.local_node.id {
                    Ok(ExchangeKind::Client)
                } else {
                    Ok(ExchangeKind::None)
                }
            }
            (EventKind::NodeJoined, _) => {
                affinity.on_server_join(top_ver, &ev.disco);
                Ok(self.all_or_client())
            }
            _ => {
                let centralized = affinity.on_server_left(&self.exch_id, &ev.disco);
                self.centralized.store(centralized, Ordering::Release);
                Ok(self.all_or_client())
            }
        }
    }

    fn on_cache_change_request(&self, batch: &CacheChangeBatch, disco: &DiscoCache) -> Result<ExchangeKind, ExchangeError> {
        let top_ver = self.exch_id.topology_version;
        let actions = ExchangeActions::from_batch(batch);
        let local = &self.ctx.local_node;

        let mut new_groups = Vec::new();
        let mut first_err = None;
        for req in actions.local_starts(local) {
            let Some(config) = req.config.as_ref() else {
                warn!(exch_id = %self.exch_id, cache = %req.cache_name, "cache start request without configuration");
                continue;
            };
            match self.ctx.registry.start_cache(config, top_ver) {
                Ok(started) if started.group_created => new_groups.push(started.cache.group_id()),
                Ok(_) => {}
                Err(e) => {
                    error!(exch_id = %self.exch_id, cache = %req.cache_name, error = %e, "failed to start cache");
                    first_err.get_or_insert(e);
                }
            }
        }

        self.ctx.affinity.on_cache_change_request(top_ver, disco, &new_groups);
        let kind = if actions.client_only() {
            if actions.initiated_by(&local.id) {
                ExchangeKind::Client
            } else {
                ExchangeKind::None
            }
        } else {
            self.all_or_client()
        };
        *self.new_groups.lock() = new_groups;
        *self.actions.write() = actions;

        match first_err {
            Some(e) => Err(e),
            None => Ok(kind),
        }
    }

    fn update_topologies(&self, disco: &Arc<DiscoCache>) {
        let top_ver = self.exch_id.topology_version;
        let registry = &self.ctx.registry;
        let local_crd = self.is_coordinator();

        for top in registry.topologies() {
            let group_id = top.group_id();
            if local_crd && registry.group_started_at(group_id) == Some(top_ver) {
                if let Some(client) = registry.existing_client_topology(group_id) {
                    top.import_full(&client.full_map(), &client.update_counters());
                }
            }
            top.update_topology_version(&self.exch_id, Arc::clone(disco));
        }
        for client in registry.client_topologies() {
            client.update_topology_version(&self.exch_id);
        }
    }

    fn distributed_exchange(&self) -> Result<(), ExchangeError> {
        wait_partition_release(&self.ctx, self.exch_id.topology_version)?;
        self.ctx.registry.hooks().before_exchange(&self.exch_id);

        let new_groups = self.new_groups.lock().clone();
        for top in self.ctx.registry.topologies() {
            top.before_exchange(&self.exch_id, new_groups.contains(&top.group_id()))?;
        }

        let crd = self.mux.lock().crd.clone();
        match crd {
            Some(crd) if crd.id == self.ctx.local_node.id => {
                self.check_all_received();
                Ok(())
            }
            Some(crd) => self.send_local_partitions(&crd, None),
            None => {
                self.on_done(Ok(self.exch_id.topology_version));
                Ok(())
            }
        }
    }

    fn client_only_exchange(&self, disco: &DiscoCache) {
        let no_servers = self.mux.lock().srv_nodes.is_empty();
        if self.is_centralized() && no_servers {
            warn!(exch_id = %self.exch_id, "no coordinator left, falling back to ideal affinity");
            self.ctx.affinity.ideal_fallback(self.exch_id.topology_version, disco);
        }
        self.on_done(Ok(self.exch_id.topology_version));
    }

    fn rollback_supported(&self) -> bool {
        let Some(ev) = self.event.get() else { return false };
        let starts = match &ev.event.message {
            Some(CustomMessage::CacheChange(batch)) => batch.requests.iter().any(|r| r.kind == CacheChangeKind::Start),
            _ => false,
        };
        starts && self.ctx.config.rollback_supported && ev.disco.check_attribute(ATTR_EXCHANGE_ROLLBACK)
    }

    fn on_init_error(&self, ev: &EventData, err: ExchangeError) {
        if err.is_reconnect_candidate() && self.ctx.discovery.reconnect_supported() {
            warn!(exch_id = %self.exch_id, error = %err, "exchange failed, local node must reconnect");
            self.on_done(Err(ExchangeError::NeedReconnect {
                node_id: self.ctx.local_node.id.clone(),
                reason: err.to_string(),
            }));
            return;
        }

        let crd = self.mux.lock().crd.clone();
        let local_crd = crd.as_ref().is_some_and(|c| c.id == self.ctx.local_node.id);

        if self.rollback_supported() {
            warn!(exch_id = %self.exch_id, evt = %ev.event.kind, error = %err, "exchange init failed, waiting for rollback");
            if local_crd {
                self.global_errors
                    .lock()
                    .insert(self.ctx.local_node.id.clone(), err.to_string());
                self.check_all_received();
            } else if let Some(crd) = crd {
                if let Err(e) = self.send_local_partitions(&crd, Some(err.to_string())) {
                    self.on_done(Err(e));
                }
            }
            return;
        }

        error!(exch_id = %self.exch_id, error = %err, "exchange init failed");
        self.on_done(Err(err));
        // The coordinator still expects this node's map.
        if let Some(crd) = crd.filter(|_| !local_crd && !self.ctx.is_client()) {
            if let Err(e) = self.send_local_partitions(&crd, None) {
                debug!(exch_id = %self.exch_id, error = %e, "failed to send single map after init failure");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Messages
    // -----------------------------------------------------------------------

    fn single_payload(&self, error: Option<String>) -> PartitionsSinglePayload {
        let topologies = self.ctx.registry.topologies();
        PartitionsSinglePayload {
            exchange_id: self.exch_id.clone(),
            last_version: Some(self.ctx.versions().last()),
            client: self.ctx.is_client(),
            partitions: topologies
                .iter()
                .map(|t| (t.group_id(), t.local_partition_map()))
                .collect(),
            update_counters: topologies
                .iter()
                .map(|t| (t.group_id(), t.local_update_counters()))
                .collect(),
            error,
        }
    }

    fn send_local_partitions(&self, node: &ClusterNode, error: Option<String>) -> Result<(), ExchangeError> {
        let msg = ExchangeMessage::PartitionsSingle(self.single_payload(error));
        debug!(exch_id = %self.exch_id, crd = %node.id, "sending local partitions");
        self.send_or_skip(node, &msg)
    }

    /// Sends `msg`, treating a departed target as success: its departure
    /// triggers its own handling.
    fn send_or_skip(&self, node: &ClusterNode, msg: &ExchangeMessage) -> Result<(), ExchangeError> {
        match self.ctx.send(node, msg) {
            Ok(()) => Ok(()),
            Err(TransportError::NodeLeft { node_id }) => {
                debug!(exch_id = %self.exch_id, node = %node_id, "skipped send to departed node");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    fn full_payload(&self) -> PartitionsFullPayload {
        let registry = &self.ctx.registry;
        let mut partitions = BTreeMap::new();
        let mut update_counters = BTreeMap::new();
        for top in registry.topologies() {
            partitions.insert(top.group_id(), top.settled_full_map());
            update_counters.insert(top.group_id(), top.update_counters());
        }
        for client in registry.client_topologies() {
            partitions.entry(client.group_id()).or_insert_with(|| client.full_map());
            update_counters
                .entry(client.group_id())
                .or_insert_with(|| client.update_counters());
        }
        PartitionsFullPayload {
            exchange_id: Some(self.exch_id.clone()),
            last_version: Some(self.ctx.versions().last()),
            partitions,
            update_counters,
        }
    }

    fn apply_full(&self, msg: &PartitionsFullPayload) {
        let registry = &self.ctx.registry;
        for (group_id, full) in &msg.partitions {
            let counters = msg.update_counters.get(group_id);
            match registry.topology(*group_id) {
                Some(top) => {
                    top.update_full(msg.exchange_id.as_ref(), full, counters);
                }
                None => {
                    registry
                        .client_topology(*group_id)
                        .update_full(msg.exchange_id.as_ref(), full, counters);
                }
            }
        }
        if let Some(ver) = msg.last_version {
            self.ctx.versions().on_received(ver);
        }
    }

    /// Single map from `from`.
    pub fn on_receive_single(&self, from: ClusterNode, msg: PartitionsSinglePayload) {
        if self.done.is_done() {
            self.on_late_single(from, &msg);
            return;
        }
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| me.process_single(from, msg));
    }

    fn process_single(&self, from: ClusterNode, msg: PartitionsSinglePayload) {
        if self.done.is_done() {
            self.on_late_single(from, &msg);
            return;
        }
        let all_received = {
            let mut mux = self.mux.lock();
            let local_crd = mux.crd.as_ref().is_some_and(|c| c.id == self.ctx.local_node.id);
            if !local_crd {
                debug!(exch_id = %self.exch_id, node = %from.id, "buffering single map, not coordinator");
                mux.single_msgs.insert(from.id.clone(), msg);
                return;
            }
            if !mux.remaining.remove(&from.id) {
                debug!(exch_id = %self.exch_id, node = %from.id, "single map from node not in remaining");
            }
            self.merge_single(&from.id, &msg);
            mux.single_msgs.insert(from.id.clone(), msg);
            Self::take_all_received(&mut mux)
        };
        if all_received {
            self.on_all_received();
        }
    }

    fn take_all_received(mux: &mut MuxState) -> bool {
        if mux.remaining.is_empty() && !mux.all_received {
            mux.all_received = true;
            true
        } else {
            false
        }
    }

    fn check_all_received(&self) {
        let all_received = Self::take_all_received(&mut self.mux.lock());
        if all_received {
            self.on_all_received();
        }
    }

    /// Coordinator side: folds a node's single map into the topologies.
    fn merge_single(&self, node_id: &str, msg: &PartitionsSinglePayload) {
        if let Some(err) = &msg.error {
            self.global_errors
                .lock()
                .insert(node_id.to_string(), err.clone());
        }
        if !msg.client {
            if let Some(ver) = msg.last_version {
                let mut last = self.last_version.lock();
                if last.map_or(true, |cur| ver > cur) {
                    *last = Some(ver);
                }
            }
        }
        let registry = &self.ctx.registry;
        for (group_id, map) in &msg.partitions {
            let counters = msg.update_counters.get(group_id);
            match registry.topology(*group_id) {
                Some(top) => {
                    top.update_single(map, counters);
                }
                None => {
                    registry.client_topology(*group_id).update_single(map);
                }
            }
        }
    }

    /// A server missed the full map: resend it, with retries, unless the
    /// exchange was rolled back.
    fn on_late_single(&self, from: ClusterNode, msg: &PartitionsSinglePayload) {
        if msg.client || !self.is_coordinator() || self.mux.lock().rollback_sent {
            return;
        }
        if !matches!(self.done.result(), Some(Ok(_))) {
            return;
        }
        let full = ExchangeMessage::PartitionsFull(self.full_payload());
        let ctx = Arc::clone(&self.ctx);
        let exch_id = self.exch_id.clone();
        let retries = self.ctx.config.send_retry_count.max(1);
        let delay = self.ctx.config.send_retry_delay();
        debug!(exch_id = %exch_id, node = %from.id, "resending full map to late node");

        self.ctx.runtime.spawn(async move {
            for attempt in 1..=retries {
                match ctx.send(&from, &full) {
                    Ok(()) => return,
                    Err(TransportError::NodeLeft { .. }) => {
                        debug!(exch_id = %exch_id, node = %from.id, "late node left, not resending full map");
                        return;
                    }
                    Err(e) => {
                        warn!(exch_id = %exch_id, node = %from.id, attempt, error = %e, "failed to resend full map");
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        });
    }

    fn on_all_received(&self) {
        let errors = self.global_errors.lock().clone();
        if !errors.is_empty() && self.rollback_supported() {
            self.broadcast_failure(errors);
            return;
        }
        if self.is_centralized() {
            self.send_centralized_affinity();
            return;
        }

        if let Some(ver) = *self.last_version.lock() {
            self.ctx.versions().on_received(ver);
        }
        let full = self.full_payload();
        self.apply_full(&full);

        let msg = ExchangeMessage::PartitionsFull(full);
        if let Some(ev) = self.event.get() {
            for node in ev.disco.all_nodes() {
                if node.id == self.ctx.local_node.id || !ev.disco.alive(&node.id) {
                    continue;
                }
                if let Err(e) = self.send_or_skip(node, &msg) {
                    warn!(exch_id = %self.exch_id, node = %node.id, error = %e, "failed to send full map");
                }
            }
        }
        self.on_done(Ok(self.exch_id.topology_version));
    }

    fn send_centralized_affinity(&self) {
        let top_ver = self.exch_id.topology_version;
        let change = self.ctx.affinity.compute_centralized(top_ver);
        info!(exch_id = %self.exch_id, groups = change.len(), "sending centralized affinity");
        let msg = CustomMessage::AffinityChange(AffinityChangePayload {
            exchange_id: Some(self.exch_id.clone()),
            partitions: Some(self.full_payload()),
            assignment_change: change,
        });
        if let Err(e) = self.ctx.discovery.send_custom_event(msg) {
            self.on_done(Err(e.into()));
        }
    }

    fn broadcast_failure(&self, errors: BTreeMap<String, String>) {
        {
            let mut mux = self.mux.lock();
            if mux.rollback_sent {
                return;
            }
            mux.rollback_sent = true;
        }
        let caches = self.actions.read().started_cache_names();
        warn!(exch_id = %self.exch_id, caches = ?caches, nodes = errors.len(), "broadcasting cache change failure");
        let msg = CustomMessage::CacheChangeFailure(CacheChangeFailurePayload {
            origin_node_id: self.ctx.local_node.id.clone(),
            exchange_id: self.exch_id.clone(),
            caches,
            reason: "failed to start caches".into(),
            errors: errors.into_iter().collect(),
        });
        if let Err(e) = self.ctx.discovery.send_custom_event(msg) {
            self.on_done(Err(e.into()));
        }
    }

    /// Full map from `from`. Applied only if `from` is the coordinator;
    /// otherwise kept until coordinator failover says whether it counts.
    pub fn on_receive_full(&self, from: ClusterNode, msg: PartitionsFullPayload) {
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| me.process_full(&from, msg));
    }

    fn process_full(&self, from: &ClusterNode, msg: PartitionsFullPayload) {
        if self.done.is_done() {
            if self.ctx.is_client() {
                self.apply_full(&msg);
            }
            return;
        }
        {
            let mut mux = self.mux.lock();
            if mux.crd.as_ref().map(|c| c.id.as_str()) != Some(from.id.as_str()) {
                debug!(exch_id = %self.exch_id, node = %from.id, "buffering full map from non-coordinator");
                mux.full_msgs.insert(from.id.clone(), msg);
                return;
            }
        }
        self.apply_full(&msg);
        self.on_done(Ok(self.exch_id.topology_version));
    }

    /// The new coordinator asks for this node's single map again.
    pub fn on_partition_request(&self, from: ClusterNode) {
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| {
            if me.ctx.is_client() {
                return;
            }
            if let Err(e) = me.send_local_partitions(&from, None) {
                warn!(exch_id = %me.exch_id, node = %from.id, error = %e, "failed to answer partition request");
            }
        });
    }

    /// Request sent by a new coordinator.
    #[must_use]
    pub fn partition_request(&self) -> ExchangeMessage {
        ExchangeMessage::PartitionsSingleRequest(PartitionsSingleRequestPayload {
            exchange_id: self.exch_id.clone(),
        })
    }

    /// Coordinator's reply to a centralized exchange.
    pub fn on_affinity_change_message(&self, msg: AffinityChangePayload) {
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| me.process_affinity_change(&msg));
    }

    fn process_affinity_change(&self, msg: &AffinityChangePayload) {
        let top_ver = self.exch_id.topology_version;
        self.ctx
            .affinity
            .on_change_affinity_message(top_ver, &msg.assignment_change);

        if !self.done.is_done() {
            for top in self.ctx.registry.topologies() {
                if let Err(e) = top.before_exchange(&self.exch_id, false) {
                    self.on_done(Err(e.into()));
                    return;
                }
            }
        }
        if let Some(full) = &msg.partitions {
            self.apply_full(full);
        }
        self.on_done(Ok(top_ver));
    }

    /// Coordinator-initiated rollback of the caches this exchange tried to start.
    pub fn on_cache_change_failure(&self, msg: CacheChangeFailurePayload) {
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| {
            me.mux.lock().rollback_sent = true;
            for cache in &msg.caches {
                me.ctx.registry.force_close_cache(cache);
            }
            warn!(exch_id = %me.exch_id, caches = ?msg.caches, "rolled back failed cache start");
            let failed = ExchangeError::CacheChangeFailed {
                caches: msg.caches.clone(),
                reason: msg.reason.clone(),
            };
            for req in me.actions.read().requests() {
                me.ctx.registry.complete_request(req.request_id, Err(failed.clone()));
            }
            me.on_done(Err(ExchangeError::Aggregated {
                message: msg.reason.clone(),
                errors: msg.errors.clone(),
            }));
        });
    }

    // -----------------------------------------------------------------------
    // Coordinator failover
    // -----------------------------------------------------------------------

    /// `node` left while this exchange may still be running.
    pub fn on_node_left(&self, node: ClusterNode) {
        let Some(me) = self.self_ref.upgrade() else { return };
        self.init_fut.listen(move |_| me.process_node_left(&node));
    }

    fn process_node_left(&self, node: &ClusterNode) {
        if self.done.is_done() {
            return;
        }
        if let Some(ev) = self.event.get() {
            ev.disco.update_alives(&node.id);
        }
        let local_id = self.ctx.local_node.id.clone();

        let action = {
            let mut mux = self.mux.lock();
            mux.srv_nodes.retain(|n| n.id != node.id);
            let was_remaining = mux.remaining.remove(&node.id);
            let crd_left = mux.crd.as_ref().is_some_and(|c| c.id == node.id);

            if crd_left {
                mux.crd = mux.srv_nodes.first().cloned();
                match mux.crd.clone() {
                    None => LeftAction::NoServers,
                    Some(crd) if crd.id == local_id => {
                        let buffered = std::mem::take(&mut mux.single_msgs);
                        for (id, msg) in &buffered {
                            self.merge_single(id, msg);
                        }
                        mux.remaining = mux
                            .srv_nodes
                            .iter()
                            .filter(|n| n.id != local_id && !buffered.contains_key(&n.id))
                            .map(|n| n.id.clone())
                            .collect();
                        mux.single_msgs = buffered;
                        let requests = mux
                            .srv_nodes
                            .iter()
                            .filter(|n| mux.remaining.contains(&n.id))
                            .cloned()
                            .collect();
                        LeftAction::BecameCoordinator {
                            requests,
                            all_received: Self::take_all_received(&mut mux),
                        }
                    }
                    Some(crd) => {
                        let full = mux.full_msgs.remove(&crd.id);
                        LeftAction::NewCoordinator { crd, full }
                    }
                }
            } else if was_remaining && mux.crd.as_ref().is_some_and(|c| c.id == local_id) {
                if Self::take_all_received(&mut mux) {
                    LeftAction::AllReceived
                } else {
                    LeftAction::Nothing
                }
            } else {
                LeftAction::Nothing
            }
        };

        match action {
            LeftAction::Nothing => {}
            LeftAction::AllReceived => self.on_all_received(),
            LeftAction::NoServers => {
                if let Some(ev) = self.event.get() {
                    if self.is_centralized() {
                        self.ctx
                            .affinity
                            .ideal_fallback(self.exch_id.topology_version, &ev.disco);
                    }
                }
                warn!(exch_id = %self.exch_id, "coordinator left and no server nodes remain");
                self.on_done(Ok(self.exch_id.topology_version));
            }
            LeftAction::BecameCoordinator { requests, all_received } => {
                info!(
                    exch_id = %self.exch_id,
                    left = %node.id,
                    missing = requests.len(),
                    "coordinator left, local node took over"
                );
                let req = self.partition_request();
                for target in &requests {
                    if let Err(e) = self.send_or_skip(target, &req) {
                        warn!(exch_id = %self.exch_id, node = %target.id, error = %e, "failed to request single map");
                    }
                }
                if all_received {
                    self.on_all_received();
                }
            }
            LeftAction::NewCoordinator { crd, full } => {
                info!(exch_id = %self.exch_id, left = %node.id, crd = %crd.id, "coordinator changed");
                if !self.ctx.is_client() {
                    if let Err(e) = self.send_local_partitions(&crd, None) {
                        warn!(exch_id = %self.exch_id, crd = %crd.id, error = %e, "failed to send single map to new coordinator");
                    }
                }
                if let Some(full) = full {
                    self.process_full(&crd, full);
                }
            }
        }
    }

    // -----------------------------------------------------------------------
    // Completion
    // -----------------------------------------------------------------------

    /// Completes the exchange. Only the first call has any effect; returns
    /// `false` for every later one.
    pub fn on_done(&self, res: Result<TopologyVersion, ExchangeError>) -> bool {
        if self.completing.swap(true, Ordering::AcqRel) {
            return false;
        }

        match &res {
            Ok(top_ver) => self.post_process(*top_ver),
            Err(e) => {
                for req in self.actions.read().requests() {
                    self.ctx.registry.complete_request(req.request_id, Err(e.clone()));
                }
            }
        }

        self.init_fut.on_done(Ok(()));
        self.done.on_done(res.clone());

        let duration_ms = u64::try_from(self.created.elapsed().as_millis()).unwrap_or(u64::MAX);
        match &res {
            Ok(top_ver) => info!(exch_id = %self.exch_id, top_ver = %top_ver, duration_ms, "finished exchange"),
            Err(e) => warn!(exch_id = %self.exch_id, error = %e, duration_ms, "exchange failed"),
        }
        self.clean_up();
        true
    }

    fn post_process(&self, top_ver: TopologyVersion) {
        let registry = &self.ctx.registry;

        if let Some(ev) = self.event.get() {
            let servers: Vec<ClusterNode> = ev
                .disco
                .server_nodes()
                .iter()
                .filter(|n| ev.disco.alive(&n.id))
                .cloned()
                .collect();
            let cache_validator = registry.cache_validator();
            let mut validation = BTreeMap::new();
            for cache in registry.caches() {
                let mut err = None;
                if let Some(validator) = cache.topology_validator() {
                    if !validator.validate(&servers) {
                        err = Some(ExchangeError::Validation {
                            cache: cache.name().to_string(),
                            reason: format!("topology validation failed on {top_ver}"),
                        });
                    }
                }
                if err.is_none() {
                    if let Some(reason) = cache_validator.as_ref().and_then(|v| v.validate(cache.name(), &servers)) {
                        err = Some(ExchangeError::Validation {
                            cache: cache.name().to_string(),
                            reason,
                        });
                    }
                }
                if let Some(e) = &err {
                    warn!(exch_id = %self.exch_id, cache = %cache.name(), error = %e, "cache failed validation");
                    validation.insert(cache.name().to_string(), e.clone());
                }
                cache.set_validation(err);
            }
            *self.validation.write() = validation;
        }

        let topologies = registry.topologies();
        if self.exch_id.is_left() {
            for top in &topologies {
                top.detect_lost_partitions();
            }
        }
        for top in &topologies {
            let rented = top.check_evictions();
            if !rented.is_empty() {
                debug!(exch_id = %self.exch_id, grp = top.group_id(), rented = rented.len(), "renting partitions");
            }
        }

        let actions = self.actions.read().clone();
        for req in actions.stops() {
            registry.stop_cache(&req.cache_name);
        }
        for req in actions.requests() {
            registry.complete_request(req.request_id, Ok(()));
        }

        let hooks = registry.hooks();
        for cache in registry.caches() {
            hooks.on_exchange_done(&cache, top_ver);
        }
    }

    fn clean_up(&self) {
        let mut mux = self.mux.lock();
        mux.single_msgs.clear();
        mux.full_msgs.clear();
        mux.remaining.clear();
        drop(mux);
        self.global_errors.lock().clear();
    }

    /// Fails the exchange if it never got its event, used on node stop.
    pub fn on_node_stop(&self) {
        self.event_latch.on_done(Err(ExchangeError::NodeStopping));
        self.on_done(Err(ExchangeError::NodeStopping));
    }
}

impl fmt::Debug for ExchangeFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mux = self.mux.lock();
        f.debug_struct("ExchangeFuture")
            .field("exch_id", &self.exch_id)
            .field("kind", &self.kind.get())
            .field("crd", &mux.crd.as_ref().map(|c| &c.id))
            .field("remaining", &mux.remaining)
            .field("done", &self.done.is_done())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;

    use partex_core::PartitionState;

    use super::*;
    use crate::cache::{CacheConfig, CacheExchangeHooks, MinServerNodes};
    use crate::cluster::CacheChangeRequest;
    use crate::exchange::test_support::{client_harness, harness, Harness};

    fn ver(major: u64) -> TopologyVersion {
        TopologyVersion::new(major, 0)
    }

    fn servers(ids: &[&str]) -> Vec<ClusterNode> {
        ids.iter()
            .zip(1u64..)
            .map(|(id, order)| ClusterNode::server(*id, order))
            .collect()
    }

    fn start_cache(h: &Harness, name: &str) -> i32 {
        let started = h
            .ctx
            .registry
            .start_cache(&CacheConfig::new(name).with_partitions(8), ver(1))
            .unwrap();
        started.cache.group_id()
    }

    /// Exchange for `node` joining a cluster made of `nodes`, already initialized.
    fn joined(h: &Harness, major: u64, node: &str, nodes: &[&str]) -> Arc<ExchangeFuture> {
        let members = servers(nodes);
        let joining = members.iter().find(|n| n.id == node).cloned().unwrap();
        let exch_id = ExchangeId::new(ver(major), node, EventKind::NodeJoined, major);
        let fut = ExchangeFuture::new(exch_id, Arc::clone(&h.ctx));
        fut.on_event(
            DiscoveryEvent::new(EventKind::NodeJoined, joining, ver(major)),
            Arc::new(DiscoCache::new(ver(major), members)),
        );
        fut.init(ExecContext::Worker);
        fut
    }

    /// Exchange for server `departed` failing, leaving `members` behind.
    fn server_failed(h: &Harness, major: u64, departed: &str, members: Vec<ClusterNode>) -> Arc<ExchangeFuture> {
        let exch_id = ExchangeId::new(ver(major), departed, EventKind::NodeFailed, major);
        let fut = ExchangeFuture::new(exch_id, Arc::clone(&h.ctx));
        fut.on_event(
            DiscoveryEvent::new(EventKind::NodeFailed, ClusterNode::server(departed, 99), ver(major)),
            Arc::new(DiscoCache::new(ver(major), members)),
        );
        fut.init(ExecContext::Worker);
        fut
    }

    /// Every partition of `grp` is assigned to `owners` at version 1.
    fn assign_all(h: &Harness, grp: i32, owners: &[&str]) {
        let group = h.ctx.registry.group(grp).unwrap();
        let affinity = group.affinity();
        let owners: Vec<String> = owners.iter().map(|id| (*id).to_string()).collect();
        affinity.initialize(ver(1), Arc::new(vec![owners; affinity.partitions() as usize]));
    }

    fn single_from(fut: &ExchangeFuture, error: Option<String>) -> PartitionsSinglePayload {
        PartitionsSinglePayload {
            exchange_id: fut.exchange_id().clone(),
            last_version: None,
            client: false,
            partitions: BTreeMap::new(),
            update_counters: BTreeMap::new(),
            error,
        }
    }

    fn empty_full(fut: &ExchangeFuture) -> PartitionsFullPayload {
        PartitionsFullPayload {
            exchange_id: Some(fut.exchange_id().clone()),
            last_version: None,
            partitions: BTreeMap::new(),
            update_counters: BTreeMap::new(),
        }
    }

    fn is_single(msg: &ExchangeMessage) -> bool {
        matches!(msg, ExchangeMessage::PartitionsSingle(_))
    }

    fn is_full(msg: &ExchangeMessage) -> bool {
        matches!(msg, ExchangeMessage::PartitionsFull(_))
    }

    // -- single node --

    #[test]
    fn lone_coordinator_completes_and_owns_everything() {
        let h = harness("n1");
        let grp = start_cache(&h, "c");
        let fut = joined(&h, 1, "n1", &["n1"]);

        assert_eq!(fut.kind(), Some(ExchangeKind::All));
        assert!(fut.is_coordinator());
        assert_eq!(fut.result(), Some(Ok(ver(1))));
        let top = h.ctx.registry.topology(grp).unwrap();
        let parts = top.local_partitions();
        assert_eq!(parts.len(), 8);
        assert!(parts.iter().all(|p| p.state() == PartitionState::Owning));
        assert!(h.transport.sent().is_empty());
    }

    // -- coordinator --

    #[test]
    fn coordinator_waits_for_every_server() {
        let h = harness("n1");
        start_cache(&h, "c");
        let fut = joined(&h, 2, "n2", &["n1", "n2", "n3"]);

        assert!(!fut.is_done());
        assert_eq!(fut.remaining().len(), 2);

        let n2 = ClusterNode::server("n2", 2);
        fut.on_receive_single(n2.clone(), single_from(&fut, None));
        assert!(!fut.is_done());
        // Duplicate singles do not count twice.
        fut.on_receive_single(n2, single_from(&fut, None));
        assert!(!fut.is_done());

        fut.on_receive_single(ClusterNode::server("n3", 3), single_from(&fut, None));
        assert_eq!(fut.result(), Some(Ok(ver(2))));
        let mut targets = h.sent_to(is_full);
        targets.sort();
        assert_eq!(targets, vec!["n2", "n3"]);
    }

    #[test]
    fn coordinator_completes_when_missing_server_leaves() {
        let h = harness("n1");
        start_cache(&h, "c");
        let fut = joined(&h, 2, "n2", &["n1", "n2"]);
        assert!(!fut.is_done());

        fut.on_node_left(ClusterNode::server("n2", 2));
        assert_eq!(fut.result(), Some(Ok(ver(2))));
    }

    #[test]
    fn late_single_gets_full_map_again() {
        let h = harness("n1");
        start_cache(&h, "c");
        let fut = joined(&h, 2, "n2", &["n1", "n2"]);
        fut.on_receive_single(ClusterNode::server("n2", 2), single_from(&fut, None));
        assert!(fut.is_done());
        assert_eq!(h.sent_to(is_full).len(), 1);

        fut.on_receive_single(ClusterNode::server("n2", 2), single_from(&fut, None));
        let deadline = Instant::now() + Duration::from_secs(5);
        while h.sent_to(is_full).len() < 2 && Instant::now() < deadline {
            std::thread::sleep(Duration::from_millis(5));
        }
        assert_eq!(h.sent_to(is_full).len(), 2);
    }

    // -- non-coordinator --

    #[test]
    fn member_sends_single_and_applies_coordinator_full() {
        let h = harness("n2");
        start_cache(&h, "c");
        let fut = joined(&h, 2, "n2", &["n1", "n2", "n3"]);

        assert!(!fut.is_coordinator());
        assert_eq!(fut.coordinator().as_deref(), Some("n1"));
        assert_eq!(h.sent_to(is_single), vec!["n1"]);

        // Full map from a node that is not the coordinator is held back.
        fut.on_receive_full(ClusterNode::server("n3", 3), empty_full(&fut));
        assert!(!fut.is_done());

        fut.on_receive_full(ClusterNode::server("n1", 1), empty_full(&fut));
        assert_eq!(fut.result(), Some(Ok(ver(2))));
    }

    #[test]
    fn member_takes_over_when_coordinator_leaves() {
        let h = harness("n2");
        start_cache(&h, "c");
        let fut = joined(&h, 3, "n3", &["n1", "n2", "n3"]);

        // n3's single reached n2 first and is buffered.
        fut.on_receive_single(ClusterNode::server("n3", 3), single_from(&fut, None));
        assert!(!fut.is_done());

        fut.on_node_left(ClusterNode::server("n1", 1));
        assert!(fut.is_coordinator());
        assert_eq!(fut.result(), Some(Ok(ver(3))));
        assert_eq!(h.sent_to(is_full), vec!["n3"]);
        assert!(h
            .sent_to(|m| matches!(m, ExchangeMessage::PartitionsSingleRequest(_)))
            .is_empty());
    }

    #[test]
    fn new_coordinator_requests_missing_singles() {
        let h = harness("n2");
        start_cache(&h, "c");
        let fut = joined(&h, 3, "n3", &["n1", "n2", "n3"]);

        fut.on_node_left(ClusterNode::server("n1", 1));
        assert!(!fut.is_done());
        assert_eq!(fut.remaining().into_iter().collect::<Vec<_>>(), vec!["n3"]);
        assert_eq!(
            h.sent_to(|m| matches!(m, ExchangeMessage::PartitionsSingleRequest(_))),
            vec!["n3"]
        );

        fut.on_receive_single(ClusterNode::server("n3", 3), single_from(&fut, None));
        assert!(fut.is_done());
    }

    #[test]
    fn member_replays_full_from_new_coordinator() {
        let h = harness("n3");
        start_cache(&h, "c");
        let fut = joined(&h, 3, "n3", &["n1", "n2", "n3"]);

        fut.on_receive_full(ClusterNode::server("n2", 2), empty_full(&fut));
        assert!(!fut.is_done());

        fut.on_node_left(ClusterNode::server("n1", 1));
        assert_eq!(fut.coordinator().as_deref(), Some("n2"));
        assert!(fut.is_done());
        // The single map went to the old coordinator and then the new one.
        assert_eq!(h.sent_to(is_single), vec!["n1", "n2"]);
    }

    #[test]
    fn member_answers_partition_request() {
        let h = harness("n3");
        start_cache(&h, "c");
        let fut = joined(&h, 3, "n3", &["n1", "n2", "n3"]);
        fut.on_partition_request(ClusterNode::server("n2", 2));
        assert_eq!(h.sent_to(is_single), vec!["n1", "n2"]);
    }

    // -- init failures --

    #[test]
    fn io_failure_asks_for_reconnect_when_supported() {
        let h = harness("n2");
        start_cache(&h, "c");
        h.transport.fail_with(TransportError::Io("connection reset".into()));
        h.discovery.set_reconnect_supported(true);

        let fut = joined(&h, 2, "n2", &["n1", "n2"]);
        match fut.result() {
            Some(Err(ExchangeError::NeedReconnect { node_id, reason })) => {
                assert_eq!(node_id, "n2");
                assert!(reason.contains("connection reset"));
            }
            other => panic!("expected a reconnect request, got {other:?}"),
        }
    }

    #[test]
    fn io_failure_without_reconnect_support_fails_plainly() {
        let h = harness("n2");
        start_cache(&h, "c");
        h.transport.fail_with(TransportError::Io("connection reset".into()));

        let fut = joined(&h, 2, "n2", &["n1", "n2"]);
        assert_eq!(
            fut.result(),
            Some(Err(ExchangeError::Io("connection reset".into())))
        );
    }

    // -- no servers left --

    #[test]
    fn coordinator_loss_with_no_servers_left_falls_back_to_ideal() {
        let h = harness("n2");
        let grp = start_cache(&h, "c");
        assign_all(&h, grp, &["n3"]);
        // The local node is being dropped from the cluster, so it cannot coordinate.
        h.discovery.mark_dead("n2");

        let members = vec![ClusterNode::server("n1", 1), ClusterNode::server("n2", 2)];
        let fut = server_failed(&h, 2, "n3", members);
        assert!(fut.is_centralized());
        assert_eq!(fut.coordinator().as_deref(), Some("n1"));
        assert_eq!(h.sent_to(is_single), vec!["n1"]);
        assert!(!fut.is_done());

        fut.on_node_left(ClusterNode::server("n1", 1));
        assert_eq!(fut.result(), Some(Ok(ver(2))));
        let assignment = h.ctx.registry.group(grp).unwrap().affinity().cached(ver(2)).unwrap();
        assert!(assignment.iter().all(|owners| owners == &vec!["n2".to_string()]));
    }

    #[test]
    fn client_only_exchange_without_servers_uses_ideal_assignment() {
        let h = client_harness("cl");
        let grp = start_cache(&h, "c");
        assign_all(&h, grp, &["n1", "ghost"]);

        let fut = server_failed(&h, 2, "n1", vec![ClusterNode::client("cl", 2)]);
        assert_eq!(fut.kind(), Some(ExchangeKind::Client));
        assert!(fut.is_centralized());
        assert_eq!(fut.result(), Some(Ok(ver(2))));
        // The provisional assignment would still list "ghost".
        let assignment = h.ctx.registry.group(grp).unwrap().affinity().cached(ver(2)).unwrap();
        assert!(assignment.iter().all(Vec::is_empty));
        assert!(h.transport.sent().is_empty());
    }

    // -- cache changes --

    #[derive(Default)]
    struct Refusing;

    impl CacheExchangeHooks for Refusing {
        fn before_cache_start(&self, config: &CacheConfig) -> Result<(), String> {
            Err(format!("{} refused", config.name))
        }
    }

    #[test]
    fn failed_cache_start_fails_exchange_and_request() {
        let h = harness("n1");
        h.ctx.registry.set_hooks(Arc::new(Refusing));
        let req = CacheChangeRequest::start(CacheConfig::new("c"), "n1");
        let request = h.ctx.registry.register_request(req.request_id);

        let node = ClusterNode::server("n1", 1);
        let top_ver = TopologyVersion::new(1, 1);
        let fut = ExchangeFuture::new(
            ExchangeId::new(top_ver, "n1", EventKind::Custom, 1),
            Arc::clone(&h.ctx),
        );
        fut.on_event(
            DiscoveryEvent::custom(
                node.clone(),
                top_ver,
                CustomMessage::CacheChange(CacheChangeBatch { requests: vec![req] }),
            ),
            Arc::new(DiscoCache::new(top_ver, vec![node])),
        );
        fut.init(ExecContext::Worker);

        assert!(matches!(fut.result(), Some(Err(ExchangeError::CacheStart { .. }))));
        assert!(matches!(request.result(), Some(Err(ExchangeError::CacheStart { .. }))));
        assert!(h.ctx.registry.cache("c").is_none());
    }

    #[test]
    fn cache_start_completes_request() {
        let h = harness("n1");
        let req = CacheChangeRequest::start(CacheConfig::new("c").with_partitions(4), "n1");
        let request = h.ctx.registry.register_request(req.request_id);

        let node = ClusterNode::server("n1", 1);
        let top_ver = TopologyVersion::new(1, 1);
        let fut = ExchangeFuture::new(
            ExchangeId::new(top_ver, "n1", EventKind::Custom, 1),
            Arc::clone(&h.ctx),
        );
        fut.on_event(
            DiscoveryEvent::custom(
                node.clone(),
                top_ver,
                CustomMessage::CacheChange(CacheChangeBatch { requests: vec![req] }),
            ),
            Arc::new(DiscoCache::new(top_ver, vec![node])),
        );
        fut.init(ExecContext::Worker);

        assert_eq!(request.result(), Some(Ok(())));
        let cache = h.ctx.registry.cache("c").unwrap();
        let top = cache.topology().unwrap();
        assert!(top
            .local_partitions()
            .iter()
            .all(|p| p.state() == PartitionState::Owning));
    }

    #[test]
    fn topology_validator_marks_cache_invalid() {
        let h = harness("n1");
        h.ctx
            .registry
            .register_topology_validator("c", Arc::new(MinServerNodes(2)));
        start_cache(&h, "c");
        let fut = joined(&h, 1, "n1", &["n1"]);

        assert!(fut.is_done());
        assert!(matches!(fut.validate_cache("c"), Some(ExchangeError::Validation { .. })));
        assert!(h.ctx.registry.cache("c").unwrap().validation_error().is_some());
    }

    #[test]
    fn remote_start_failure_rolls_back_everywhere() {
        let h = harness("n1");
        let nodes: Vec<ClusterNode> = servers(&["n1", "n2"])
            .into_iter()
            .map(|n| n.with_attribute(ATTR_EXCHANGE_ROLLBACK, "true"))
            .collect();
        let req = CacheChangeRequest::start(CacheConfig::new("c").with_partitions(4), "n1");
        let request = h.ctx.registry.register_request(req.request_id);

        let top_ver = TopologyVersion::new(2, 1);
        let fut = ExchangeFuture::new(
            ExchangeId::new(top_ver, "n1", EventKind::Custom, 1),
            Arc::clone(&h.ctx),
        );
        fut.on_event(
            DiscoveryEvent::custom(
                nodes[0].clone(),
                top_ver,
                CustomMessage::CacheChange(CacheChangeBatch { requests: vec![req] }),
            ),
            Arc::new(DiscoCache::new(top_ver, nodes.clone())),
        );
        fut.init(ExecContext::Worker);
        assert!(h.ctx.registry.cache("c").is_some());

        fut.on_receive_single(nodes[1].clone(), single_from(&fut, Some("disk full".into())));
        assert!(!fut.is_done());
        assert!(h.sent_to(is_full).is_empty());

        let events = h.discovery.events();
        let [CustomMessage::CacheChangeFailure(failure)] = events.as_slice() else {
            panic!("expected one failure broadcast, got {events:?}");
        };
        assert_eq!(failure.caches, vec!["c"]);
        assert_eq!(failure.errors, vec![("n2".to_string(), "disk full".to_string())]);

        fut.on_cache_change_failure(failure.clone());
        assert!(matches!(fut.result(), Some(Err(ExchangeError::Aggregated { .. }))));
        assert!(matches!(
            request.result(),
            Some(Err(ExchangeError::CacheChangeFailed { .. }))
        ));
        assert!(h.ctx.registry.cache("c").is_none());

        // A late single after rollback gets no full map.
        fut.on_receive_single(nodes[1].clone(), single_from(&fut, None));
        std::thread::sleep(Duration::from_millis(20));
        assert!(h.sent_to(is_full).is_empty());
    }

    // -- completion --

    #[test]
    fn concurrent_completion_runs_once() {
        let h = harness("n1");
        let fut = ExchangeFuture::new(
            ExchangeId::new(ver(1), "n1", EventKind::NodeJoined, 1),
            Arc::clone(&h.ctx),
        );
        let listeners = Arc::new(AtomicUsize::new(0));
        let counter = Arc::clone(&listeners);
        fut.done_future().listen(move |_| {
            counter.fetch_add(1, Ordering::SeqCst);
        });

        let winners: usize = (0..8)
            .map(|_| {
                let fut = Arc::clone(&fut);
                std::thread::spawn(move || fut.on_done(Ok(ver(1))))
            })
            .collect::<Vec<_>>()
            .into_iter()
            .map(|t| usize::from(t.join().unwrap()))
            .sum();

        assert_eq!(winners, 1);
        assert_eq!(listeners.load(Ordering::SeqCst), 1);
        assert!(!fut.on_done(Err(ExchangeError::NodeStopping)));
        assert_eq!(fut.result(), Some(Ok(ver(1))));
    }

    #[test]
    fn node_stop_fails_exchange_waiting_for_event() {
        let h = harness("n1");
        let fut = ExchangeFuture::new(
            ExchangeId::new(ver(1), "n1", EventKind::NodeJoined, 1),
            Arc::clone(&h.ctx),
        );
        fut.on_node_stop();
        fut.init(ExecContext::Worker);
        assert_eq!(fut.result(), Some(Err(ExchangeError::NodeStopping)));
    }

    // -- coordinator choice --

    mod coordinator {
        use proptest::prelude::*;

        use super::*;

        fn members() -> impl Strategy<Value = Vec<ClusterNode>> {
            prop::collection::vec(1u64..6, 1..8)
                .prop_map(|orders| {
                    orders
                        .into_iter()
                        .enumerate()
                        .map(|(i, order)| ClusterNode::server(format!("n{i}"), order))
                        .collect::<Vec<_>>()
                })
                .prop_shuffle()
        }

        proptest! {
            #![proptest_config(ProptestConfig::with_cases(64))]

            #[test]
            fn oldest_server_coordinates_regardless_of_listing_order(nodes in members()) {
                let local = nodes[0].clone();
                let expected = nodes
                    .iter()
                    .min_by(|a, b| a.order.cmp(&b.order).then_with(|| a.id.cmp(&b.id)))
                    .map(|n| n.id.clone());

                let h = harness(&local.id);
                let exch_id = ExchangeId::new(ver(1), local.id.clone(), EventKind::NodeJoined, 1);
                let fut = ExchangeFuture::new(exch_id, Arc::clone(&h.ctx));
                fut.on_event(
                    DiscoveryEvent::new(EventKind::NodeJoined, local.clone(), ver(1)),
                    Arc::new(DiscoCache::new(ver(1), nodes.clone())),
                );
                fut.init(ExecContext::Worker);

                prop_assert_eq!(fut.coordinator(), expected.clone());
                prop_assert_eq!(fut.is_coordinator(), expected.as_deref() == Some(local.id.as_str()));
                fut.on_node_stop();
            }
        }
    }
}
