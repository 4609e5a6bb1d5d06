//! Node-local registry of started caches, their groups and partition topologies.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use parking_lot::RwLock;
use partex_core::{TopologyVersion, VersionGenerator};
use tracing::{debug, info};
use uuid::Uuid;

use super::config::CacheConfig;
use super::context::CacheContext;
use super::validator::{CacheExchangeHooks, CacheValidator, NoopHooks, TopologyValidator};
use crate::config::PartitionConfig;
use crate::error::ExchangeError;
use crate::future::{GridFuture, ReconnectFuture};
use crate::gateway::{CacheGateway, EvictionSink, DEFAULT_STOP_POLL};
use crate::partition::{
    CacheGroup, DataStoreManager, GroupServices, GroupSettings, PartitionEvictor, PartitionFuture,
};
use crate::topology::{ClientTopology, PartitionTopology};

/// Creates the data store manager of a new cache group.
pub type StoreFactory = Arc<dyn Fn(i32) -> Arc<dyn DataStoreManager> + Send + Sync>;

/// Completion handle of a dynamic cache start or stop request.
pub type RequestFuture = GridFuture<(), ExchangeError>;

/// Node-level services the registry hands to caches and groups it creates.
#[derive(Clone)]
pub struct RegistryServices {
    pub local_node_id: String,
    pub client: bool,
    pub evictor: Arc<dyn PartitionEvictor>,
    pub versions: Arc<VersionGenerator>,
    pub config: Arc<PartitionConfig>,
    pub stores: StoreFactory,
    pub eviction_sink: Arc<dyn EvictionSink>,
    pub stop_poll: Duration,
}

impl RegistryServices {
    #[must_use]
    pub fn new(
        local_node_id: impl Into<String>,
        client: bool,
        evictor: Arc<dyn PartitionEvictor>,
        versions: Arc<VersionGenerator>,
        config: Arc<PartitionConfig>,
        stores: StoreFactory,
        eviction_sink: Arc<dyn EvictionSink>,
    ) -> Self {
        Self {
            local_node_id: local_node_id.into(),
            client,
            evictor,
            versions,
            config,
            stores,
            eviction_sink,
            stop_poll: DEFAULT_STOP_POLL,
        }
    }
}

#[derive(Clone)]
struct GroupEntry {
    group: Arc<CacheGroup>,
    /// `None` on client nodes: the group is tracked for affinity only.
    topology: Option<Arc<PartitionTopology>>,
    started: TopologyVersion,
}

/// Result of [`CacheRegistry::start_cache`].
#[derive(Debug, Clone)]
pub struct StartedCache {
    pub cache: Arc<CacheContext>,
    /// The start created the cache's group.
    pub group_created: bool,
}

/// Started caches and groups of one node.
pub struct CacheRegistry {
    services: RegistryServices,
    caches: DashMap<String, Arc<CacheContext>>,
    groups: DashMap<i32, GroupEntry>,
    client_tops: DashMap<i32, Arc<ClientTopology>>,
    topology_validators: DashMap<String, Arc<dyn TopologyValidator>>,
    cache_validator: RwLock<Option<Arc<dyn CacheValidator>>>,
    hooks: RwLock<Arc<dyn CacheExchangeHooks>>,
    requests: DashMap<Uuid, RequestFuture>,
}

impl CacheRegistry {
    #[must_use]
    pub fn new(services: RegistryServices) -> Self {
        Self {
            services,
            caches: DashMap::new(),
            groups: DashMap::new(),
            client_tops: DashMap::new(),
            topology_validators: DashMap::new(),
            cache_validator: RwLock::new(None),
            hooks: RwLock::new(Arc::new(NoopHooks)),
            requests: DashMap::new(),
        }
    }

    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.services.local_node_id
    }

    #[must_use]
    pub fn is_client(&self) -> bool {
        self.services.client
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<VersionGenerator> {
        &self.services.versions
    }

    // -----------------------------------------------------------------------
    // Extension points
    // -----------------------------------------------------------------------

    /// Installs a topology validator for caches started after this call.
    pub fn register_topology_validator(&self, cache: impl Into<String>, validator: Arc<dyn TopologyValidator>) {
        self.topology_validators.insert(cache.into(), validator);
    }

    pub fn set_cache_validator(&self, validator: Arc<dyn CacheValidator>) {
        *self.cache_validator.write() = Some(validator);
    }

    #[must_use]
    pub fn cache_validator(&self) -> Option<Arc<dyn CacheValidator>> {
        self.cache_validator.read().clone()
    }

    pub fn set_hooks(&self, hooks: Arc<dyn CacheExchangeHooks>) {
        *self.hooks.write() = hooks;
    }

    #[must_use]
    pub fn hooks(&self) -> Arc<dyn CacheExchangeHooks> {
        Arc::clone(&self.hooks.read())
    }

    // -----------------------------------------------------------------------
    // Cache lifecycle
    // -----------------------------------------------------------------------

    /// Starts `config` at `top_ver`, creating its group on first use.
    /// Starting an already running cache returns the running one.
    ///
    /// # Errors
    ///
    /// [`ExchangeError::CacheStart`] if the configuration is invalid,
    /// conflicts with its group, or a start hook refuses it.
    pub fn start_cache(&self, config: &CacheConfig, top_ver: TopologyVersion) -> Result<StartedCache, ExchangeError> {
        let start_err = |reason: String| ExchangeError::CacheStart {
            cache: config.name.clone(),
            reason,
        };
        config.validate().map_err(start_err)?;
        if let Some(cache) = self.caches.get(&config.name) {
            return Ok(StartedCache {
                cache: Arc::clone(cache.value()),
                group_created: false,
            });
        }
        self.hooks().before_cache_start(config).map_err(start_err)?;

        let (entry, group_created) = if config.local {
            (None, false)
        } else {
            let (entry, created) = self.group_for(config, top_ver)?;
            entry.group.add_cache(config.cache_id());
            if self.services.client {
                self.client_topology(config.group_id());
            }
            (Some(entry), created)
        };

        let gateway = CacheGateway::with_stop_poll(
            config.name.clone(),
            Arc::clone(&self.services.eviction_sink),
            self.services.stop_poll,
        );
        let validator = self
            .topology_validators
            .get(&config.name)
            .map(|v| Arc::clone(v.value()));
        let cache = Arc::new(CacheContext::new(
            config.clone(),
            entry.as_ref().map(|e| Arc::clone(&e.group)),
            entry.as_ref().and_then(|e| e.topology.clone()),
            gateway,
            top_ver,
            validator,
        ));
        self.caches.insert(config.name.clone(), Arc::clone(&cache));
        info!(cache = %config.name, group = config.group_name(), top_ver = %top_ver, group_created, "started cache");
        Ok(StartedCache { cache, group_created })
    }

    fn group_for(&self, config: &CacheConfig, top_ver: TopologyVersion) -> Result<(GroupEntry, bool), ExchangeError> {
        let group_id = config.group_id();
        match self.groups.entry(group_id) {
            Entry::Occupied(e) => {
                let settings = e.get().group.settings();
                if settings.partitions != config.partitions || settings.backups != config.backups {
                    return Err(ExchangeError::CacheStart {
                        cache: config.name.clone(),
                        reason: format!(
                            "group {} runs {} partitions with {} backups",
                            settings.name, settings.partitions, settings.backups
                        ),
                    });
                }
                Ok((e.get().clone(), false))
            }
            Entry::Vacant(v) => {
                let settings = GroupSettings {
                    group_id,
                    name: config.group_name().to_string(),
                    partitions: config.partitions,
                    backups: config.backups,
                    shared: config.group_name.is_some(),
                    system: config.system,
                    dr_enabled: config.dr_enabled,
                    allow_fast_eviction: config.allow_fast_eviction,
                };
                let services = GroupServices {
                    local_node_id: self.services.local_node_id.clone(),
                    data_stores: (self.services.stores)(group_id),
                    evictor: Arc::clone(&self.services.evictor),
                    versions: Arc::clone(&self.services.versions),
                    config: Arc::clone(&self.services.config),
                };
                let group = Arc::new(CacheGroup::new(settings, services));
                let topology = (!self.services.client).then(|| PartitionTopology::new(Arc::clone(&group)));
                let entry = GroupEntry {
                    group,
                    topology,
                    started: top_ver,
                };
                v.insert(entry.clone());
                Ok((entry, true))
            }
        }
    }

    /// Stops a cache after in-flight operations drain. Stopping the last cache
    /// of a group rents all its partitions; the returned futures complete when
    /// they are evicted.
    pub fn stop_cache(&self, name: &str) -> Vec<PartitionFuture> {
        let Some((_, cache)) = self.caches.remove(name) else {
            debug!(cache = name, "stop requested for unknown cache");
            return Vec::new();
        };
        cache.gateway().on_stopped();
        let futs = self.detach(&cache);
        info!(cache = name, "stopped cache");
        futs
    }

    /// Closes a cache without waiting for in-flight operations, used to roll
    /// back a failed start.
    pub fn force_close_cache(&self, name: &str) -> Vec<PartitionFuture> {
        let Some((_, cache)) = self.caches.remove(name) else {
            return Vec::new();
        };
        cache.gateway().stopped();
        let futs = self.detach(&cache);
        info!(cache = name, "force-closed cache");
        futs
    }

    fn detach(&self, cache: &CacheContext) -> Vec<PartitionFuture> {
        if cache.config().local {
            return Vec::new();
        }
        let group_id = cache.group_id();
        let Some(entry) = self.groups.get(&group_id).map(|e| e.value().clone()) else {
            return Vec::new();
        };
        if entry.group.remove_cache(cache.cache_id()) {
            self.groups.remove(&group_id);
            self.client_tops.remove(&group_id);
            return entry.topology.map(|t| t.stop()).unwrap_or_default();
        }
        if let Some(topology) = entry.topology {
            for part in topology.local_partitions() {
                part.on_cache_stopped(cache.cache_id());
            }
        }
        Vec::new()
    }

    /// Node shutdown: abort clearing passes and close every gateway.
    pub fn on_node_stop(&self) {
        for entry in &self.groups {
            entry.group.on_node_stop();
        }
        for cache in &self.caches {
            cache.gateway().stopped();
        }
        for req in &self.requests {
            req.value().on_done(Err(ExchangeError::NodeStopping));
        }
        self.requests.clear();
    }

    /// Client lost the cluster: operations fail with `reconnect` until it completes.
    pub fn on_disconnected(&self, reconnect: &ReconnectFuture) {
        for cache in &self.caches {
            cache.gateway().on_disconnected(reconnect.clone());
        }
        for req in &self.requests {
            req.value().on_done(Err(ExchangeError::ClientDisconnected));
        }
        self.requests.clear();
    }

    /// Client is back; caches named in `stopped` did not survive the reconnect.
    pub fn on_reconnected(&self, stopped: &[String]) {
        for cache in &self.caches {
            cache.gateway().reconnected(stopped.contains(cache.key()));
        }
        for name in stopped {
            self.force_close_cache(name);
        }
    }

    // -----------------------------------------------------------------------
    // Pending requests
    // -----------------------------------------------------------------------

    /// Future completed by the exchange that processes request `id`.
    pub fn register_request(&self, id: Uuid) -> RequestFuture {
        self.requests.entry(id).or_insert_with(GridFuture::new).clone()
    }

    /// Completes the pending request `id`, if this node registered one.
    pub fn complete_request(&self, id: Uuid, result: Result<(), ExchangeError>) -> bool {
        match self.requests.remove(&id) {
            Some((_, fut)) => fut.on_done(result),
            None => false,
        }
    }

    // -----------------------------------------------------------------------
    // Lookups
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn cache(&self, name: &str) -> Option<Arc<CacheContext>> {
        self.caches.get(name).map(|c| Arc::clone(c.value()))
    }

    /// Started caches ordered by name.
    #[must_use]
    pub fn caches(&self) -> Vec<Arc<CacheContext>> {
        let sorted: BTreeMap<String, Arc<CacheContext>> = self
            .caches
            .iter()
            .map(|c| (c.key().clone(), Arc::clone(c.value())))
            .collect();
        sorted.into_values().collect()
    }

    #[must_use]
    pub fn group(&self, group_id: i32) -> Option<Arc<CacheGroup>> {
        self.groups.get(&group_id).map(|e| Arc::clone(&e.group))
    }

    #[must_use]
    pub fn topology(&self, group_id: i32) -> Option<Arc<PartitionTopology>> {
        self.groups.get(&group_id).and_then(|e| e.topology.clone())
    }

    /// Topology version at which the group was created locally.
    #[must_use]
    pub fn group_started_at(&self, group_id: i32) -> Option<TopologyVersion> {
        self.groups.get(&group_id).map(|e| e.started)
    }

    /// Every known group, ordered by id, including groups tracked for affinity only.
    #[must_use]
    pub fn affinity_groups(&self) -> Vec<Arc<CacheGroup>> {
        let sorted: BTreeMap<i32, Arc<CacheGroup>> = self
            .groups
            .iter()
            .map(|e| (*e.key(), Arc::clone(&e.group)))
            .collect();
        sorted.into_values().collect()
    }

    /// Locally hosted partition topologies, ordered by group id.
    #[must_use]
    pub fn topologies(&self) -> Vec<Arc<PartitionTopology>> {
        let sorted: BTreeMap<i32, Arc<PartitionTopology>> = self
            .groups
            .iter()
            .filter_map(|e| e.topology.clone().map(|t| (*e.key(), t)))
            .collect();
        sorted.into_values().collect()
    }

    /// Client topology of `group_id`, created on first use.
    pub fn client_topology(&self, group_id: i32) -> Arc<ClientTopology> {
        Arc::clone(
            self.client_tops
                .entry(group_id)
                .or_insert_with(|| Arc::new(ClientTopology::new(group_id)))
                .value(),
        )
    }

    #[must_use]
    pub fn existing_client_topology(&self, group_id: i32) -> Option<Arc<ClientTopology>> {
        self.client_tops.get(&group_id).map(|t| Arc::clone(t.value()))
    }

    #[must_use]
    pub fn client_topologies(&self) -> Vec<Arc<ClientTopology>> {
        self.client_tops.iter().map(|t| Arc::clone(t.value())).collect()
    }
}

impl std::fmt::Debug for CacheRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CacheRegistry")
            .field("local_node_id", &self.services.local_node_id)
            .field("client", &self.services.client)
            .field("caches", &self.caches.len())
            .field("groups", &self.groups.len())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use partex_core::VersionGenerator;

    use super::*;
    use crate::gateway::LoggingEvictionSink;
    use crate::partition::test_support::RecordingEvictor;
    use crate::partition::MemoryDataStoreManager;

    pub fn registry(node: &str, client: bool) -> CacheRegistry {
        let services = RegistryServices::new(
            node,
            client,
            Arc::new(RecordingEvictor::default()),
            Arc::new(VersionGenerator::system(1)),
            Arc::new(PartitionConfig::default()),
            Arc::new(|_: i32| Arc::new(MemoryDataStoreManager::new()) as Arc<dyn DataStoreManager>),
            Arc::new(LoggingEvictionSink),
        );
        CacheRegistry::new(services)
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use partex_core::{EventKind, ExchangeId};

    use super::test_support::registry;
    use super::*;
    use crate::cluster::{ClusterNode, DiscoCache};
    use crate::error::{CacheError, GatewayError};
    use crate::gateway::GatewayState;

    fn ver(major: u64) -> TopologyVersion {
        TopologyVersion::new(major, 0)
    }

    /// Single-node affinity, every partition owned locally.
    fn owned(reg: &CacheRegistry, group_id: i32) {
        let top = reg.topology(group_id).unwrap();
        let exch = ExchangeId::new(ver(1), "n1", EventKind::NodeJoined, 1);
        let disco = Arc::new(DiscoCache::new(ver(1), vec![ClusterNode::server("n1", 1)]));
        let aff = top.group().affinity();
        aff.initialize(ver(1), aff.calculate(disco.server_nodes()));
        top.update_topology_version(&exch, disco);
        top.before_exchange(&exch, true).unwrap();
    }

    // -- start / stop --

    #[test]
    fn start_creates_group_once() {
        let reg = registry("n1", false);
        let a = reg.start_cache(&CacheConfig::new("a").with_group("g"), ver(1)).unwrap();
        let b = reg.start_cache(&CacheConfig::new("b").with_group("g"), ver(1)).unwrap();
        assert!(a.group_created);
        assert!(!b.group_created);
        assert_eq!(reg.affinity_groups().len(), 1);
        assert_eq!(reg.topologies().len(), 1);
        assert!(reg.group(a.cache.group_id()).unwrap().shared());

        let again = reg.start_cache(&CacheConfig::new("a").with_group("g"), ver(2)).unwrap();
        assert!(Arc::ptr_eq(&again.cache, &a.cache));
    }

    #[test]
    fn conflicting_group_settings_fail_the_start() {
        let reg = registry("n1", false);
        reg.start_cache(&CacheConfig::new("a").with_group("g"), ver(1)).unwrap();
        let err = reg
            .start_cache(&CacheConfig::new("b").with_group("g").with_partitions(8), ver(1))
            .unwrap_err();
        assert!(matches!(err, ExchangeError::CacheStart { ref cache, .. } if cache == "b"));
    }

    #[test]
    fn client_registry_tracks_groups_without_partitions() {
        let reg = registry("c1", true);
        let started = reg.start_cache(&CacheConfig::new("a"), ver(1)).unwrap();
        assert!(started.cache.topology().is_none());
        assert!(reg.topologies().is_empty());
        assert_eq!(reg.affinity_groups().len(), 1);
        assert!(reg.existing_client_topology(started.cache.group_id()).is_some());

        let err = started.cache.put("k", b"v".to_vec()).unwrap_err();
        assert!(matches!(err, CacheError::PartitionUnavailable { .. }));
    }

    #[test]
    fn stopping_last_cache_rents_the_group() {
        let reg = registry("n1", false);
        let cfg = CacheConfig::new("a").with_partitions(4);
        reg.start_cache(&cfg, ver(1)).unwrap();
        owned(&reg, cfg.group_id());

        let futs = reg.stop_cache("a");
        assert_eq!(futs.len(), 4);
        assert!(futs.iter().all(|f| f.is_done()));
        assert!(reg.cache("a").is_none());
        assert!(reg.group(cfg.group_id()).is_none());
    }

    #[test]
    fn stopping_one_shared_cache_keeps_the_group() {
        let reg = registry("n1", false);
        let a = CacheConfig::new("a").with_group("g").with_partitions(4);
        let b = CacheConfig::new("b").with_group("g").with_partitions(4);
        let started = reg.start_cache(&a, ver(1)).unwrap();
        reg.start_cache(&b, ver(1)).unwrap();
        owned(&reg, a.group_id());
        started.cache.put("k", b"v".to_vec()).unwrap();

        assert!(reg.stop_cache("a").is_empty());
        assert!(reg.group(a.group_id()).is_some());
        assert_eq!(started.cache.gateway().state(), GatewayState::Stopped);
        assert!(matches!(
            started.cache.put("k", b"v".to_vec()),
            Err(CacheError::Gateway(GatewayError::Stopped { .. }))
        ));
    }

    // -- cache operations --

    #[test]
    fn put_get_remove_through_the_gateway() {
        let reg = registry("n1", false);
        let cfg = CacheConfig::new("a").with_partitions(4);
        let cache = reg.start_cache(&cfg, ver(1)).unwrap().cache;
        owned(&reg, cfg.group_id());

        assert!(cache.put("k", b"v".to_vec()).unwrap());
        assert_eq!(cache.get("k").unwrap(), Some(b"v".to_vec()));
        assert_eq!(cache.local_size(), 1);
        assert!(cache.remove("k").unwrap());
        assert_eq!(cache.get("k").unwrap(), None);
        assert_eq!(cache.local_size(), 0);
    }

    #[test]
    fn evict_defers_a_notice() {
        let reg = registry("n1", false);
        let cfg = CacheConfig::new("a").with_partitions(2);
        let cache = reg.start_cache(&cfg, ver(1)).unwrap().cache;
        owned(&reg, cfg.group_id());
        cache.put("k", b"v".to_vec()).unwrap();
        assert!(cache.evict("k").unwrap());
        assert!(!cache.evict("k").unwrap());
    }

    #[test]
    fn invalid_cache_rejects_writes_but_serves_reads() {
        let reg = registry("n1", false);
        let cfg = CacheConfig::new("a").with_partitions(2);
        let cache = reg.start_cache(&cfg, ver(1)).unwrap().cache;
        owned(&reg, cfg.group_id());
        cache.put("k", b"v".to_vec()).unwrap();

        cache.set_validation(Some(ExchangeError::Validation {
            cache: "a".into(),
            reason: "too few servers".into(),
        }));
        assert!(matches!(cache.put("k", b"w".to_vec()), Err(CacheError::Invalid(_))));
        assert_eq!(cache.get("k").unwrap(), Some(b"v".to_vec()));
    }

    // -- requests and lifecycle --

    #[test]
    fn pending_requests_fail_on_disconnect() {
        let reg = registry("c1", true);
        let cache = reg.start_cache(&CacheConfig::new("a"), ver(1)).unwrap().cache;
        let id = Uuid::new_v4();
        let fut = reg.register_request(id);

        let reconnect = ReconnectFuture::new(GridFuture::new());
        reg.on_disconnected(&reconnect);
        assert_eq!(fut.result(), Some(Err(ExchangeError::ClientDisconnected)));
        assert!(matches!(
            cache.get("k"),
            Err(CacheError::Gateway(GatewayError::Disconnected { .. }))
        ));

        reg.on_reconnected(&["a".to_string()]);
        assert!(reg.cache("a").is_none());
        assert_eq!(cache.gateway().state(), GatewayState::Stopped);
    }

    #[test]
    fn complete_request_only_once() {
        let reg = registry("n1", false);
        let id = Uuid::new_v4();
        let fut = reg.register_request(id);
        assert!(reg.complete_request(id, Ok(())));
        assert!(!reg.complete_request(id, Ok(())));
        assert_eq!(fut.result(), Some(Ok(())));
    }

    #[test]
    fn start_hook_can_refuse() {
        struct Refuse;
        impl CacheExchangeHooks for Refuse {
            fn before_cache_start(&self, config: &CacheConfig) -> Result<(), String> {
                Err(format!("no room for {}", config.name))
            }
        }
        let reg = registry("n1", false);
        reg.set_hooks(Arc::new(Refuse));
        let err = reg.start_cache(&CacheConfig::new("a"), ver(1)).unwrap_err();
        assert_eq!(
            err,
            ExchangeError::CacheStart {
                cache: "a".into(),
                reason: "no room for a".into()
            }
        );
        assert!(reg.affinity_groups().is_empty());
    }
}
