//! Cache group context shared by the local partitions of one group.
//!
//! A group owns the settings every partition consults (partition count,
//! shared/system/replication flags), the data store manager, the evictor,
//! the version generator and the affinity history.

use std::collections::BTreeSet;
use std::fmt;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock, Weak};

use parking_lot::RwLock;
use partex_core::VersionGenerator;

use super::evictor::PartitionEvictor;
use super::store::DataStoreManager;
use crate::affinity::AffinityCache;
use crate::config::PartitionConfig;

/// Receives notification that a partition finished eviction and was destroyed.
pub trait PartitionEvictionListener: Send + Sync {
    fn on_partition_evicted(&self, partition: u32, update_seq: bool);
}

/// A lease on a set of partitions held by a long-running reader (scan, query).
pub trait GroupReservation: Send + Sync {
    /// Tries to invalidate the lease; `false` means it is still in use.
    fn invalidate(&self) -> bool;
}

/// Static description of a cache group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GroupSettings {
    pub group_id: i32,
    pub name: String,
    pub partitions: u32,
    pub backups: u32,
    /// More than one cache may live in the group.
    pub shared: bool,
    pub system: bool,
    /// Disaster-recovery replication keeps deferred deletes until the size cap.
    pub dr_enabled: bool,
    /// Stores can be dropped wholesale instead of row by row.
    pub allow_fast_eviction: bool,
}

/// Node-level services handed to every group.
#[derive(Clone)]
pub struct GroupServices {
    pub local_node_id: String,
    pub data_stores: Arc<dyn DataStoreManager>,
    pub evictor: Arc<dyn PartitionEvictor>,
    pub versions: Arc<VersionGenerator>,
    pub config: Arc<PartitionConfig>,
}

/// Runtime context of one cache group.
pub struct CacheGroup {
    settings: GroupSettings,
    services: GroupServices,
    affinity: AffinityCache,
    caches: RwLock<BTreeSet<i32>>,
    stopping: AtomicBool,
    eviction_listener: OnceLock<Weak<dyn PartitionEvictionListener>>,
}

impl CacheGroup {
    #[must_use]
    pub fn new(settings: GroupSettings, services: GroupServices) -> Self {
        let affinity = AffinityCache::new(settings.partitions, settings.backups);
        Self {
            settings,
            services,
            affinity,
            caches: RwLock::new(BTreeSet::new()),
            stopping: AtomicBool::new(false),
            eviction_listener: OnceLock::new(),
        }
    }

    #[must_use]
    pub fn group_id(&self) -> i32 {
        self.settings.group_id
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.settings.name
    }

    #[must_use]
    pub fn settings(&self) -> &GroupSettings {
        &self.settings
    }

    #[must_use]
    pub fn shared(&self) -> bool {
        self.settings.shared
    }

    #[must_use]
    pub fn dr_enabled(&self) -> bool {
        self.settings.dr_enabled
    }

    #[must_use]
    pub fn allow_fast_eviction(&self) -> bool {
        self.settings.allow_fast_eviction
    }

    #[must_use]
    pub fn local_node_id(&self) -> &str {
        &self.services.local_node_id
    }

    #[must_use]
    pub fn affinity(&self) -> &AffinityCache {
        &self.affinity
    }

    #[must_use]
    pub fn data_stores(&self) -> &Arc<dyn DataStoreManager> {
        &self.services.data_stores
    }

    #[must_use]
    pub fn evictor(&self) -> &Arc<dyn PartitionEvictor> {
        &self.services.evictor
    }

    #[must_use]
    pub fn versions(&self) -> &Arc<VersionGenerator> {
        &self.services.versions
    }

    #[must_use]
    pub fn config(&self) -> &PartitionConfig {
        &self.services.config
    }

    /// Capacity of each partition's deferred-delete queue.
    #[must_use]
    pub fn delete_queue_size(&self) -> usize {
        self.services
            .config
            .delete_queue_size(self.settings.partitions, self.settings.system)
    }

    pub fn add_cache(&self, cache_id: i32) {
        self.caches.write().insert(cache_id);
    }

    /// Returns `true` when the group has no caches left.
    pub fn remove_cache(&self, cache_id: i32) -> bool {
        let mut caches = self.caches.write();
        caches.remove(&cache_id);
        caches.is_empty()
    }

    #[must_use]
    pub fn cache_ids(&self) -> Vec<i32> {
        self.caches.read().iter().copied().collect()
    }

    /// Marks the node as stopping; clearing passes abort with `NodeStopping`.
    pub fn on_node_stop(&self) {
        self.stopping.store(true, Ordering::Release);
    }

    #[must_use]
    pub fn is_stopping(&self) -> bool {
        self.stopping.load(Ordering::Acquire)
    }

    /// Registers the component notified when partitions are destroyed.
    ///
    /// Only the first registration takes effect.
    pub fn set_eviction_listener(&self, listener: Weak<dyn PartitionEvictionListener>) {
        if self.eviction_listener.set(listener).is_err() {
            tracing::warn!(group = %self.settings.name, "eviction listener already registered");
        }
    }

    pub(crate) fn on_partition_evicted(&self, partition: u32, update_seq: bool) {
        if let Some(listener) = self.eviction_listener.get().and_then(Weak::upgrade) {
            listener.on_partition_evicted(partition, update_seq);
        }
    }
}

impl fmt::Debug for CacheGroup {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGroup")
            .field("settings", &self.settings)
            .field("local_node_id", &self.services.local_node_id)
            .field("caches", &*self.caches.read())
            .finish_non_exhaustive()
    }
}
