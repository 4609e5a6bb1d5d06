//! A started cache: user-facing operations routed through the gateway to
//! the local partitions of the cache's group.

use std::fmt;
use std::sync::Arc;

use parking_lot::RwLock;
use partex_core::hash::key_partition;
use partex_core::TopologyVersion;

use super::config::CacheConfig;
use super::validator::TopologyValidator;
use crate::error::{CacheError, ExchangeError};
use crate::gateway::CacheGateway;
use crate::partition::{CacheGroup, LocalPartition};
use crate::topology::PartitionTopology;

/// Runtime state of one started cache.
///
/// Server-side caches carry their group and partition topology. Client and
/// local caches have neither; their data operations report the partition
/// as unavailable.
pub struct CacheContext {
    config: CacheConfig,
    cache_id: i32,
    group: Option<Arc<CacheGroup>>,
    topology: Option<Arc<PartitionTopology>>,
    gateway: CacheGateway,
    start_version: TopologyVersion,
    topology_validator: Option<Arc<dyn TopologyValidator>>,
    validation: RwLock<Option<ExchangeError>>,
}

impl CacheContext {
    #[must_use]
    pub fn new(
        config: CacheConfig,
        group: Option<Arc<CacheGroup>>,
        topology: Option<Arc<PartitionTopology>>,
        gateway: CacheGateway,
        start_version: TopologyVersion,
        topology_validator: Option<Arc<dyn TopologyValidator>>,
    ) -> Self {
        let cache_id = config.cache_id();
        Self {
            config,
            cache_id,
            group,
            topology,
            gateway,
            start_version,
            topology_validator,
            validation: RwLock::new(None),
        }
    }

    #[must_use]
    pub fn name(&self) -> &str {
        &self.config.name
    }

    #[must_use]
    pub fn config(&self) -> &CacheConfig {
        &self.config
    }

    #[must_use]
    pub fn cache_id(&self) -> i32 {
        self.cache_id
    }

    #[must_use]
    pub fn group_id(&self) -> i32 {
        self.config.group_id()
    }

    #[must_use]
    pub fn group(&self) -> Option<&Arc<CacheGroup>> {
        self.group.as_ref()
    }

    #[must_use]
    pub fn topology(&self) -> Option<&Arc<PartitionTopology>> {
        self.topology.as_ref()
    }

    #[must_use]
    pub fn gateway(&self) -> &CacheGateway {
        &self.gateway
    }

    /// Topology version of the exchange that started the cache.
    #[must_use]
    pub fn start_version(&self) -> TopologyVersion {
        self.start_version
    }

    #[must_use]
    pub fn topology_validator(&self) -> Option<&Arc<dyn TopologyValidator>> {
        self.topology_validator.as_ref()
    }

    /// Records the outcome of validation on the latest exchange.
    pub fn set_validation(&self, err: Option<ExchangeError>) {
        *self.validation.write() = err;
    }

    #[must_use]
    pub fn validation_error(&self) -> Option<ExchangeError> {
        self.validation.read().clone()
    }

    /// Partition a key maps to.
    #[must_use]
    pub fn partition_of(&self, key: &str) -> u32 {
        key_partition(key, self.config.partitions)
    }

    /// Writes `key`. Returns `Ok(false)` if the partition refused the write
    /// because it is being rented or evicted.
    ///
    /// # Errors
    ///
    /// Gateway, validation and partition failures.
    pub fn put(&self, key: &str, value: Vec<u8>) -> Result<bool, CacheError> {
        let _guard = self.gateway.enter()?;
        self.check_valid()?;
        let (topology, part) = self.local_partition(key)?;
        let version = topology.group().versions().next(topology.topology_version());
        Ok(part.update(self.cache_id, key, value, version)?)
    }

    /// Reads `key` from the local partition.
    ///
    /// # Errors
    ///
    /// Gateway failures, or the partition is not hosted locally.
    pub fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CacheError> {
        let _guard = self.gateway.enter()?;
        let (_, part) = self.local_partition(key)?;
        if !part.reserve() {
            return Err(self.unavailable(part.id()));
        }
        let value = part.get(self.cache_id, key).map(|e| e.value);
        part.release();
        Ok(value)
    }

    /// Removes `key`, leaving a deferred delete behind.
    ///
    /// # Errors
    ///
    /// Gateway, validation and partition failures.
    pub fn remove(&self, key: &str) -> Result<bool, CacheError> {
        let _guard = self.gateway.enter()?;
        self.check_valid()?;
        let (topology, part) = self.local_partition(key)?;
        let version = topology.group().versions().next(topology.topology_version());
        Ok(part.remove(self.cache_id, key, version)?)
    }

    /// Drops `key` from local memory and queues an eviction notice.
    ///
    /// # Errors
    ///
    /// Gateway and partition failures.
    pub fn evict(&self, key: &str) -> Result<bool, CacheError> {
        let mut guard = self.gateway.enter()?;
        let (topology, part) = self.local_partition(key)?;
        let version = topology.group().versions().next(topology.topology_version());
        let removed = part.remove(self.cache_id, key, version)?;
        if removed {
            guard.defer_eviction(key);
        }
        Ok(removed)
    }

    /// Entries of this cache held by the local partitions.
    #[must_use]
    pub fn local_size(&self) -> i64 {
        self.topology.as_ref().map_or(0, |top| {
            top.local_partitions()
                .iter()
                .map(|p| p.public_size(self.cache_id))
                .sum()
        })
    }

    fn check_valid(&self) -> Result<(), CacheError> {
        match self.validation.read().as_ref() {
            Some(err) => Err(CacheError::Invalid(err.clone())),
            None => Ok(()),
        }
    }

    fn local_partition(&self, key: &str) -> Result<(&Arc<PartitionTopology>, Arc<LocalPartition>), CacheError> {
        let partition = self.partition_of(key);
        let topology = self
            .topology
            .as_ref()
            .ok_or_else(|| self.unavailable(partition))?;
        let part = topology
            .local_partition(partition)
            .ok_or_else(|| self.unavailable(partition))?;
        Ok((topology, part))
    }

    fn unavailable(&self, partition: u32) -> CacheError {
        CacheError::PartitionUnavailable {
            cache: self.config.name.clone(),
            partition,
        }
    }
}

impl fmt::Debug for CacheContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheContext")
            .field("name", &self.config.name)
            .field("cache_id", &self.cache_id)
            .field("group_id", &self.config.group_id())
            .field("start_version", &self.start_version)
            .field("gateway", &self.gateway.state())
            .finish_non_exhaustive()
    }
}
