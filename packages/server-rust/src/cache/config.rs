//! Cache configuration carried by dynamic cache start requests.

use partex_core::hash::fnv1a_hash;
use serde::{Deserialize, Serialize};

/// Upper bound on partitions per cache group.
pub const MAX_PARTITIONS: u32 = 65_000;

/// Configuration of one cache.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct CacheConfig {
    pub name: String,
    /// Caches naming the same group share partitions; `None` gives the cache its own group.
    pub group_name: Option<String>,
    pub partitions: u32,
    pub backups: u32,
    pub system: bool,
    /// Disaster-recovery replication: deferred deletes are kept until the size cap.
    pub dr_enabled: bool,
    pub allow_fast_eviction: bool,
    /// Local caches live on one node and take no part in exchanges.
    pub local: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        Self {
            name: String::new(),
            group_name: None,
            partitions: 64,
            backups: 0,
            system: false,
            dr_enabled: false,
            allow_fast_eviction: true,
            local: false,
        }
    }
}

/// Stable id derived from a cache or group name.
#[must_use]
pub fn name_id(name: &str) -> i32 {
    i32::from_ne_bytes(fnv1a_hash(name).to_ne_bytes())
}

impl CacheConfig {
    #[must_use]
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            ..Self::default()
        }
    }

    #[must_use]
    pub fn with_partitions(mut self, partitions: u32) -> Self {
        self.partitions = partitions;
        self
    }

    #[must_use]
    pub fn with_backups(mut self, backups: u32) -> Self {
        self.backups = backups;
        self
    }

    #[must_use]
    pub fn with_group(mut self, group: impl Into<String>) -> Self {
        self.group_name = Some(group.into());
        self
    }

    #[must_use]
    pub fn group_name(&self) -> &str {
        self.group_name.as_deref().unwrap_or(&self.name)
    }

    #[must_use]
    pub fn cache_id(&self) -> i32 {
        name_id(&self.name)
    }

    #[must_use]
    pub fn group_id(&self) -> i32 {
        name_id(self.group_name())
    }

    /// Checks the configuration can be started.
    ///
    /// # Errors
    ///
    /// Returns the reason when the name is empty or the partition count is out of range.
    pub fn validate(&self) -> Result<(), String> {
        if self.name.trim().is_empty() {
            return Err("cache name must not be empty".into());
        }
        if self.partitions == 0 || self.partitions > MAX_PARTITIONS {
            return Err(format!(
                "partition count must be in 1..={MAX_PARTITIONS}, got {}",
                self.partitions
            ));
        }
        Ok(())
    }
}
