//! Partition data store SPI and its in-memory implementation.
//!
//! A [`CacheDataStore`] holds the rows of exactly one partition. The
//! [`DataStoreManager`] creates, destroys and recreates stores on behalf of
//! local partitions.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use partex_core::CacheVersion;

use crate::error::StoreError;

/// One stored row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DataRow {
    pub cache_id: i32,
    pub key: String,
    pub value: Vec<u8>,
    pub version: CacheVersion,
}

// ---------------------------------------------------------------------------
// Traits
// ---------------------------------------------------------------------------

/// Row storage for a single partition.
pub trait CacheDataStore: Send + Sync {
    fn partition_id(&self) -> u32;

    /// Number of rows across all caches.
    fn full_size(&self) -> u64;

    /// Inserts or replaces a row.
    ///
    /// # Errors
    ///
    /// Fails if the store was destroyed.
    fn put(&self, row: DataRow) -> Result<(), StoreError>;

    /// Removes a row; `Ok(false)` if it was absent.
    ///
    /// # Errors
    ///
    /// Fails if the store was destroyed.
    fn remove(&self, cache_id: i32, key: &str) -> Result<bool, StoreError>;

    /// Snapshot of every row, for clearing passes.
    ///
    /// # Errors
    ///
    /// Fails if the store was destroyed.
    fn rows(&self) -> Result<Vec<DataRow>, StoreError>;

    /// Removes every row of one cache, returning how many were dropped.
    ///
    /// # Errors
    ///
    /// Fails if the store was destroyed.
    fn clear_cache(&self, cache_id: i32) -> Result<usize, StoreError>;

    fn update_counter(&self) -> u64;
    fn next_update_counter(&self) -> u64;
    fn set_update_counter(&self, value: u64);
    fn initial_update_counter(&self) -> u64;
    fn set_initial_update_counter(&self, value: u64);
}

/// Lifecycle of partition stores.
pub trait DataStoreManager: Send + Sync {
    /// # Errors
    ///
    /// Returns [`StoreError::Create`] if the store cannot be allocated.
    fn create_data_store(&self, partition: u32) -> Result<Arc<dyn CacheDataStore>, StoreError>;

    /// # Errors
    ///
    /// Returns an error if the store could not be released.
    fn destroy_data_store(&self, store: &Arc<dyn CacheDataStore>) -> Result<(), StoreError>;

    /// Destroys `store` and returns a fresh empty one for the same partition.
    ///
    /// # Errors
    ///
    /// Returns an error if either step fails.
    fn recreate_data_store(
        &self,
        store: &Arc<dyn CacheDataStore>,
    ) -> Result<Arc<dyn CacheDataStore>, StoreError> {
        let partition = store.partition_id();
        self.destroy_data_store(store)?;
        self.create_data_store(partition)
    }
}

// ---------------------------------------------------------------------------
// In-memory implementation
// ---------------------------------------------------------------------------

/// In-memory partition store backed by [`DashMap`].
pub struct MemoryDataStore {
    partition: u32,
    rows: DashMap<(i32, String), DataRow>,
    update_counter: AtomicU64,
    initial_update_counter: AtomicU64,
    destroyed: AtomicBool,
}

impl MemoryDataStore {
    #[must_use]
    pub fn new(partition: u32) -> Self {
        Self {
            partition,
            rows: DashMap::new(),
            update_counter: AtomicU64::new(0),
            initial_update_counter: AtomicU64::new(0),
            destroyed: AtomicBool::new(false),
        }
    }

    fn check_alive(&self) -> Result<(), StoreError> {
        if self.destroyed.load(Ordering::Acquire) {
            return Err(StoreError::Destroyed {
                partition: self.partition,
            });
        }
        Ok(())
    }

    fn destroy(&self) {
        self.destroyed.store(true, Ordering::Release);
        self.rows.clear();
    }
}

impl CacheDataStore for MemoryDataStore {
    fn partition_id(&self) -> u32 {
        self.partition
    }

    fn full_size(&self) -> u64 {
        self.rows.len() as u64
    }

    fn put(&self, row: DataRow) -> Result<(), StoreError> {
        self.check_alive()?;
        self.rows.insert((row.cache_id, row.key.clone()), row);
        Ok(())
    }

    fn remove(&self, cache_id: i32, key: &str) -> Result<bool, StoreError> {
        self.check_alive()?;
        Ok(self.rows.remove(&(cache_id, key.to_string())).is_some())
    }

    fn rows(&self) -> Result<Vec<DataRow>, StoreError> {
        self.check_alive()?;
        Ok(self.rows.iter().map(|r| r.value().clone()).collect())
    }

    fn clear_cache(&self, cache_id: i32) -> Result<usize, StoreError> {
        self.check_alive()?;
        let before = self.rows.len();
        self.rows.retain(|(id, _), _| *id != cache_id);
        Ok(before - self.rows.len())
    }

    fn update_counter(&self) -> u64 {
        self.update_counter.load(Ordering::Acquire)
    }

    fn next_update_counter(&self) -> u64 {
        self.update_counter.fetch_add(1, Ordering::AcqRel) + 1
    }

    fn set_update_counter(&self, value: u64) {
        self.update_counter.fetch_max(value, Ordering::AcqRel);
    }

    fn initial_update_counter(&self) -> u64 {
        self.initial_update_counter.load(Ordering::Acquire)
    }

    fn set_initial_update_counter(&self, value: u64) {
        self.initial_update_counter.store(value, Ordering::Release);
    }
}

/// Manager handing out [`MemoryDataStore`]s.
#[derive(Default)]
pub struct MemoryDataStoreManager {
    live: DashMap<u32, Arc<MemoryDataStore>>,
    created: AtomicUsize,
}

impl MemoryDataStoreManager {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Stores created and not yet destroyed.
    #[must_use]
    pub fn live_stores(&self) -> usize {
        self.live.len()
    }

    /// Stores created over the manager's lifetime.
    #[must_use]
    pub fn created_stores(&self) -> usize {
        self.created.load(Ordering::Relaxed)
    }
}

impl DataStoreManager for MemoryDataStoreManager {
    fn create_data_store(&self, partition: u32) -> Result<Arc<dyn CacheDataStore>, StoreError> {
        let store = Arc::new(MemoryDataStore::new(partition));
        self.live.insert(partition, Arc::clone(&store));
        self.created.fetch_add(1, Ordering::Relaxed);
        Ok(store)
    }

    fn destroy_data_store(&self, store: &Arc<dyn CacheDataStore>) -> Result<(), StoreError> {
        // A partition id can be re-created before the old store is destroyed;
        // only drop the exact store we were handed.
        let target = Arc::as_ptr(store).cast::<()>();
        let removed = self
            .live
            .remove_if(&store.partition_id(), |_, live| Arc::as_ptr(live).cast::<()>() == target);
        if let Some((_, live)) = removed {
            live.destroy();
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn row(cache_id: i32, key: &str) -> DataRow {
        DataRow {
            cache_id,
            key: key.to_string(),
            value: vec![1, 2, 3],
            version: CacheVersion::new(1, 1, 1),
        }
    }

    #[test]
    fn put_remove_and_size() {
        let store = MemoryDataStore::new(4);
        store.put(row(1, "a")).unwrap();
        store.put(row(1, "b")).unwrap();
        store.put(row(2, "a")).unwrap();
        assert_eq!(store.full_size(), 3);
        assert!(store.remove(1, "a").unwrap());
        assert!(!store.remove(1, "a").unwrap());
        assert_eq!(store.clear_cache(2).unwrap(), 1);
        assert_eq!(store.full_size(), 1);
    }

    #[test]
    fn update_counters_only_move_forward() {
        let store = MemoryDataStore::new(0);
        assert_eq!(store.next_update_counter(), 1);
        assert_eq!(store.next_update_counter(), 2);
        store.set_update_counter(1);
        assert_eq!(store.update_counter(), 2);
        store.set_update_counter(10);
        assert_eq!(store.update_counter(), 10);
    }

    #[test]
    fn destroyed_store_rejects_writes() {
        let manager = MemoryDataStoreManager::new();
        let store = manager.create_data_store(9).unwrap();
        store.put(row(1, "k")).unwrap();
        manager.destroy_data_store(&store).unwrap();
        assert_eq!(manager.live_stores(), 0);
        assert_eq!(
            store.put(row(1, "k")),
            Err(StoreError::Destroyed { partition: 9 })
        );
    }

    #[test]
    fn recreate_returns_empty_store() {
        let manager = MemoryDataStoreManager::new();
        let store = manager.create_data_store(2).unwrap();
        store.put(row(1, "k")).unwrap();
        let fresh = manager.recreate_data_store(&store).unwrap();
        assert_eq!(fresh.partition_id(), 2);
        assert_eq!(fresh.full_size(), 0);
        assert_eq!(manager.live_stores(), 1);
        assert_eq!(manager.created_stores(), 2);
    }
}
