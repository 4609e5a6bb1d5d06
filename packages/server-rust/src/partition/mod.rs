//! Local partitions of cache groups and the machinery that clears and evicts them.

pub mod evictor;
pub mod group;
pub mod local;
pub mod removed;
pub mod state;
pub mod store;

pub use evictor::{PartitionEvictor, TaskEvictor};
pub use group::{
    CacheGroup, GroupReservation, GroupServices, GroupSettings, PartitionEvictionListener,
};
pub use local::{CacheEntry, LocalPartition, PartitionFuture};
pub use removed::{RemoveQueue, RemovedEntry};
pub use state::{PackedState, MAX_RESERVATIONS};
pub use store::{CacheDataStore, DataRow, DataStoreManager, MemoryDataStore, MemoryDataStoreManager};

#[cfg(test)]
pub(crate) mod test_support {
    use std::sync::Arc;

    use parking_lot::Mutex;
    use partex_core::VersionGenerator;

    use super::*;
    use crate::config::PartitionConfig;

    /// Evictor that only records which partitions were handed to it.
    #[derive(Default)]
    pub struct RecordingEvictor {
        queued: Mutex<Vec<u32>>,
    }

    impl RecordingEvictor {
        pub fn queued(&self) -> Vec<u32> {
            self.queued.lock().clone()
        }
    }

    impl PartitionEvictor for RecordingEvictor {
        fn evict_partition_async(&self, part: Arc<LocalPartition>) {
            self.queued.lock().push(part.id());
        }
    }

    #[derive(Debug, Clone)]
    pub struct GroupOptions {
        pub partitions: u32,
        pub backups: u32,
        pub shared: bool,
        pub system: bool,
        pub dr_enabled: bool,
        pub allow_fast_eviction: bool,
        pub delete_history_size: usize,
        pub removed_entries_ttl_ms: u64,
    }

    impl Default for GroupOptions {
        fn default() -> Self {
            Self {
                partitions: 8,
                backups: 0,
                shared: false,
                system: false,
                dr_enabled: false,
                allow_fast_eviction: true,
                delete_history_size: 200_000,
                removed_entries_ttl_ms: 10_000,
            }
        }
    }

    pub fn test_group(
        opts: GroupOptions,
        data_stores: Arc<dyn DataStoreManager>,
        evictor: Arc<dyn PartitionEvictor>,
    ) -> Arc<CacheGroup> {
        let config = PartitionConfig {
            delete_history_size: opts.delete_history_size,
            removed_entries_ttl_ms: opts.removed_entries_ttl_ms,
            ..PartitionConfig::default()
        };
        Arc::new(CacheGroup::new(
            GroupSettings {
                group_id: 1,
                name: "test-group".into(),
                partitions: opts.partitions,
                backups: opts.backups,
                shared: opts.shared,
                system: opts.system,
                dr_enabled: opts.dr_enabled,
                allow_fast_eviction: opts.allow_fast_eviction,
            },
            GroupServices {
                local_node_id: "local".into(),
                data_stores,
                evictor,
                versions: Arc::new(VersionGenerator::system(1)),
                config: Arc::new(config),
            },
        ))
    }

    pub fn recording_group(opts: GroupOptions) -> (Arc<CacheGroup>, Arc<RecordingEvictor>) {
        let evictor = Arc::new(RecordingEvictor::default());
        let group = test_group(
            opts,
            Arc::new(MemoryDataStoreManager::new()),
            Arc::clone(&evictor) as Arc<dyn PartitionEvictor>,
        );
        (group, evictor)
    }
}
