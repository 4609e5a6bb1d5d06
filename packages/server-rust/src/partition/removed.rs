//! Deferred-delete queue of a local partition.
//!
//! Removed entries stay in the partition as tombstones for a while so late
//! conflicting updates can be ordered against them. The queue remembers
//! them oldest-first and is trimmed by a hard size cap and by age.

use std::collections::VecDeque;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use partex_core::CacheVersion;

/// A tombstone awaiting final removal.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemovedEntry {
    pub cache_id: i32,
    pub key: String,
    pub version: CacheVersion,
    pub expire_at: Instant,
}

/// Bounded FIFO of [`RemovedEntry`]s.
#[derive(Debug)]
pub struct RemoveQueue {
    entries: Mutex<VecDeque<RemovedEntry>>,
    max_size: usize,
    ttl: Duration,
}

impl RemoveQueue {
    #[must_use]
    pub fn new(max_size: usize, ttl: Duration) -> Self {
        Self {
            entries: Mutex::new(VecDeque::with_capacity(max_size.min(1024))),
            max_size: max_size.max(1),
            ttl,
        }
    }

    #[must_use]
    pub fn max_size(&self) -> usize {
        self.max_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    /// Appends a tombstone that expires one TTL from `now`.
    ///
    /// Trimming and the append happen under one lock, so concurrent removals
    /// never push the queue past its cap. The oldest entries are dropped
    /// until there is room for the new one. Unless `keep_expired` is set,
    /// entries past their TTL are dropped too. Returns the dropped entries,
    /// oldest first.
    pub fn push(
        &self,
        cache_id: i32,
        key: String,
        version: CacheVersion,
        now: Instant,
        keep_expired: bool,
    ) -> Vec<RemovedEntry> {
        let mut entries = self.entries.lock();
        let mut dropped = Vec::new();

        while entries.len() >= self.max_size {
            match entries.pop_front() {
                Some(e) => dropped.push(e),
                None => break,
            }
        }

        if !keep_expired {
            while entries.front().is_some_and(|e| e.expire_at <= now) {
                if let Some(e) = entries.pop_front() {
                    dropped.push(e);
                }
            }
        }

        entries.push_back(RemovedEntry {
            cache_id,
            key,
            version,
            expire_at: now + self.ttl,
        });
        dropped
    }

    /// Removes and returns every entry.
    pub fn drain(&self) -> Vec<RemovedEntry> {
        self.entries.lock().drain(..).collect()
    }

    /// Removes and returns every entry of one cache.
    pub fn drain_cache(&self, cache_id: i32) -> Vec<RemovedEntry> {
        let mut entries = self.entries.lock();
        let (gone, kept): (Vec<_>, Vec<_>) = entries.drain(..).partition(|e| e.cache_id == cache_id);
        entries.extend(kept);
        gone
    }

    /// Keys currently queued, oldest first.
    #[must_use]
    pub fn keys(&self) -> Vec<String> {
        self.entries.lock().iter().map(|e| e.key.clone()).collect()
    }
}
