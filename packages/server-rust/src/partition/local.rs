//! Local partition: lifecycle state machine, reservations, clearing and eviction.
//!
//! State, reservation count and size live in one packed atomic word (see
//! [`super::state`]); every transition is a compare-and-swap loop on it.
//! Clearing and eviction share a re-armable clear future: renting arms it
//! with an eviction listener, a MOVING-state clear arms it with a listener
//! that just drops the clear flag.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicI64, AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};

use dashmap::DashMap;
use parking_lot::{ReentrantMutex, RwLock};
use partex_core::{CacheVersion, PartitionState, TopologyVersion};
use tracing::{debug, error, warn};

use super::group::{CacheGroup, GroupReservation};
use super::removed::RemoveQueue;
use super::state::{PackedState, MAX_RESERVATIONS};
use super::store::{CacheDataStore, DataRow};
use crate::error::PartitionError;
use crate::future::GridFuture;

/// Completion of a rent (eviction + destroy) or a clearing pass.
pub type PartitionFuture = GridFuture<(), PartitionError>;

/// A cached entry owned by a partition.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheEntry {
    pub key: String,
    pub value: Vec<u8>,
    pub version: CacheVersion,
    /// Tombstone kept until its deferred delete is processed.
    pub deleted: bool,
}

#[derive(Default)]
struct CacheMap {
    entries: DashMap<String, CacheEntry>,
    size: AtomicI64,
}

enum EntryMaps {
    Single(Arc<CacheMap>),
    Shared(DashMap<i32, Arc<CacheMap>>),
}

impl EntryMaps {
    fn get(&self, cache_id: i32) -> Option<Arc<CacheMap>> {
        match self {
            EntryMaps::Single(map) => Some(Arc::clone(map)),
            EntryMaps::Shared(maps) => maps.get(&cache_id).map(|m| Arc::clone(m.value())),
        }
    }

    fn get_or_create(&self, cache_id: i32) -> Arc<CacheMap> {
        match self {
            EntryMaps::Single(map) => Arc::clone(map),
            EntryMaps::Shared(maps) => Arc::clone(maps.entry(cache_id).or_default().value()),
        }
    }

    fn all(&self) -> Vec<Arc<CacheMap>> {
        match self {
            EntryMaps::Single(map) => vec![Arc::clone(map)],
            EntryMaps::Shared(maps) => maps.iter().map(|m| Arc::clone(m.value())).collect(),
        }
    }

    fn internal_size(&self) -> usize {
        self.all().iter().map(|m| m.entries.len()).sum()
    }
}

/// One partition of a cache group held by the local node.
pub struct LocalPartition {
    id: u32,
    group: Arc<CacheGroup>,
    self_ref: Weak<LocalPartition>,

    /// Packed state word. All transitions go through CAS with AcqRel so the
    /// state, reservation count and size are published together.
    state: AtomicU64,
    /// 0 = idle, >0 = clearing threads, -1 = destroying.
    evict_guard: AtomicI32,
    delayed_renting: AtomicBool,
    /// A MOVING-state clear was requested.
    clear: AtomicBool,

    rent: PartitionFuture,
    clear_future: PartitionFuture,
    /// Serializes re-arming and completion of `clear_future`. Reentrant
    /// because completion listeners may re-arm on the same thread.
    clear_mux: ReentrantMutex<()>,

    entries: EntryMaps,
    remove_queue: RemoveQueue,
    store: RwLock<Arc<dyn CacheDataStore>>,
    reservations: RwLock<Vec<Arc<dyn GroupReservation>>>,
}

impl LocalPartition {
    /// Creates a MOVING partition with a fresh data store.
    ///
    /// # Errors
    ///
    /// Fails if the data store cannot be created; the group cannot host the
    /// partition without it.
    pub fn new(group: Arc<CacheGroup>, id: u32) -> Result<Arc<Self>, PartitionError> {
        let store = group.data_stores().create_data_store(id)?;
        let remove_queue = RemoveQueue::new(
            group.delete_queue_size(),
            group.config().removed_entries_ttl(),
        );
        let entries = if group.shared() {
            EntryMaps::Shared(DashMap::new())
        } else {
            EntryMaps::Single(Arc::new(CacheMap::default()))
        };

        Ok(Arc::new_cyclic(|self_ref| Self {
            id,
            group,
            self_ref: self_ref.clone(),
            state: AtomicU64::new(PackedState::initial(PartitionState::Moving).raw()),
            evict_guard: AtomicI32::new(0),
            delayed_renting: AtomicBool::new(false),
            clear: AtomicBool::new(false),
            rent: GridFuture::new(),
            clear_future: GridFuture::completed(Ok(())),
            clear_mux: ReentrantMutex::new(()),
            entries,
            remove_queue,
            store: RwLock::new(store),
            reservations: RwLock::new(Vec::new()),
        }))
    }

    // -----------------------------------------------------------------------
    // Accessors
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    #[must_use]
    pub fn group(&self) -> &Arc<CacheGroup> {
        &self.group
    }

    fn load(&self) -> PackedState {
        PackedState::from_raw(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn state(&self) -> PartitionState {
        self.load().state()
    }

    #[must_use]
    pub fn reservations(&self) -> u32 {
        self.load().reservations()
    }

    /// Live entries across every cache of the partition.
    #[must_use]
    pub fn internal_size(&self) -> i32 {
        self.load().size()
    }

    /// Live entries of one cache.
    #[must_use]
    pub fn public_size(&self, cache_id: i32) -> i64 {
        self.entries
            .get(cache_id)
            .map_or(0, |m| m.size.load(Ordering::Acquire))
    }

    /// Rows in the data store.
    #[must_use]
    pub fn full_size(&self) -> u64 {
        self.data_store().full_size()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        if self.group.allow_fast_eviction() {
            self.internal_size() == 0
        } else {
            self.internal_size() == 0 && self.full_size() == 0
        }
    }

    /// `true` while the partition can serve reads.
    #[must_use]
    pub fn valid(&self) -> bool {
        matches!(self.state(), PartitionState::Owning | PartitionState::Moving)
    }

    #[must_use]
    pub fn data_store(&self) -> Arc<dyn CacheDataStore> {
        Arc::clone(&self.store.read())
    }

    /// Future completed once the partition is evicted and destroyed.
    #[must_use]
    pub fn rent_future(&self) -> PartitionFuture {
        self.rent.clone()
    }

    /// `true` if the local node is primary for this partition at `top_ver`.
    #[must_use]
    pub fn primary(&self, top_ver: TopologyVersion) -> bool {
        let owners = self.group.affinity().owners(top_ver, self.id);
        owners.first().is_some_and(|n| n == self.group.local_node_id())
    }

    /// `true` if the local node is a backup for this partition at `top_ver`.
    #[must_use]
    pub fn backup(&self, top_ver: TopologyVersion) -> bool {
        let owners = self.group.affinity().owners(top_ver, self.id);
        owners
            .iter()
            .position(|n| n == self.group.local_node_id())
            .is_some_and(|i| i > 0)
    }

    // -----------------------------------------------------------------------
    // Update counters
    // -----------------------------------------------------------------------

    #[must_use]
    pub fn update_counter(&self) -> u64 {
        self.data_store().update_counter()
    }

    pub fn next_update_counter(&self) -> u64 {
        self.data_store().next_update_counter()
    }

    pub fn set_update_counter(&self, value: u64) {
        self.data_store().set_update_counter(value);
    }

    #[must_use]
    pub fn initial_update_counter(&self) -> u64 {
        self.data_store().initial_update_counter()
    }

    pub fn set_initial_update_counter(&self, value: u64) {
        self.data_store().set_initial_update_counter(value);
    }

    // -----------------------------------------------------------------------
    // Reservations
    // -----------------------------------------------------------------------

    /// Takes a lease on the partition so it won't be cleared or evicted.
    ///
    /// Returns `false` for an EVICTED partition or when the reservation
    /// counter is saturated.
    pub fn reserve(&self) -> bool {
        loop {
            let cur = self.load();
            if cur.state() == PartitionState::Evicted {
                return false;
            }
            let reservations = cur.reservations();
            if reservations >= MAX_RESERVATIONS {
                warn!(part = self.id, "reservation counter saturated");
                return false;
            }
            let next = cur.with_reservations(reservations + 1);
            if self.cas(cur, next) {
                return true;
            }
        }
    }

    /// Releases a lease taken with [`reserve`](Self::reserve).
    pub fn release(&self) {
        self.release0(0);
    }

    /// Releases a lease and applies `size_change` in the same atomic step.
    ///
    /// Dropping the last lease resumes a delayed rent or a delayed clear.
    fn release0(&self, size_change: i32) {
        loop {
            let cur = self.load();
            let reservations = cur.reservations();
            if reservations == 0 {
                warn!(part = self.id, "release without matching reserve");
                return;
            }
            let next = cur
                .with_reservations(reservations - 1)
                .with_size(cur.size() + size_change);
            if self.cas(cur, next) {
                if reservations == 1 {
                    if self.delayed_renting.load(Ordering::Acquire) {
                        self.rent(true);
                    } else {
                        self.try_continue_clearing();
                    }
                }
                return;
            }
        }
    }

    fn add_size(&self, delta: i32) {
        loop {
            let cur = self.load();
            if self.cas(cur, cur.with_size(cur.size() + delta)) {
                return;
            }
        }
    }

    /// Registers a group reservation. Refused once the partition is EVICTED.
    pub fn add_reservation(&self, reservation: Arc<dyn GroupReservation>) -> bool {
        if self.state() == PartitionState::Evicted {
            return false;
        }
        self.reservations.write().push(reservation);
        true
    }

    pub fn remove_reservation(&self, reservation: &Arc<dyn GroupReservation>) {
        self.reservations
            .write()
            .retain(|r| !Arc::ptr_eq(r, reservation));
    }

    fn group_reserved(&self) -> bool {
        // A reservation that refuses to invalidate is still in use.
        self.reservations.read().iter().any(|r| !r.invalidate())
    }

    // -----------------------------------------------------------------------
    // State transitions
    // -----------------------------------------------------------------------

    fn cas(&self, cur: PackedState, next: PackedState) -> bool {
        self.state
            .compare_exchange(cur.raw(), next.raw(), Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn cas_state(&self, cur: PackedState, to: PartitionState) -> bool {
        self.cas(cur, cur.with_state(to))
    }

    /// MOVING|LOST -> OWNING. `false` once renting has begun.
    pub fn own(&self) -> bool {
        loop {
            let cur = self.load();
            match cur.state() {
                PartitionState::Renting | PartitionState::Evicted => return false,
                PartitionState::Owning => return true,
                PartitionState::Moving | PartitionState::Lost => {
                    if self.cas_state(cur, PartitionState::Owning) {
                        debug!(part = self.id, "owned partition");
                        return true;
                    }
                }
            }
        }
    }

    /// OWNING|RENTING -> MOVING, forcing the partition to be reloaded.
    ///
    /// # Errors
    ///
    /// [`PartitionError::IllegalTransition`] from any other state.
    pub fn moving(&self) -> Result<(), PartitionError> {
        loop {
            let cur = self.load();
            let from = cur.state();
            if !matches!(from, PartitionState::Owning | PartitionState::Renting) {
                return Err(PartitionError::IllegalTransition {
                    partition: self.id,
                    from,
                    to: PartitionState::Moving,
                });
            }
            if self.cas_state(cur, PartitionState::Moving) {
                debug!(part = self.id, "forcibly moved partition to MOVING");
                return Ok(());
            }
        }
    }

    /// Any live state -> LOST. Returns `false` if already LOST or EVICTED.
    pub fn mark_lost(&self) -> bool {
        loop {
            let cur = self.load();
            if matches!(cur.state(), PartitionState::Lost | PartitionState::Evicted) {
                return false;
            }
            if self.cas_state(cur, PartitionState::Lost) {
                debug!(part = self.id, "marked partition as LOST");
                return true;
            }
        }
    }

    /// Starts eviction.
    ///
    /// With live reservations the transition to RENTING is deferred until the
    /// last one is released. The returned future completes once the partition
    /// is evicted and its store destroyed.
    pub fn rent(&self, update_seq: bool) -> PartitionFuture {
        let cur = self.load();
        if matches!(cur.state(), PartitionState::Renting | PartitionState::Evicted) {
            return self.rent.clone();
        }

        self.delayed_renting.store(true, Ordering::Release);

        if cur.reservations() == 0 && self.cas_state(cur, PartitionState::Renting) {
            self.delayed_renting.store(false, Ordering::Release);
            debug!(part = self.id, "moved partition to RENTING");
            // Clearing may run on the evictor; rent can be called from under
            // topology-level locks.
            self.clear_async0(update_seq);
        }

        self.rent.clone()
    }

    // -----------------------------------------------------------------------
    // Clearing
    // -----------------------------------------------------------------------

    /// Clears a MOVING partition without changing its state.
    ///
    /// Rows written after the clear was requested survive the pass.
    pub fn clear_async(&self) {
        if self.state() != PartitionState::Moving {
            return;
        }
        self.clear.store(true, Ordering::Release);
        self.clear_async0(false);
    }

    /// Resumes a clear or eviction that was held back by reservations.
    pub fn try_continue_clearing(&self) {
        self.clear_async0(true);
    }

    /// Re-arms the clear future if it is done and attaches the listener
    /// for this round. Returns `true` if it was re-armed.
    fn prepare_clear_future(&self, update_seq: bool, eviction_requested: bool) -> bool {
        let _guard = self.clear_mux.lock();

        let done = self.clear_future.is_done();
        if done {
            self.clear_future.reset();
        }

        let weak = self.self_ref.clone();
        if eviction_requested {
            self.clear_future.listen(move |res| {
                let Some(part) = weak.upgrade() else { return };
                match res {
                    Ok(()) => part.finish_eviction(update_seq),
                    Err(e) => {
                        part.rent.on_done(Err(e.clone()));
                    }
                }
            });
        } else {
            self.clear_future.listen(move |_| {
                if let Some(part) = weak.upgrade() {
                    part.clear.store(false, Ordering::Release);
                }
            });
        }

        done
    }

    fn clear_async0(&self, update_seq: bool) {
        let cur = self.load();
        let state = cur.state();

        let eviction_requested =
            state == PartitionState::Renting || self.delayed_renting.load(Ordering::Acquire);
        let clearing_requested = state == PartitionState::Moving && self.clear.load(Ordering::Acquire);

        if !eviction_requested && !clearing_requested {
            return;
        }

        // A pass is already running; it will pick up this request.
        if !self.prepare_clear_future(update_seq, eviction_requested) {
            return;
        }

        if self.is_empty() && cur.size() == 0 && cur.reservations() == 0 && !self.group_reserved() {
            let evicted = state == PartitionState::Renting && self.cas_state(cur, PartitionState::Evicted);
            if evicted || clearing_requested {
                self.finish_clear_future();
                return;
            }
        }

        if let Some(me) = self.self_ref.upgrade() {
            self.group.evictor().evict_partition_async(me);
        }
    }

    /// Runs a clearing pass if the partition is unreserved.
    ///
    /// Returns `Ok(false)` when reservations prevent clearing, `Ok(true)`
    /// when the pass ran or nothing was pending. Only one thread clears at a
    /// time; others return `Ok(true)` immediately.
    ///
    /// # Errors
    ///
    /// [`PartitionError::NodeStopping`] if the node began stopping mid-pass,
    /// or a store error. Either also fails the clear future.
    pub fn try_clear(&self) -> Result<bool, PartitionError> {
        if self.clear_future.is_done() {
            return Ok(true);
        }

        if self.reservations() != 0 || self.group_reserved() {
            return Ok(false);
        }

        if self.add_evicting() {
            let res = self.clear_all();
            match &res {
                Ok(cleared) => debug!(part = self.id, cleared, "partition cleared"),
                Err(e) => {
                    let _guard = self.clear_mux.lock();
                    self.clear_future.on_done(Err(e.clone()));
                }
            }

            if self.clear_evicting() {
                self.finish_clear_future();
            }

            res?;
        }

        Ok(true)
    }

    /// Removes entries and store rows.
    ///
    /// During a MOVING-state clear, rows at or after the clear version are kept.
    fn clear_all(&self) -> Result<u64, PartitionError> {
        let clear_ver = self
            .group
            .versions()
            .next(self.group.affinity().last_version());
        let keep_fresh =
            || self.state() == PartitionState::Moving && self.clear.load(Ordering::Acquire);

        let mut cleared = 0u64;
        let mut removed_live = 0i32;

        for map in self.entries.all() {
            if self.group.is_stopping() {
                return Err(PartitionError::NodeStopping);
            }
            let keys: Vec<(String, bool)> = map
                .entries
                .iter()
                .filter(|e| !(keep_fresh() && e.version >= clear_ver))
                .map(|e| (e.key().clone(), e.deleted))
                .collect();
            for (key, deleted) in keys {
                if map.entries.remove(&key).is_some() && !deleted {
                    map.size.fetch_sub(1, Ordering::AcqRel);
                    removed_live += 1;
                }
                cleared += 1;
            }
        }

        if removed_live != 0 {
            self.add_size(-removed_live);
        }

        if !self.group.allow_fast_eviction() {
            let store = self.data_store();
            for row in store.rows()? {
                if self.group.is_stopping() {
                    return Err(PartitionError::NodeStopping);
                }
                if keep_fresh() && row.version >= clear_ver {
                    continue;
                }
                if store.remove(row.cache_id, &row.key)? {
                    cleared += 1;
                }
            }
        }

        Ok(cleared)
    }

    fn finish_clear_future(&self) {
        if self.state() == PartitionState::Moving
            && self.clear.load(Ordering::Acquire)
            && self.group.allow_fast_eviction()
        {
            let current = self.data_store();
            match self.group.data_stores().recreate_data_store(&current) {
                Ok(fresh) => *self.store.write() = fresh,
                Err(e) => {
                    let _guard = self.clear_mux.lock();
                    self.clear_future.on_done(Err(e.into()));
                    return;
                }
            }
        }

        let _guard = self.clear_mux.lock();
        self.clear_future.on_done(Ok(()));
    }

    /// Waits for the running clear pass.
    ///
    /// # Errors
    ///
    /// [`PartitionError::ClearTimeout`] if it does not finish in time, or the
    /// error the pass failed with.
    pub fn await_clearing(&self, timeout: Duration) -> Result<(), PartitionError> {
        match self.clear_future.wait_timeout(timeout) {
            Some(res) => res,
            None => Err(PartitionError::ClearTimeout {
                partition: self.id,
                timeout_ms: u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX),
            }),
        }
    }

    // -----------------------------------------------------------------------
    // Eviction guard and destroy
    // -----------------------------------------------------------------------

    fn add_evicting(&self) -> bool {
        self.evict_guard
            .compare_exchange(0, 1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    /// Returns `true` if no thread is clearing any more.
    fn clear_evicting(&self) -> bool {
        let prev = self.evict_guard.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "evict guard underflow: {prev}");
        prev == 1
    }

    fn mark_for_destroy(&self) -> bool {
        self.evict_guard
            .compare_exchange(0, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
    }

    fn finish_eviction(&self, update_seq: bool) {
        let cur = self.load();
        let state = cur.state();

        let evicted = state == PartitionState::Evicted
            || (self.is_empty()
                && cur.size() == 0
                && cur.reservations() == 0
                && state == PartitionState::Renting
                && self.cas_state(cur, PartitionState::Evicted));

        if evicted {
            debug!(part = self.id, "evicted partition");
            if self.mark_for_destroy() {
                self.finish_destroy(update_seq);
            }
        }
    }

    fn finish_destroy(&self, update_seq: bool) {
        debug_assert_eq!(self.state(), PartitionState::Evicted);

        self.group.on_partition_evicted(self.id, update_seq);

        let store = self.data_store();
        if let Err(e) = self.group.data_stores().destroy_data_store(&store) {
            error!(part = self.id, error = %e, "unable to destroy data store on partition eviction");
        }

        self.rent.on_done(Ok(()));

        self.clear_deferred_deletes();
    }

    /// Blocks until an EVICTED partition finishes destroying.
    pub fn await_destroy(&self) {
        if self.state() == PartitionState::Evicted {
            if let Err(e) = self.rent.wait_blocking() {
                error!(part = self.id, error = %e, "unable to await partition destroy");
            }
        }
    }

    // -----------------------------------------------------------------------
    // Entries
    // -----------------------------------------------------------------------

    /// Writes an entry. Returns `Ok(false)` if the partition no longer accepts writes.
    ///
    /// # Errors
    ///
    /// Propagates data store failures.
    pub fn update(
        &self,
        cache_id: i32,
        key: &str,
        value: Vec<u8>,
        version: CacheVersion,
    ) -> Result<bool, PartitionError> {
        if !self.reserve() {
            return Ok(false);
        }
        if !self.state().active() {
            self.release();
            return Ok(false);
        }

        let row = DataRow {
            cache_id,
            key: key.to_string(),
            value: value.clone(),
            version,
        };
        let store = self.data_store();
        if let Err(e) = store.put(row) {
            self.release();
            return Err(e.into());
        }
        store.next_update_counter();

        let map = self.entries.get_or_create(cache_id);
        let prev = map.entries.insert(
            key.to_string(),
            CacheEntry {
                key: key.to_string(),
                value,
                version,
                deleted: false,
            },
        );
        let delta = match prev {
            Some(e) if !e.deleted => 0,
            _ => 1,
        };
        map.size.fetch_add(i64::from(delta), Ordering::AcqRel);

        self.release0(delta);
        Ok(true)
    }

    /// Removes an entry, leaving a tombstone and a deferred delete.
    ///
    /// # Errors
    ///
    /// Propagates data store failures.
    pub fn remove(&self, cache_id: i32, key: &str, version: CacheVersion) -> Result<bool, PartitionError> {
        if !self.reserve() {
            return Ok(false);
        }

        let Some(map) = self.entries.get(cache_id) else {
            self.release();
            return Ok(false);
        };

        let tombstoned = match map.entries.get_mut(key) {
            Some(mut e) if !e.deleted => {
                e.deleted = true;
                e.version = version;
                e.value.clear();
                true
            }
            _ => false,
        };
        if !tombstoned {
            self.release();
            return Ok(false);
        }

        if let Err(e) = self.data_store().remove(cache_id, key) {
            self.release();
            return Err(e.into());
        }
        self.data_store().next_update_counter();
        map.size.fetch_sub(1, Ordering::AcqRel);

        self.on_deferred_delete(cache_id, key, version);
        self.release0(-1);
        Ok(true)
    }

    /// Live (non-tombstone) entry for `key`.
    #[must_use]
    pub fn get(&self, cache_id: i32, key: &str) -> Option<CacheEntry> {
        self.entries
            .get(cache_id)?
            .entries
            .get(key)
            .filter(|e| !e.deleted)
            .map(|e| e.value().clone())
    }

    /// `true` while a tombstone for `key` is still held.
    #[must_use]
    pub fn has_tombstone(&self, cache_id: i32, key: &str) -> bool {
        self.entries
            .get(cache_id)
            .and_then(|m| m.entries.get(key).map(|e| e.deleted))
            .unwrap_or(false)
    }

    /// Drops a tombstone if it still carries `version`.
    pub fn remove_versioned_entry(&self, cache_id: i32, key: &str, version: CacheVersion) {
        if let Some(map) = self.entries.get(cache_id) {
            map.entries
                .remove_if(key, |_, e| e.deleted && e.version == version);
        }
    }

    /// Records a removal in the deferred-delete queue.
    ///
    /// Tombstones pushed out of the queue are dropped after the queue lock
    /// is released.
    pub fn on_deferred_delete(&self, cache_id: i32, key: &str, version: CacheVersion) {
        let keep_expired = self.group.dr_enabled();
        let dropped = self
            .remove_queue
            .push(cache_id, key.to_string(), version, Instant::now(), keep_expired);
        for e in dropped {
            self.remove_versioned_entry(e.cache_id, &e.key, e.version);
        }
    }

    fn clear_deferred_deletes(&self) {
        for e in self.remove_queue.drain() {
            self.remove_versioned_entry(e.cache_id, &e.key, e.version);
        }
    }

    /// Queued deferred deletes.
    #[must_use]
    pub fn deferred_deletes(&self) -> usize {
        self.remove_queue.len()
    }

    /// Capacity of the deferred-delete queue.
    #[must_use]
    pub fn deferred_delete_capacity(&self) -> usize {
        self.remove_queue.max_size()
    }

    /// Drops a stopped cache's entries from a shared group partition.
    pub fn on_cache_stopped(&self, cache_id: i32) {
        let EntryMaps::Shared(maps) = &self.entries else {
            return;
        };

        self.remove_queue.drain_cache(cache_id);

        if let Some((_, map)) = maps.remove(&cache_id) {
            let live = i32::try_from(map.size.load(Ordering::Acquire)).unwrap_or(i32::MAX);
            if live != 0 {
                self.add_size(-live);
            }
        }

        if let Err(e) = self.data_store().clear_cache(cache_id) {
            error!(part = self.id, cache_id, error = %e, "failed to clear stopped cache rows");
        }
    }

    /// Entry maps currently tracked (one per cache for shared groups).
    #[must_use]
    pub fn cache_map_count(&self) -> usize {
        match &self.entries {
            EntryMaps::Single(_) => 1,
            EntryMaps::Shared(maps) => maps.len(),
        }
    }

    #[cfg(test)]
    fn raw_entries(&self) -> usize {
        self.entries.internal_size()
    }
}

impl fmt::Display for LocalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cur = self.load();
        write!(
            f,
            "LocalPartition[grp={}, id={}, state={}, reservations={}, size={}]",
            self.group.name(),
            self.id,
            cur.state(),
            cur.reservations(),
            cur.size()
        )
    }
}

impl fmt::Debug for LocalPartition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}
