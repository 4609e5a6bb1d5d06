//! Per-cache gate in front of every user operation.
//!
//! Operations hold a shared permit for their whole duration; stopping the
//! cache takes the exclusive permit, so it waits for in-flight operations to
//! leave instead of interrupting them. A disconnected client fails fast with
//! the pending reconnect future.

use std::fmt;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::Arc;
use std::time::Duration;

use parking_lot::{Mutex, RwLock, RwLockReadGuard, RwLockWriteGuard};
use tracing::{debug, warn};

use crate::error::GatewayError;
use crate::future::ReconnectFuture;

/// Evictions a guard may batch before it flushes early.
pub const MAX_DEFERRED_EVICTIONS: usize = 64;

/// Default interval between exclusive-permit attempts in [`CacheGateway::on_stopped`].
pub const DEFAULT_STOP_POLL: Duration = Duration::from_millis(200);

/// Lifecycle state of a gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum GatewayState {
    Started = 0,
    Disconnected = 1,
    Stopped = 2,
}

impl GatewayState {
    fn from_u8(v: u8) -> Self {
        match v {
            0 => GatewayState::Started,
            1 => GatewayState::Disconnected,
            _ => GatewayState::Stopped,
        }
    }
}

/// An entry evicted during an operation, reported when the operation leaves the gateway.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvictionNotice {
    pub cache: String,
    pub key: String,
}

/// Receives batched eviction notices.
pub trait EvictionSink: Send + Sync {
    fn flush(&self, batch: Vec<EvictionNotice>);
}

/// Sink that only logs.
#[derive(Debug, Default)]
pub struct LoggingEvictionSink;

impl EvictionSink for LoggingEvictionSink {
    fn flush(&self, batch: Vec<EvictionNotice>) {
        debug!(count = batch.len(), "flushed deferred evictions");
    }
}

/// Gate serializing cache operations against cache lifecycle changes.
pub struct CacheGateway {
    cache: String,
    lock: RwLock<()>,
    state: AtomicU8,
    reconnect: Mutex<Option<ReconnectFuture>>,
    sink: Arc<dyn EvictionSink>,
    stop_poll: Duration,
}

impl CacheGateway {
    #[must_use]
    pub fn new(cache: impl Into<String>, sink: Arc<dyn EvictionSink>) -> Self {
        Self::with_stop_poll(cache, sink, DEFAULT_STOP_POLL)
    }

    #[must_use]
    pub fn with_stop_poll(cache: impl Into<String>, sink: Arc<dyn EvictionSink>, stop_poll: Duration) -> Self {
        Self {
            cache: cache.into(),
            lock: RwLock::new(()),
            state: AtomicU8::new(GatewayState::Started as u8),
            reconnect: Mutex::new(None),
            sink,
            stop_poll,
        }
    }

    #[must_use]
    pub fn cache_name(&self) -> &str {
        &self.cache
    }

    #[must_use]
    pub fn state(&self) -> GatewayState {
        GatewayState::from_u8(self.state.load(Ordering::Acquire))
    }

    #[must_use]
    pub fn is_stopped(&self) -> bool {
        self.state() == GatewayState::Stopped
    }

    /// Enters the gateway before a cache operation.
    ///
    /// Blocks while the cache is being stopped.
    ///
    /// # Errors
    ///
    /// [`GatewayError::Stopped`] once the cache is stopped,
    /// [`GatewayError::Disconnected`] while the client node is disconnected.
    pub fn enter(&self) -> Result<GatewayGuard<'_>, GatewayError> {
        let permit = self.lock.read();
        match self.state() {
            GatewayState::Started => Ok(GatewayGuard::new(self, Some(permit))),
            GatewayState::Stopped => Err(GatewayError::Stopped {
                cache: self.cache.clone(),
            }),
            GatewayState::Disconnected => Err(self.disconnected_error()),
        }
    }

    /// Enters unless the cache is stopped or disconnected.
    ///
    /// A disconnected gateway yields `None` rather than
    /// [`GatewayError::Disconnected`]; callers that need the reconnect
    /// future go through [`enter`](Self::enter).
    #[must_use]
    pub fn enter_if_not_stopped(&self) -> Option<GatewayGuard<'_>> {
        let permit = self.lock.read();
        (self.state() == GatewayState::Started).then(|| GatewayGuard::new(self, Some(permit)))
    }

    /// Like [`enter_if_not_stopped`](Self::enter_if_not_stopped) but takes no
    /// permit, so it never blocks and does not delay a stop.
    #[must_use]
    pub fn enter_if_not_stopped_no_lock(&self) -> Option<GatewayGuard<'_>> {
        (self.state() == GatewayState::Started).then(|| GatewayGuard::new(self, None))
    }

    /// Exclusive permit; dropping the guard releases it.
    pub fn write_lock(&self) -> RwLockWriteGuard<'_, ()> {
        self.lock.write()
    }

    /// Waits for every in-flight operation to leave, then marks the gateway STOPPED.
    pub fn on_stopped(&self) {
        loop {
            if let Some(_exclusive) = self.lock.try_write_for(self.stop_poll) {
                self.state.store(GatewayState::Stopped as u8, Ordering::Release);
                debug!(cache = %self.cache, "cache gateway stopped");
                return;
            }
            debug!(cache = %self.cache, "waiting for in-flight operations before stopping cache");
        }
    }

    /// Marks the gateway STOPPED without waiting for in-flight operations.
    pub fn stopped(&self) {
        self.state.store(GatewayState::Stopped as u8, Ordering::Release);
    }

    /// STARTED -> DISCONNECTED. Later `enter` calls fail with `reconnect`.
    pub fn on_disconnected(&self, reconnect: ReconnectFuture) {
        *self.reconnect.lock() = Some(reconnect);
        if self
            .state
            .compare_exchange(
                GatewayState::Started as u8,
                GatewayState::Disconnected as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_err()
        {
            debug!(cache = %self.cache, state = ?self.state(), "gateway not started, ignoring disconnect");
        }
    }

    /// DISCONNECTED -> STARTED, or STOPPED if the cache did not survive the reconnect.
    pub fn reconnected(&self, stopped: bool) {
        let to = if stopped {
            GatewayState::Stopped
        } else {
            GatewayState::Started
        };
        if self
            .state
            .compare_exchange(
                GatewayState::Disconnected as u8,
                to as u8,
                Ordering::AcqRel,
                Ordering::Acquire,
            )
            .is_ok()
        {
            self.reconnect.lock().take();
        }
    }

    fn disconnected_error(&self) -> GatewayError {
        match self.reconnect.lock().clone() {
            Some(reconnect) => GatewayError::Disconnected {
                cache: self.cache.clone(),
                reconnect,
            },
            None => {
                warn!(cache = %self.cache, "disconnected gateway has no reconnect future");
                GatewayError::Stopped {
                    cache: self.cache.clone(),
                }
            }
        }
    }
}

impl fmt::Debug for CacheGateway {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheGateway")
            .field("cache", &self.cache)
            .field("state", &self.state())
            .finish_non_exhaustive()
    }
}

// ---------------------------------------------------------------------------
// GatewayGuard
// ---------------------------------------------------------------------------

/// Proof of having entered a gateway. Leaving happens on drop, even on early
/// return or panic.
#[must_use = "dropping the guard leaves the gateway immediately"]
pub struct GatewayGuard<'a> {
    gateway: &'a CacheGateway,
    evictions: Vec<EvictionNotice>,
    // Declared last: released after deferred evictions are flushed.
    _permit: Option<RwLockReadGuard<'a, ()>>,
}

impl<'a> GatewayGuard<'a> {
    fn new(gateway: &'a CacheGateway, permit: Option<RwLockReadGuard<'a, ()>>) -> Self {
        Self {
            gateway,
            evictions: Vec::new(),
            _permit: permit,
        }
    }

    /// Defers an eviction notice until the guard leaves.
    pub fn defer_eviction(&mut self, key: impl Into<String>) {
        self.evictions.push(EvictionNotice {
            cache: self.gateway.cache.clone(),
            key: key.into(),
        });
        if self.evictions.len() >= MAX_DEFERRED_EVICTIONS {
            self.flush();
        }
    }

    #[must_use]
    pub fn deferred(&self) -> usize {
        self.evictions.len()
    }

    fn flush(&mut self) {
        if self.evictions.is_empty() {
            return;
        }
        let batch = std::mem::take(&mut self.evictions);
        if self.gateway.is_stopped() {
            debug!(cache = %self.gateway.cache, dropped = batch.len(), "cache stopped, dropping deferred evictions");
            return;
        }
        self.gateway.sink.flush(batch);
    }

    /// Leaves the gateway.
    pub fn leave(self) {}
}

impl Drop for GatewayGuard<'_> {
    fn drop(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::AtomicUsize;
    use std::sync::Barrier;
    use std::thread;
    use std::time::Instant;

    use super::*;
    use crate::future::GridFuture;

    #[derive(Default)]
    struct CountingSink {
        batches: Mutex<Vec<usize>>,
    }

    impl EvictionSink for CountingSink {
        fn flush(&self, batch: Vec<EvictionNotice>) {
            self.batches.lock().push(batch.len());
        }
    }

    fn gateway() -> (Arc<CacheGateway>, Arc<CountingSink>) {
        let sink = Arc::new(CountingSink::default());
        let gw = Arc::new(CacheGateway::with_stop_poll(
            "cache",
            Arc::clone(&sink) as Arc<dyn EvictionSink>,
            Duration::from_millis(5),
        ));
        (gw, sink)
    }

    // -- enter / leave --

    #[test]
    fn enter_succeeds_while_started() {
        let (gw, _) = gateway();
        let guard = gw.enter().unwrap();
        guard.leave();
        assert!(gw.enter_if_not_stopped().is_some());
        assert!(gw.enter_if_not_stopped_no_lock().is_some());
    }

    #[test]
    fn stopped_gateway_rejects_entry() {
        let (gw, _) = gateway();
        gw.on_stopped();
        assert!(matches!(gw.enter(), Err(GatewayError::Stopped { .. })));
        assert!(gw.enter_if_not_stopped().is_none());
        assert!(gw.enter_if_not_stopped_no_lock().is_none());
    }

    #[test]
    fn disconnected_gateway_hands_out_reconnect_future() {
        let (gw, _) = gateway();
        let inner = GridFuture::new();
        gw.on_disconnected(ReconnectFuture::new(inner.clone()));

        let Err(GatewayError::Disconnected { reconnect, .. }) = gw.enter() else {
            panic!("expected disconnected error");
        };
        assert!(!reconnect.is_done());
        inner.on_done(Ok(()));
        assert!(reconnect.is_done());

        gw.reconnected(false);
        assert_eq!(gw.state(), GatewayState::Started);
        assert!(gw.enter().is_ok());
    }

    #[test]
    fn optional_enter_while_disconnected_yields_nothing() {
        let (gw, _) = gateway();
        gw.on_disconnected(ReconnectFuture::new(GridFuture::new()));

        assert!(gw.enter_if_not_stopped().is_none());
        assert!(gw.enter_if_not_stopped_no_lock().is_none());
        assert!(matches!(gw.enter(), Err(GatewayError::Disconnected { .. })));

        gw.reconnected(false);
        assert!(gw.enter_if_not_stopped().is_some());
    }

    #[test]
    fn reconnect_into_stopped() {
        let (gw, _) = gateway();
        gw.on_disconnected(ReconnectFuture::new(GridFuture::new()));
        gw.reconnected(true);
        assert!(gw.is_stopped());
        // A second disconnect cannot resurrect a stopped gateway.
        gw.on_disconnected(ReconnectFuture::new(GridFuture::new()));
        assert!(gw.is_stopped());
    }

    // -- exclusivity --

    #[test]
    fn on_stopped_waits_for_all_in_flight_operations() {
        const THREADS: usize = 8;
        let (gw, _) = gateway();
        let entered = Arc::new(Barrier::new(THREADS + 1));
        let left = Arc::new(AtomicUsize::new(0));

        let workers: Vec<_> = (0..THREADS)
            .map(|_| {
                let gw = Arc::clone(&gw);
                let entered = Arc::clone(&entered);
                let left = Arc::clone(&left);
                thread::spawn(move || {
                    let guard = gw.enter().unwrap();
                    entered.wait();
                    thread::sleep(Duration::from_millis(50));
                    left.fetch_add(1, Ordering::SeqCst);
                    guard.leave();
                })
            })
            .collect();

        entered.wait();
        let start = Instant::now();
        gw.on_stopped();
        assert_eq!(left.load(Ordering::SeqCst), THREADS);
        assert!(start.elapsed() >= Duration::from_millis(20));

        for w in workers {
            w.join().unwrap();
        }
        assert!(matches!(gw.enter(), Err(GatewayError::Stopped { .. })));
    }

    #[test]
    fn stopped_does_not_wait_for_holders() {
        let (gw, _) = gateway();
        let guard = gw.enter().unwrap();
        gw.stopped();
        assert!(gw.is_stopped());
        drop(guard);
    }

    // -- deferred evictions --

    #[test]
    fn evictions_flush_on_leave_and_when_batch_is_full() {
        let (gw, sink) = gateway();
        {
            let mut guard = gw.enter().unwrap();
            for i in 0..(MAX_DEFERRED_EVICTIONS + 3) {
                guard.defer_eviction(format!("k{i}"));
            }
            assert_eq!(guard.deferred(), 3);
        }
        assert_eq!(*sink.batches.lock(), vec![MAX_DEFERRED_EVICTIONS, 3]);
    }

    #[test]
    fn evictions_are_dropped_once_stopped() {
        let (gw, sink) = gateway();
        let mut guard = gw.enter().unwrap();
        guard.defer_eviction("a");
        gw.stopped();
        guard.leave();
        assert!(sink.batches.lock().is_empty());
    }
}
