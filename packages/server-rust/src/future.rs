//! Completion cells shared between exchange, partition and gateway code.
//!
//! [`GridFuture`] is a clonable, re-armable completion cell. It can be awaited
//! from async code, waited on from a plain OS thread (with or without a
//! timeout), or observed through one-shot listeners that run on the thread
//! that completes it.

use std::fmt;
use std::pin::pin;
use std::sync::Arc;
use std::time::{Duration, Instant};

use parking_lot::{Condvar, Mutex};
use tokio::sync::Notify;

use crate::error::ExchangeError;

type Listener<T, E> = Box<dyn FnOnce(&Result<T, E>) + Send>;

struct Slot<T, E> {
    result: Option<Result<T, E>>,
    listeners: Vec<Listener<T, E>>,
}

struct Shared<T, E> {
    slot: Mutex<Slot<T, E>>,
    cond: Condvar,
    notify: Notify,
}

/// Clonable completion cell; every clone observes the same result.
///
/// Completion happens at most once per arming: the first [`on_done`](Self::on_done)
/// wins and releases every waiter. [`reset`](Self::reset) re-arms a completed
/// future so it can be reused for the next round of work.
pub struct GridFuture<T, E> {
    shared: Arc<Shared<T, E>>,
}

impl<T, E> Clone for GridFuture<T, E> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<T, E> GridFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    /// Creates a pending future.
    #[must_use]
    pub fn new() -> Self {
        Self {
            shared: Arc::new(Shared {
                slot: Mutex::new(Slot {
                    result: None,
                    listeners: Vec::new(),
                }),
                cond: Condvar::new(),
                notify: Notify::new(),
            }),
        }
    }

    /// Creates a future that is already complete with `result`.
    #[must_use]
    pub fn completed(result: Result<T, E>) -> Self {
        let fut = Self::new();
        fut.shared.slot.lock().result = Some(result);
        fut
    }

    /// Completes the future.
    ///
    /// Returns `false` if it was already complete, in which case `result` is
    /// dropped and no listener runs. Listeners run on the calling thread after
    /// the internal lock is released.
    pub fn on_done(&self, result: Result<T, E>) -> bool {
        let listeners = {
            let mut slot = self.shared.slot.lock();
            if slot.result.is_some() {
                return false;
            }
            slot.result = Some(result.clone());
            std::mem::take(&mut slot.listeners)
        };

        self.shared.cond.notify_all();
        self.shared.notify.notify_waiters();

        for listener in listeners {
            listener(&result);
        }
        true
    }

    /// Registers a one-shot listener. Runs immediately if already complete.
    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(&Result<T, E>) + Send + 'static,
    {
        let mut slot = self.shared.slot.lock();
        match slot.result.clone() {
            Some(result) => {
                drop(slot);
                f(&result);
            }
            None => slot.listeners.push(Box::new(f)),
        }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.shared.slot.lock().result.is_some()
    }

    /// `true` when complete with an error.
    #[must_use]
    pub fn is_failed(&self) -> bool {
        matches!(self.shared.slot.lock().result, Some(Err(_)))
    }

    /// The result, if complete.
    #[must_use]
    pub fn result(&self) -> Option<Result<T, E>> {
        self.shared.slot.lock().result.clone()
    }

    /// Re-arms a completed future.
    ///
    /// Returns `true` if the future was complete and is now pending again.
    /// A pending future is left untouched.
    pub fn reset(&self) -> bool {
        let mut slot = self.shared.slot.lock();
        if slot.result.is_none() {
            return false;
        }
        slot.result = None;
        slot.listeners.clear();
        true
    }

    /// Waits for completion from async code.
    pub async fn wait(&self) -> Result<T, E> {
        loop {
            let mut notified = pin!(self.shared.notify.notified());
            notified.as_mut().enable();
            if let Some(result) = self.result() {
                return result;
            }
            notified.await;
        }
    }

    /// Blocks the current OS thread until completion.
    pub fn wait_blocking(&self) -> Result<T, E> {
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.result.clone() {
                return result;
            }
            self.shared.cond.wait(&mut slot);
        }
    }

    /// Blocks the current OS thread for at most `timeout`.
    ///
    /// Returns `None` if the future is still pending when the timeout expires.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>> {
        let deadline = Instant::now() + timeout;
        let mut slot = self.shared.slot.lock();
        loop {
            if let Some(result) = slot.result.clone() {
                return Some(result);
            }
            if self.shared.cond.wait_until(&mut slot, deadline).timed_out() {
                return slot.result.clone();
            }
        }
    }
}

impl<T, E> Default for GridFuture<T, E>
where
    T: Clone + Send + 'static,
    E: Clone + Send + 'static,
{
    fn default() -> Self {
        Self::new()
    }
}

impl<T, E> fmt::Debug for GridFuture<T, E> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let slot = self.shared.slot.lock();
        f.debug_struct("GridFuture")
            .field("done", &slot.result.is_some())
            .field("listeners", &slot.listeners.len())
            .finish()
    }
}

// ---------------------------------------------------------------------------
// ReconnectFuture
// ---------------------------------------------------------------------------

/// Handle to a pending client reconnect, handed to callers that hit a
/// disconnected cache gateway.
///
/// Wraps the node's reconnect future and forwards every call to it, so a
/// caller can await reconnection without being able to complete or reset it.
#[derive(Clone)]
pub struct ReconnectFuture {
    inner: GridFuture<(), ExchangeError>,
}

impl ReconnectFuture {
    #[must_use]
    pub fn new(inner: GridFuture<(), ExchangeError>) -> Self {
        Self { inner }
    }

    #[must_use]
    pub fn is_done(&self) -> bool {
        self.inner.is_done()
    }

    #[must_use]
    pub fn result(&self) -> Option<Result<(), ExchangeError>> {
        self.inner.result()
    }

    pub fn listen<F>(&self, f: F)
    where
        F: FnOnce(&Result<(), ExchangeError>) + Send + 'static,
    {
        self.inner.listen(f);
    }

    pub async fn wait(&self) -> Result<(), ExchangeError> {
        self.inner.wait().await
    }

    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<(), ExchangeError>> {
        self.inner.wait_timeout(timeout)
    }
}

impl fmt::Debug for ReconnectFuture {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ReconnectFuture")
            .field("done", &self.inner.is_done())
            .finish()
    }
}
