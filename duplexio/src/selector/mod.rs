//! Readiness registry.
//!
//! A [`Selector`] lets one thread wait for readiness on many channels at
//! once while other threads register channels, change interest sets,
//! cancel keys, or wake the waiting thread.
//!
//! Locking discipline:
//! - `select` calls are serialized by the select lock; only one thread
//!   waits in the poller at a time, others queue on the lock;
//! - the key table has its own lock, so `register` and `cancel` never
//!   wait for a blocked `select`. The poller backends accept control
//!   operations during a wait, which makes an extra wake-up on
//!   registration unnecessary;
//! - the wake-up request is a single atomic flag.
//!
//! # Wake-up semantics
//!
//! [`Selector::wakeup`] sets the pending flag and, on the transition
//! from unset to set, writes to the poller's wake descriptor. Every
//! select call consumes the flag at most once: before waiting (then it
//! does not block at all) or after the poller returns. A wake-up issued
//! while no select is running therefore makes exactly the next select
//! return immediately, and one issued during a select returns that
//! select. Wake descriptor data left behind by an already consumed
//! request is drained and ignored without returning to the caller.

mod interest;
mod key;

pub use interest::Interest;
pub use key::{KeySet, SelectionKey};

use key::KeyInner;

use crate::error::{Error, Result};
use crate::sys::{Event, Poller};

use std::collections::HashMap;
use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::{Duration, Instant};

use tracing::{debug, trace};

/// A channel that can be registered with a [`Selector`].
pub trait Selectable {
    /// Descriptor to register, or `None` once the channel is closed.
    fn selectable_fd(&self) -> Option<RawFd>;

    /// Only non-blocking channels may be registered.
    fn is_blocking(&self) -> bool;

    /// Keys held by this channel; cancelled when the channel closes.
    fn key_set(&self) -> &KeySet;
}

/// Builder for configuring a [`Selector`].
///
/// # Examples
///
/// ```rust,ignore
/// let selector = SelectorBuilder::new()
///     .event_capacity(256)
///     .build()?;
/// ```
pub struct SelectorBuilder {
    /// Maximum number of readiness events collected by one wait.
    event_capacity: usize,
}

impl SelectorBuilder {
    /// Creates a builder with the default event capacity of 64.
    pub fn new() -> Self {
        Self { event_capacity: 64 }
    }

    /// Sets the number of events collected per wait.
    ///
    /// # Panics
    ///
    /// Panics if `n == 0`.
    pub fn event_capacity(mut self, n: usize) -> Self {
        assert!(n > 0, "event_capacity must be > 0");

        self.event_capacity = n;
        self
    }

    /// Opens the selector.
    pub fn build(self) -> Result<Selector> {
        let poller = Poller::new(self.event_capacity)?;

        debug!(event_capacity = self.event_capacity, "selector opened");

        Ok(Selector {
            inner: Arc::new(Inner {
                poller,
                keys: Mutex::new(HashMap::new()),
                next_token: AtomicU64::new(0),
                selected: Mutex::new(Vec::new()),
                select_lock: Mutex::new(Vec::with_capacity(self.event_capacity)),
                wakeup_pending: AtomicBool::new(false),
                open: AtomicBool::new(true),
            }),
        })
    }
}

impl Default for SelectorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

pub(crate) struct Inner {
    pub(crate) poller: Poller,
    keys: Mutex<HashMap<u64, Arc<KeyInner>>>,
    next_token: AtomicU64,
    selected: Mutex<Vec<SelectionKey>>,
    select_lock: Mutex<Vec<Event>>,
    wakeup_pending: AtomicBool,
    open: AtomicBool,
}

impl Inner {
    fn keys(&self) -> MutexGuard<'_, HashMap<u64, Arc<KeyInner>>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Drops a cancelled key from the table and the poller.
    ///
    /// The descriptor may already be gone from the poller (selector
    /// closed, or the kernel dropped it); that is not an error.
    pub(crate) fn forget(&self, token: u64, fd: RawFd) {
        self.keys().remove(&token);

        if let Err(err) = self.poller.deregister(fd) {
            trace!(token, fd, %err, "deregister skipped");
        }
    }
}

/// A thread-safe readiness registry.
///
/// Cloning a `Selector` produces another handle to the same registry.
#[derive(Clone)]
pub struct Selector {
    inner: Arc<Inner>,
}

impl Selector {
    /// Opens a selector with default settings.
    pub fn open() -> Result<Self> {
        SelectorBuilder::new().build()
    }

    /// Registers `channel` for the operations in `interest`.
    ///
    /// Registering a channel that already holds a valid key with this
    /// selector updates and returns that key.
    ///
    /// # Errors
    ///
    /// - [`Error::ClosedSelector`] if the selector is closed,
    /// - [`Error::IllegalBlockingMode`] if the channel is in blocking mode,
    /// - [`Error::Closed`] if the channel is closed.
    pub fn register<S>(&self, channel: &S, interest: Interest) -> Result<SelectionKey>
    where
        S: Selectable + ?Sized,
    {
        if !self.is_open() {
            return Err(Error::ClosedSelector);
        }

        if channel.is_blocking() {
            return Err(Error::IllegalBlockingMode);
        }

        let mut keys = channel.key_set().lock();
        let fd = channel.selectable_fd().ok_or(Error::Closed)?;

        if let Some(key) = keys
            .iter()
            .find(|k| k.is_valid() && k.belongs_to(&self.inner))
        {
            key.set_interest(interest)?;
            return Ok(key.clone());
        }

        keys.retain(SelectionKey::is_valid);

        let token = self.inner.next_token.fetch_add(1, Ordering::Relaxed);
        let key = SelectionKey {
            inner: Arc::new(KeyInner {
                token,
                fd,
                interest: AtomicU8::new(interest.bits()),
                ready: AtomicU8::new(0),
                valid: AtomicBool::new(true),
                selector: Arc::downgrade(&self.inner),
            }),
        };

        self.inner.keys().insert(token, key.inner.clone());

        if let Err(err) = self.inner.poller.register(fd, token, interest.filter()) {
            self.inner.keys().remove(&token);
            return Err(err.into());
        }

        // `close` may have swept the table between the check above and
        // the insert.
        if !self.is_open() {
            key.cancel();
            return Err(Error::ClosedSelector);
        }

        keys.push(key.clone());

        debug!(token, fd, ?interest, "channel registered");
        Ok(key)
    }

    /// Selects without blocking.
    ///
    /// A pending [`wakeup`](Self::wakeup) is consumed.
    pub fn select_now(&self) -> Result<usize> {
        self.select_timeout(Some(Duration::ZERO))
    }

    /// Blocks until at least one key is ready, the selector is woken, or
    /// the timeout expires. `None` waits indefinitely.
    ///
    /// Returns the number of ready keys, which may be zero.
    pub fn select(&self, timeout: Option<Duration>) -> Result<usize> {
        self.select_timeout(timeout)
    }

    fn select_timeout(&self, timeout: Option<Duration>) -> Result<usize> {
        if !self.is_open() {
            return Err(Error::ClosedSelector);
        }

        let mut events = self.inner.select_lock.lock().unwrap_or_else(PoisonError::into_inner);
        let deadline = timeout.map(|t| Instant::now() + t);

        loop {
            if self.inner.wakeup_pending.swap(false, Ordering::AcqRel) {
                self.inner.poller.poll(&mut events, Some(Duration::ZERO))?;
                let ready = self.collect(&events);

                trace!(ready, "select returned on pending wakeup");
                return Ok(ready);
            }

            let remaining = deadline.map(|d| d.saturating_duration_since(Instant::now()));
            let woken = self.inner.poller.poll(&mut events, remaining)?;
            let ready = self.collect(&events);
            let consumed = self.inner.wakeup_pending.swap(false, Ordering::AcqRel);

            if ready > 0 || consumed || !self.is_open() {
                trace!(ready, consumed, "select returned");
                return Ok(ready);
            }

            if deadline.is_some_and(|d| Instant::now() >= d) {
                return Ok(0);
            }

            if woken {
                trace!("stale wake-up drained");
            }
        }
    }

    /// Maps raw events onto valid keys and publishes the selected set.
    fn collect(&self, events: &[Event]) -> usize {
        let mut selected = Vec::new();

        {
            let keys = self.inner.keys();

            for event in events {
                let Some(key) = keys.get(&event.token) else {
                    continue;
                };

                if !key.valid.load(Ordering::Acquire) {
                    continue;
                }

                let interest = Interest::from_bits(key.interest.load(Ordering::Acquire));
                let mut ready = Interest::NONE;

                if event.readable {
                    ready |= interest & (Interest::READABLE | Interest::ACCEPTABLE);
                }
                if event.writable {
                    ready |= interest & Interest::WRITABLE;
                }

                if ready.is_empty() {
                    continue;
                }

                key.ready.store(ready.bits(), Ordering::Release);
                selected.push(SelectionKey { inner: key.clone() });
            }
        }

        let count = selected.len();
        *self.inner.selected.lock().unwrap_or_else(PoisonError::into_inner) = selected;

        count
    }

    /// Keys reported ready by the most recent select.
    pub fn selected_keys(&self) -> Vec<SelectionKey> {
        self.inner
            .selected
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|k| k.is_valid())
            .cloned()
            .collect()
    }

    /// Number of valid keys registered with this selector.
    pub fn keys_len(&self) -> usize {
        self.inner.keys().len()
    }

    /// Wakes the thread blocked in `select`, or makes the next select
    /// return immediately if none is blocked.
    pub fn wakeup(&self) {
        if !self.inner.wakeup_pending.swap(true, Ordering::AcqRel) {
            self.inner.poller.waker().wake();
            trace!("selector wakeup requested");
        }
    }

    pub fn is_open(&self) -> bool {
        self.inner.open.load(Ordering::Acquire)
    }

    /// Closes the selector.
    ///
    /// Every key is invalidated and a blocked select returns. Further
    /// selects and registrations fail with [`Error::ClosedSelector`].
    pub fn close(&self) {
        if !self.inner.open.swap(false, Ordering::AcqRel) {
            return;
        }

        let keys: Vec<_> = self.inner.keys().drain().map(|(_, key)| key).collect();

        for key in &keys {
            key.valid.store(false, Ordering::Release);
            let _ = self.inner.poller.deregister(key.fd);
        }

        self.wakeup();

        debug!(cancelled = keys.len(), "selector closed");
    }
}

impl fmt::Debug for Selector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Selector")
            .field("open", &self.is_open())
            .field("keys", &self.keys_len())
            .finish()
    }
}
