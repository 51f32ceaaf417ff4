use super::Inner;
use super::interest::Interest;
use crate::error::{Error, Result};

use std::fmt;
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicU8, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};

use tracing::trace;

pub(super) struct KeyInner {
    pub(super) token: u64,
    pub(super) fd: RawFd,
    pub(super) interest: AtomicU8,
    pub(super) ready: AtomicU8,
    pub(super) valid: AtomicBool,
    pub(super) selector: Weak<Inner>,
}

/// The registration of one channel with one [`Selector`](super::Selector).
///
/// A key stays valid until it is cancelled, its channel is closed, or
/// its selector is closed. Cancelling is idempotent and never fails.
#[derive(Clone)]
pub struct SelectionKey {
    pub(super) inner: Arc<KeyInner>,
}

impl SelectionKey {
    /// Token identifying this key inside its selector.
    pub fn token(&self) -> u64 {
        self.inner.token
    }

    /// Current interest set.
    pub fn interest(&self) -> Interest {
        Interest::from_bits(self.inner.interest.load(Ordering::Acquire))
    }

    /// Replaces the interest set.
    ///
    /// Safe to call while another thread is blocked in `select`; the
    /// change applies to that wait.
    pub fn set_interest(&self, interest: Interest) -> Result<()> {
        if !self.is_valid() {
            return Err(Error::Closed);
        }

        let selector = self.inner.selector.upgrade().ok_or(Error::ClosedSelector)?;

        self.inner.interest.store(interest.bits(), Ordering::Release);
        selector
            .poller
            .reregister(self.inner.fd, self.inner.token, interest.filter())?;

        trace!(token = self.inner.token, ?interest, "interest updated");
        Ok(())
    }

    /// Operations found ready by the most recent select that reported
    /// this key.
    pub fn ready(&self) -> Interest {
        Interest::from_bits(self.inner.ready.load(Ordering::Acquire))
    }

    pub fn is_readable(&self) -> bool {
        self.ready().is_readable()
    }

    pub fn is_writable(&self) -> bool {
        self.ready().is_writable()
    }

    pub fn is_acceptable(&self) -> bool {
        self.ready().is_acceptable()
    }

    /// `true` until the key is cancelled or its selector goes away.
    pub fn is_valid(&self) -> bool {
        self.inner.valid.load(Ordering::Acquire) && self.inner.selector.strong_count() > 0
    }

    /// Cancels the key.
    ///
    /// The descriptor is removed from the poller immediately and the key
    /// is never reported again. Calling this more than once is a no-op.
    pub fn cancel(&self) {
        if !self.inner.valid.swap(false, Ordering::AcqRel) {
            return;
        }

        if let Some(selector) = self.inner.selector.upgrade() {
            selector.forget(self.inner.token, self.inner.fd);
        }

        trace!(token = self.inner.token, "key cancelled");
    }

    pub(crate) fn belongs_to(&self, selector: &Arc<Inner>) -> bool {
        Weak::ptr_eq(&self.inner.selector, &Arc::downgrade(selector))
    }
}

impl PartialEq for SelectionKey {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.inner, &other.inner)
    }
}

impl Eq for SelectionKey {}

impl fmt::Debug for SelectionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SelectionKey")
            .field("token", &self.inner.token)
            .field("interest", &self.interest())
            .field("ready", &self.ready())
            .field("valid", &self.is_valid())
            .finish()
    }
}

/// The selection keys held by one channel.
///
/// Registration and channel close both go through this lock, so a key
/// can never be created for a channel that is concurrently closing.
#[derive(Default)]
pub struct KeySet {
    keys: Mutex<Vec<SelectionKey>>,
}

impl KeySet {
    pub(crate) fn new() -> Self {
        Self::default()
    }

    pub(crate) fn lock(&self) -> MutexGuard<'_, Vec<SelectionKey>> {
        self.keys.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Cancels every key. Must run before the descriptor is closed.
    pub(crate) fn cancel_all(&self) {
        let keys = std::mem::take(&mut *self.lock());

        for key in keys {
            key.cancel();
        }
    }
}

impl fmt::Debug for KeySet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_list().entries(self.lock().iter()).finish()
    }
}
