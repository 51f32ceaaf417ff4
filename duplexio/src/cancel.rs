//! Cooperative cancellation of blocking calls.
//!
//! A [`CancelToken`] is the explicit replacement for interrupting a
//! thread: a blocking call that is handed a token polls the token's wake
//! descriptor next to its socket, so [`CancelToken::cancel`] unblocks it
//! from any thread. Cancellation is sticky; once cancelled, every later
//! blocking call that checks the token returns
//! [`Error::Cancelled`](crate::Error::Cancelled) immediately.

use crate::error::Result;
use crate::sys::WakeFd;

use std::fmt;
use std::os::fd::RawFd;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

struct Inner {
    cancelled: AtomicBool,
    waker: WakeFd,
}

/// A cloneable cancellation handle.
#[derive(Clone)]
pub struct CancelToken {
    inner: Arc<Inner>,
}

impl CancelToken {
    /// Creates a token that is not cancelled.
    pub fn new() -> Result<Self> {
        Ok(Self {
            inner: Arc::new(Inner {
                cancelled: AtomicBool::new(false),
                waker: WakeFd::new()?,
            }),
        })
    }

    /// Cancels the token and unblocks every call currently waiting on it.
    pub fn cancel(&self) {
        if !self.inner.cancelled.swap(true, Ordering::AcqRel) {
            self.inner.waker.wake();
            debug!("cancellation requested");
        }
    }

    pub fn is_cancelled(&self) -> bool {
        self.inner.cancelled.load(Ordering::Acquire)
    }

    /// Descriptor that becomes readable once the token is cancelled.
    ///
    /// It is never drained, so it stays readable for every waiter.
    pub(crate) fn wake_fd(&self) -> RawFd {
        self.inner.waker.as_raw_fd()
    }
}

impl fmt::Debug for CancelToken {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CancelToken")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}
