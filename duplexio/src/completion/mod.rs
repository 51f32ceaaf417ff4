//! Asynchronous completion bridge.
//!
//! Non-blocking accept, connect, read and write operations are handed to
//! the driver thread of an [`AsyncGroup`]. Each submission returns a
//! [`Completion`], a single-delivery handle that can be polled, waited on
//! with or without a timeout, or awaited as a [`Future`].
//!
//! The driver owns the producing side, a [`Completer`]. Delivering a
//! result consumes it, so a second delivery cannot be written. The slot
//! behind the pair still guards itself with a compare-and-set so that a
//! caller cancelling a [`Completion`] and the driver completing it agree
//! on exactly one outcome.

mod group;
mod tcp;

pub use group::{AsyncGroup, AsyncGroupBuilder};
pub use tcp::{AsyncTcpChannel, AsyncTcpListener};

use crate::error::{Error, Result};
use crate::net::ReadOutcome;

use std::fmt;
use std::mem;
use std::pin::Pin;
use std::sync::atomic::{AtomicU8, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard, PoisonError};
use std::task::{Context, Poll, Waker};
use std::time::{Duration, Instant};

use tracing::trace;

const PENDING: u8 = 0;
const CLAIMED: u8 = 1;
const READY: u8 = 2;

struct Slot<T> {
    state: AtomicU8,
    value: Mutex<Option<Result<T>>>,
    ready: Condvar,
    wakers: Mutex<Vec<Waker>>,
}

impl<T> Slot<T> {
    fn new() -> Self {
        Self {
            state: AtomicU8::new(PENDING),
            value: Mutex::new(None),
            ready: Condvar::new(),
            wakers: Mutex::new(Vec::new()),
        }
    }

    fn value(&self) -> MutexGuard<'_, Option<Result<T>>> {
        self.value.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn is_ready(&self) -> bool {
        self.state.load(Ordering::Acquire) == READY
    }

    /// Stores `result` unless another outcome claimed the slot first.
    fn deliver(&self, result: Result<T>) -> bool {
        if self
            .state
            .compare_exchange(PENDING, CLAIMED, Ordering::AcqRel, Ordering::Acquire)
            .is_err()
        {
            return false;
        }

        {
            let mut value = self.value();
            *value = Some(result);
            self.state.store(READY, Ordering::Release);
        }

        self.ready.notify_all();

        let wakers = mem::take(&mut *self.wakers.lock().unwrap_or_else(PoisonError::into_inner));
        for waker in wakers {
            waker.wake();
        }

        true
    }

    /// Takes the delivered result. The slot must be ready.
    fn take(value: &mut Option<Result<T>>) -> Result<T> {
        value.take().unwrap_or(Err(Error::Closed))
    }
}

/// Creates a connected completer and completion.
pub fn pair<T>() -> (Completer<T>, Completion<T>) {
    let slot = Arc::new(Slot::new());

    (
        Completer {
            slot: Some(slot.clone()),
        },
        Completion { slot },
    )
}

/// The consuming side of an asynchronous operation.
///
/// The result can be taken once. Later attempts report
/// [`Error::Closed`].
pub struct Completion<T> {
    slot: Arc<Slot<T>>,
}

impl<T> Completion<T> {
    /// `true` once a result (or a cancellation) has been delivered.
    pub fn is_done(&self) -> bool {
        self.slot.is_ready()
    }

    /// Takes the result if it has been delivered.
    pub fn try_take(&mut self) -> Option<Result<T>> {
        if !self.slot.is_ready() {
            return None;
        }

        Some(Slot::take(&mut self.slot.value()))
    }

    /// Blocks until the result is delivered.
    pub fn wait(self) -> Result<T> {
        let mut value = self.slot.value();

        while !self.slot.is_ready() {
            value = self.slot.ready.wait(value).unwrap_or_else(PoisonError::into_inner);
        }

        Slot::take(&mut value)
    }

    /// Blocks until the result is delivered or `timeout` expires.
    ///
    /// An expired wait returns [`Error::Timeout`] and leaves the
    /// operation running; the completion can be waited on again.
    pub fn wait_timeout(&mut self, timeout: Duration) -> Result<T> {
        let deadline = Instant::now() + timeout;
        let mut value = self.slot.value();

        while !self.slot.is_ready() {
            let now = Instant::now();
            if now >= deadline {
                return Err(Error::Timeout);
            }

            value = self
                .slot
                .ready
                .wait_timeout(value, deadline - now)
                .unwrap_or_else(PoisonError::into_inner)
                .0;
        }

        Slot::take(&mut value)
    }

    /// Cancels the operation.
    ///
    /// Returns `true` if the cancellation won, in which case the result
    /// is [`Error::Cancelled`]. Returns `false` if a result was already
    /// delivered.
    pub fn cancel(&self) -> bool {
        let cancelled = self.slot.deliver(Err(Error::Cancelled));

        if cancelled {
            trace!("completion cancelled");
        }

        cancelled
    }
}

impl<T> Future for Completion<T> {
    type Output = Result<T>;

    /// The waker is registered before re-checking the slot so a delivery
    /// racing the registration is not missed.
    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        if self.slot.is_ready() {
            return Poll::Ready(Slot::take(&mut self.slot.value()));
        }

        self.slot
            .wakers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(cx.waker().clone());

        if self.slot.is_ready() {
            return Poll::Ready(Slot::take(&mut self.slot.value()));
        }

        Poll::Pending
    }
}

impl<T> fmt::Debug for Completion<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completion")
            .field("done", &self.is_done())
            .finish()
    }
}

/// The producing side of an asynchronous operation.
///
/// Dropping a `Completer` without delivering completes the operation
/// with [`Error::Cancelled`].
pub struct Completer<T> {
    slot: Option<Arc<Slot<T>>>,
}

impl<T> Completer<T> {
    /// Delivers `result`.
    ///
    /// Returns `false` if the completion was cancelled first; `result` is
    /// dropped in that case.
    pub fn complete(mut self, result: Result<T>) -> bool {
        match self.slot.take() {
            Some(slot) => slot.deliver(result),
            None => false,
        }
    }

    pub fn succeed(self, value: T) -> bool {
        self.complete(Ok(value))
    }

    pub fn fail(self, err: Error) -> bool {
        self.complete(Err(err))
    }

    /// `true` once the consumer cancelled the operation.
    pub fn is_cancelled(&self) -> bool {
        self.slot
            .as_ref()
            .is_none_or(|slot| slot.state.load(Ordering::Acquire) != PENDING)
    }
}

impl<T> Drop for Completer<T> {
    fn drop(&mut self) {
        if let Some(slot) = self.slot.take() {
            slot.deliver(Err(Error::Cancelled));
        }
    }
}

impl<T> fmt::Debug for Completer<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Completer")
            .field("cancelled", &self.is_cancelled())
            .finish()
    }
}

/// A buffer handed back by an asynchronous read or write.
#[derive(Debug)]
pub struct Transfer {
    /// The buffer that was submitted.
    pub buf: Vec<u8>,

    /// Bytes read into `buf`, bytes written from it, or end-of-stream.
    pub outcome: ReadOutcome,
}

impl Transfer {
    /// The transferred bytes.
    pub fn bytes(&self) -> &[u8] {
        match self.outcome {
            ReadOutcome::Data(n) => &self.buf[..n],
            ReadOutcome::EndOfStream => &[],
        }
    }

    pub fn is_eof(&self) -> bool {
        self.outcome.is_eof()
    }
}
