//! Linux `epoll`-based poller implementation.
//!
//! Responsibilities:
//! - Register socket descriptors with read/write filters
//! - Block waiting for readiness
//! - Report when the selector was woken from another thread
//!
//! All control operations take `&self`: `epoll_ctl` is safe to call
//! while another thread is blocked in `epoll_wait`, and the kernel
//! picks up the change without an explicit wake-up.

use super::common::{Event, Filter, WakeFd};
use super::platform::timeout_ms;

use libc::{
    EPOLL_CLOEXEC, EPOLL_CTL_ADD, EPOLL_CTL_DEL, EPOLL_CTL_MOD, EPOLLERR, EPOLLHUP, EPOLLIN,
    EPOLLOUT, EPOLLRDHUP, epoll_create1, epoll_ctl, epoll_event, epoll_wait,
};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;

/// Reserved token used internally for the wake-up event.
///
/// Selection key tokens are allocated from zero upwards and never reach
/// this value.
const WAKE_TOKEN: u64 = u64::MAX;

/// Linux `epoll` poller.
///
/// This poller owns:
/// - an `epoll` instance,
/// - an internal `eventfd` used as a wake-up signal,
/// - a reusable event buffer, locked for the duration of a wait.
pub(crate) struct EpollPoller {
    /// Epoll file descriptor.
    epoll: RawFd,

    /// Reusable buffer for epoll events.
    events: Mutex<Vec<epoll_event>>,

    /// Wake-up descriptor registered under [`WAKE_TOKEN`].
    waker: WakeFd,
}

impl EpollPoller {
    /// Create a new `EpollPoller` able to report `capacity` events per wait.
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let epoll = unsafe { epoll_create1(EPOLL_CLOEXEC) };
        if epoll < 0 {
            return Err(io::Error::last_os_error());
        }

        let waker = match WakeFd::new() {
            Ok(waker) => waker,
            Err(e) => {
                unsafe { libc::close(epoll) };
                return Err(e);
            }
        };

        let poller = Self {
            epoll,
            events: Mutex::new(Vec::with_capacity(capacity.max(1))),
            waker,
        };

        poller.ctl(EPOLL_CTL_ADD, poller.waker.as_raw_fd(), EPOLLIN as u32, WAKE_TOKEN)?;

        Ok(poller)
    }

    /// Return the poller wake-up descriptor.
    pub(crate) fn waker(&self) -> &WakeFd {
        &self.waker
    }

    /// Register a file descriptor with the poller.
    ///
    /// An empty filter leaves the descriptor out of the epoll set: the
    /// kernel reports `EPOLLERR`/`EPOLLHUP` regardless of the requested
    /// events, so a hung-up socket with no interest would wake every
    /// wait.
    pub(crate) fn register(&self, fd: RawFd, token: u64, filter: Filter) -> io::Result<()> {
        if filter.is_empty() {
            return Ok(());
        }

        self.ctl(EPOLL_CTL_ADD, fd, flags(filter), token)
    }

    /// Update the filter of a registered descriptor.
    ///
    /// Moving to an empty filter removes the descriptor from the epoll
    /// set; moving away from it adds the descriptor back.
    pub(crate) fn reregister(&self, fd: RawFd, token: u64, filter: Filter) -> io::Result<()> {
        if filter.is_empty() {
            return match self.deregister(fd) {
                Err(err) if err.raw_os_error() == Some(libc::ENOENT) => Ok(()),
                other => other,
            };
        }

        match self.ctl(EPOLL_CTL_MOD, fd, flags(filter), token) {
            Err(err) if err.raw_os_error() == Some(libc::ENOENT) => {
                self.ctl(EPOLL_CTL_ADD, fd, flags(filter), token)
            }
            other => other,
        }
    }

    /// Remove a file descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let rc = unsafe { epoll_ctl(self.epoll, EPOLL_CTL_DEL, fd, std::ptr::null_mut()) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    fn ctl(&self, op: libc::c_int, fd: RawFd, events: u32, token: u64) -> io::Result<()> {
        let mut event = epoll_event { events, u64: token };

        let rc = unsafe { epoll_ctl(self.epoll, op, fd, &mut event) };
        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Poll for readiness events.
    ///
    /// Blocks until:
    /// - at least one file descriptor becomes ready,
    /// - the wake event is triggered,
    /// - or the optional timeout expires.
    ///
    /// Returns `true` when the wake descriptor fired. The descriptor is
    /// drained before returning.
    pub(crate) fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut buffer = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        events.clear();

        let n = unsafe {
            epoll_wait(
                self.epoll,
                buffer.as_mut_ptr(),
                buffer.capacity() as i32,
                timeout_ms(timeout),
            )
        };

        if n < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                return Ok(false);
            }
            return Err(err);
        }

        unsafe {
            buffer.set_len(n as usize);
        }

        let mut woken = false;

        for ev in buffer.iter() {
            let token = ev.u64;

            if token == WAKE_TOKEN {
                self.waker.drain();
                woken = true;
                continue;
            }

            let failed = ev.events & ((EPOLLERR | EPOLLHUP) as u32) != 0;
            let readable = failed || ev.events & ((EPOLLIN | EPOLLRDHUP) as u32) != 0;
            let writable = failed || ev.events & (EPOLLOUT as u32) != 0;

            events.push(Event {
                token,
                readable,
                writable,
            });
        }

        unsafe {
            buffer.set_len(0);
        }

        Ok(woken)
    }
}

impl Drop for EpollPoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.epoll) };
    }
}

fn flags(filter: Filter) -> u32 {
    let mut flags = 0;

    if filter.read {
        flags |= EPOLLIN | EPOLLRDHUP;
    }
    if filter.write {
        flags |= EPOLLOUT;
    }

    flags as u32
}
