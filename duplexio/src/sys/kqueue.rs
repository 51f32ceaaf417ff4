//! `kqueue`-based poller implementation for macOS and FreeBSD.
//!
//! It is functionally equivalent to the Linux `epoll` poller and exposes
//! the same interface to the selector. Read and write interest map to
//! two independent filters; a filter that is not wanted stays registered
//! but disabled so that re-registration never has to guess whether it
//! exists.

use super::common::{Event, Filter, WakeFd};
use super::platform::sys_set_cloexec;

use libc::{EV_ADD, EV_DELETE, EV_DISABLE, EV_ENABLE, EV_EOF, EV_ERROR, EVFILT_READ, EVFILT_WRITE};
use std::io;
use std::os::unix::io::RawFd;
use std::sync::{Mutex, PoisonError};
use std::time::Duration;
use std::{mem, ptr};

/// Reserved token used internally for the wake-up event.
const WAKE_TOKEN: u64 = u64::MAX;

/// `kqueue` poller.
pub(crate) struct KqueuePoller {
    /// Kqueue file descriptor.
    kq: RawFd,

    /// Reusable buffer for kernel events.
    events: Mutex<Vec<libc::kevent>>,

    /// Wake-up pipe registered under [`WAKE_TOKEN`].
    waker: WakeFd,
}

// SAFETY: the raw `udata` pointers stored in the event buffer are plain
// integer tokens and are never dereferenced.
unsafe impl Send for KqueuePoller {}
unsafe impl Sync for KqueuePoller {}

fn kevent(fd: RawFd, filter: i16, flags: u16, token: u64) -> libc::kevent {
    let mut ev: libc::kevent = unsafe { mem::zeroed() };

    ev.ident = fd as _;
    ev.filter = filter as _;
    ev.flags = flags as _;
    ev.udata = token as usize as *mut _;

    ev
}

impl KqueuePoller {
    /// Create a new `KqueuePoller` able to report `capacity` events per wait.
    pub(crate) fn new(capacity: usize) -> io::Result<Self> {
        let kq = unsafe { libc::kqueue() };
        if kq < 0 {
            return Err(io::Error::last_os_error());
        }

        if let Err(e) = sys_set_cloexec(kq) {
            unsafe { libc::close(kq) };
            return Err(e);
        }

        let waker = match WakeFd::new() {
            Ok(waker) => waker,
            Err(e) => {
                unsafe { libc::close(kq) };
                return Err(e);
            }
        };

        let poller = Self {
            kq,
            events: Mutex::new(Vec::with_capacity(capacity.max(1))),
            waker,
        };

        poller.apply(&[kevent(
            poller.waker.as_raw_fd(),
            EVFILT_READ,
            EV_ADD,
            WAKE_TOKEN,
        )])?;

        Ok(poller)
    }

    /// Return the poller wake-up descriptor.
    pub(crate) fn waker(&self) -> &WakeFd {
        &self.waker
    }

    /// Register a file descriptor with the poller.
    pub(crate) fn register(&self, fd: RawFd, token: u64, filter: Filter) -> io::Result<()> {
        self.apply(&changes(fd, token, filter))
    }

    /// Update the filters of an already registered descriptor.
    pub(crate) fn reregister(&self, fd: RawFd, token: u64, filter: Filter) -> io::Result<()> {
        self.apply(&changes(fd, token, filter))
    }

    /// Remove a file descriptor from the poller.
    pub(crate) fn deregister(&self, fd: RawFd) -> io::Result<()> {
        let read = self.apply(&[kevent(fd, EVFILT_READ, EV_DELETE, 0)]);
        let write = self.apply(&[kevent(fd, EVFILT_WRITE, EV_DELETE, 0)]);

        read.and(write)
    }

    fn apply(&self, changes: &[libc::kevent]) -> io::Result<()> {
        let rc = unsafe {
            libc::kevent(
                self.kq,
                changes.as_ptr(),
                changes.len() as _,
                ptr::null_mut(),
                0,
                ptr::null(),
            )
        };

        if rc < 0 {
            Err(io::Error::last_os_error())
        } else {
            Ok(())
        }
    }

    /// Poll for readiness events.
    ///
    /// Returns `true` when the wake descriptor fired. The descriptor is
    /// drained before returning.
    pub(crate) fn poll(&self, events: &mut Vec<Event>, timeout: Option<Duration>) -> io::Result<bool> {
        let mut buffer = self.events.lock().unwrap_or_else(PoisonError::into_inner);

        events.clear();

        let ts = timeout.map(|d| libc::timespec {
            tv_sec: d.as_secs().min(libc::time_t::MAX as u64) as libc::time_t,
            tv_nsec: d.subsec_nanos() as _,
        });
        let ts_ptr = ts.as_ref().map_or(ptr::null(), |t| t as *const libc::timespec);

        let n = unsafe {
            libc::kevent(
                self.kq,
                ptr::null(),
                0,
                buffer.as_mut_ptr(),
                buffer.capacity() as _,
                ts_ptr,
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
            let token = ev.udata as usize as u64;

            if token == WAKE_TOKEN {
                self.waker.drain();
                woken = true;
                continue;
            }

            let failed = ev.flags & (EV_ERROR | EV_EOF) != 0;
            let readable = ev.filter == EVFILT_READ || failed;
            let writable = ev.filter == EVFILT_WRITE || failed;

            if let Some(e) = events.iter_mut().find(|e| e.token == token) {
                e.readable |= readable;
                e.writable |= writable;
            } else {
                events.push(Event {
                    token,
                    readable,
                    writable,
                });
            }
        }

        unsafe {
            buffer.set_len(0);
        }

        Ok(woken)
    }
}

impl Drop for KqueuePoller {
    fn drop(&mut self) {
        unsafe { libc::close(self.kq) };
    }
}

fn changes(fd: RawFd, token: u64, filter: Filter) -> [libc::kevent; 2] {
    let toggle = |on: bool| if on { EV_ADD | EV_ENABLE } else { EV_ADD | EV_DISABLE };

    [
        kevent(fd, EVFILT_READ, toggle(filter.read), token),
        kevent(fd, EVFILT_WRITE, toggle(filter.write), token),
    ]
}
