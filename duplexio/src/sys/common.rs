use std::io;
use std::os::fd::RawFd;

/// Read/write readiness filter handed to a poller backend.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub(crate) struct Filter {
    pub(crate) read: bool,
    pub(crate) write: bool,
}

impl Filter {
    pub(crate) fn is_empty(self) -> bool {
        !self.read && !self.write
    }
}

/// A readiness event reported by the poller.
///
/// The token identifies the selection key the descriptor was registered
/// under; error and hang-up conditions are folded into both directions
/// so that the next I/O call reports them.
#[derive(Clone, Copy, Debug)]
pub(crate) struct Event {
    pub(crate) token: u64,
    pub(crate) readable: bool,
    pub(crate) writable: bool,
}

/// A descriptor that can be made readable from any thread.
///
/// On Linux this is a single non-blocking `eventfd`; elsewhere it is a
/// non-blocking pipe. Writers call [`wake`](Self::wake), the owner
/// polls [`as_raw_fd`](Self::as_raw_fd) and clears it with
/// [`drain`](Self::drain).
pub(crate) struct WakeFd {
    read: RawFd,
    write: RawFd,
}

impl WakeFd {
    #[cfg(any(target_os = "linux", target_os = "android"))]
    pub(crate) fn new() -> io::Result<Self> {
        let fd = unsafe { libc::eventfd(0, libc::EFD_NONBLOCK | libc::EFD_CLOEXEC) };
        if fd < 0 {
            return Err(io::Error::last_os_error());
        }

        Ok(Self { read: fd, write: fd })
    }

    #[cfg(not(any(target_os = "linux", target_os = "android")))]
    pub(crate) fn new() -> io::Result<Self> {
        use super::platform::{sys_set_cloexec, sys_set_nonblocking};

        let mut fds = [0 as libc::c_int; 2];
        if unsafe { libc::pipe(fds.as_mut_ptr()) } < 0 {
            return Err(io::Error::last_os_error());
        }

        let wake = Self {
            read: fds[0],
            write: fds[1],
        };

        for fd in fds {
            sys_set_nonblocking(fd, true)?;
            sys_set_cloexec(fd)?;
        }

        Ok(wake)
    }

    /// Returns the descriptor to poll for readability.
    pub(crate) fn as_raw_fd(&self) -> RawFd {
        self.read
    }

    /// Makes the descriptor readable.
    ///
    /// A full counter or pipe already guarantees readability, so a
    /// failed write is ignored.
    pub(crate) fn wake(&self) {
        let buf: u64 = 1;
        let len = if self.read == self.write { 8 } else { 1 };

        unsafe {
            libc::write(self.write, &buf as *const u64 as *const _, len);
        }
    }

    /// Consumes every pending wake-up.
    pub(crate) fn drain(&self) {
        let mut buf = [0u8; 64];

        loop {
            let n = unsafe { libc::read(self.read, buf.as_mut_ptr() as *mut _, buf.len()) };
            if n <= 0 {
                break;
            }
        }
    }
}

impl Drop for WakeFd {
    fn drop(&mut self) {
        unsafe {
            libc::close(self.read);
            if self.write != self.read {
                libc::close(self.write);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sys::platform::{Wait, sys_wait};
    use std::time::{Duration, Instant};

    #[test]
    fn test_wake_then_drain() {
        let wake = WakeFd::new().expect("wake fd");

        wake.wake();
        wake.wake();

        let deadline = Some(Instant::now() + Duration::from_millis(50));
        let res = sys_wait(wake.as_raw_fd(), libc::POLLIN, None, deadline).unwrap();
        assert!(matches!(res, Wait::Ready));

        wake.drain();

        let deadline = Some(Instant::now() + Duration::from_millis(20));
        let res = sys_wait(wake.as_raw_fd(), libc::POLLIN, None, deadline).unwrap();
        assert!(matches!(res, Wait::TimedOut));
    }
}
