use super::each_addr;
use super::stream::TcpChannel;
use crate::cancel::CancelToken;
use crate::error::{Error, Result};
use crate::net::SocketOptions;
use crate::selector::{KeySet, Selectable};
use crate::sys::platform::{
    Wait, domain_of, sys_accept, sys_bind, sys_close, sys_ipv6_is_necessary, sys_listen,
    sys_set_reuseaddr, sys_socket, sys_sockname, sys_wait,
};

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, Ordering};
use std::time::Instant;

use libc::POLLIN;
use tracing::debug;

/// A listening TCP socket.
///
/// Accepted channels start in blocking mode and inherit the per-connection
/// options (`TCP_NODELAY`, `SO_LINGER`, read and write timeouts) the
/// acceptor was bound with.
///
/// A blocking [`accept`](Self::accept) can only be interrupted through
/// [`accept_cancellable`](Self::accept_cancellable); closing the acceptor
/// from another thread does not wake it.
pub struct TcpAcceptor {
    /// File descriptor of the listening socket, `-1` once closed.
    fd: AtomicI32,
    blocking: AtomicBool,
    options: SocketOptions,
    keys: KeySet,
}

impl TcpAcceptor {
    /// Binds an acceptor to `addr` with default options.
    ///
    /// Port `0` picks an ephemeral port; see [`local_addr`](Self::local_addr).
    pub fn bind<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::bind_with(addr, &SocketOptions::new())
    }

    /// Binds an acceptor to `addr`.
    ///
    /// This function:
    /// - creates a non-blocking socket,
    /// - enables `SO_REUSEADDR` unless disabled,
    /// - configures IPv6 dual-stack if applicable,
    /// - binds and starts listening.
    pub fn bind_with<A: ToSocketAddrs>(addr: A, options: &SocketOptions) -> Result<Self> {
        each_addr(addr, |addr| Self::bind_addr(addr, options))
    }

    fn bind_addr(addr: &SocketAddr, options: &SocketOptions) -> Result<Self> {
        let domain = domain_of(addr);

        let acceptor = Self {
            fd: AtomicI32::new(sys_socket(domain)?),
            blocking: AtomicBool::new(!options.nonblocking),
            options: options.clone(),
            keys: KeySet::new(),
        };
        let fd = acceptor.open_fd()?;

        if options.reuse_address {
            sys_set_reuseaddr(fd)?;
        }
        sys_ipv6_is_necessary(fd, domain)?;
        sys_bind(fd, addr)?;
        sys_listen(fd, options.backlog)?;

        debug!(fd, %addr, backlog = options.backlog, "acceptor bound");
        Ok(acceptor)
    }

    fn open_fd(&self) -> Result<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            fd if fd >= 0 => Ok(fd),
            _ => Err(Error::Closed),
        }
    }

    /// Accepts a connection.
    ///
    /// Blocks in blocking mode, bounded by the accept timeout. In
    /// non-blocking mode an empty backlog fails with `WouldBlock`; prefer
    /// [`try_accept`](Self::try_accept) there.
    pub fn accept(&self) -> Result<(TcpChannel, SocketAddr)> {
        self.accept_inner(None)
    }

    /// Accepts a connection if one is pending, without blocking.
    pub fn try_accept(&self) -> Result<Option<(TcpChannel, SocketAddr)>> {
        let fd = self.open_fd()?;

        loop {
            match sys_accept(fd) {
                Ok((child, addr)) => return self.adopt(child, addr).map(Some),
                Err(err) if err.kind() == io::ErrorKind::Interrupted => continue,
                Err(err) if err.kind() == io::ErrorKind::WouldBlock => return Ok(None),
                Err(err) => return Err(err.into()),
            }
        }
    }

    /// Accepts a connection, giving up when `token` is cancelled.
    ///
    /// On cancellation the acceptor is closed and [`Error::Cancelled`] is
    /// returned. A connection accepted before the cancellation is seen
    /// is returned normally; the next call observes the cancellation.
    pub fn accept_cancellable(&self, token: &CancelToken) -> Result<(TcpChannel, SocketAddr)> {
        self.accept_inner(Some(token))
    }

    fn accept_inner(&self, token: Option<&CancelToken>) -> Result<(TcpChannel, SocketAddr)> {
        let deadline = self.options.accept_timeout.map(|t| Instant::now() + t);

        loop {
            if token.is_some_and(CancelToken::is_cancelled) {
                self.close();
                debug!("accept cancelled");
                return Err(Error::Cancelled);
            }

            let fd = self.open_fd()?;

            let err = match sys_accept(fd) {
                Ok((child, addr)) => return self.adopt(child, addr),
                Err(err) => err,
            };

            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock if self.is_blocking() => {
                    let wake = token.map(CancelToken::wake_fd);

                    if sys_wait(fd, POLLIN, wake, deadline)? == Wait::TimedOut {
                        return Err(Error::Timeout);
                    }
                }
                _ => return Err(err.into()),
            }
        }
    }

    fn adopt(&self, fd: RawFd, addr: SocketAddr) -> Result<(TcpChannel, SocketAddr)> {
        let channel = TcpChannel::from_raw(fd, true)?;
        let options = self.options.clone().nonblocking(false);

        channel.configure(&options)?;

        debug!(fd, peer = %addr, "connection accepted");
        Ok((channel, addr))
    }

    /// Switches between blocking and non-blocking mode.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        self.open_fd()?;

        let keys = self.keys.lock();

        if !nonblocking && keys.iter().any(|k| k.is_valid()) {
            return Err(Error::IllegalBlockingMode);
        }

        self.blocking.store(!nonblocking, Ordering::Release);
        Ok(())
    }

    pub fn is_blocking(&self) -> bool {
        self.blocking.load(Ordering::Acquire)
    }

    pub fn is_open(&self) -> bool {
        self.fd.load(Ordering::Acquire) >= 0
    }

    /// Returns the local socket address of this acceptor.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(sys_sockname(self.open_fd()?)?)
    }

    /// Stops listening. Idempotent.
    pub fn close(&self) {
        let fd = self.fd.load(Ordering::Acquire);
        if fd < 0 {
            return;
        }

        self.keys.cancel_all();

        if self
            .fd
            .compare_exchange(fd, -1, Ordering::AcqRel, Ordering::Acquire)
            .is_ok()
        {
            sys_close(fd);
            debug!(fd, "acceptor closed");
        }
    }
}

impl Selectable for TcpAcceptor {
    fn selectable_fd(&self) -> Option<RawFd> {
        self.open_fd().ok()
    }

    fn is_blocking(&self) -> bool {
        TcpAcceptor::is_blocking(self)
    }

    fn key_set(&self) -> &KeySet {
        &self.keys
    }
}

impl Drop for TcpAcceptor {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpAcceptor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpAcceptor")
            .field("fd", &self.fd.load(Ordering::Acquire))
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::thread;
    use std::time::Duration;

    #[test]
    fn test_try_accept_empty_backlog() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();

        assert!(acceptor.try_accept().unwrap().is_none());
    }

    #[test]
    fn test_accept_timeout() {
        let options = SocketOptions::new().accept_timeout(Some(Duration::from_millis(50)));
        let acceptor = TcpAcceptor::bind_with("127.0.0.1:0", &options).unwrap();

        assert!(matches!(acceptor.accept(), Err(Error::Timeout)));
        assert!(acceptor.is_open());
    }

    #[test]
    fn test_cancel_closes_acceptor() {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
        let token = CancelToken::new().unwrap();
        let remote = token.clone();

        let canceller = thread::spawn(move || {
            thread::sleep(Duration::from_millis(50));
            remote.cancel();
        });

        assert!(matches!(acceptor.accept_cancellable(&token), Err(Error::Cancelled)));
        assert!(!acceptor.is_open());
        assert!(matches!(acceptor.accept(), Err(Error::Closed)));

        canceller.join().unwrap();
    }

    #[test]
    fn test_accepted_channel_inherits_options() {
        let options = SocketOptions::new()
            .nodelay(true)
            .read_timeout(Some(Duration::from_millis(20)));
        let acceptor = TcpAcceptor::bind_with("127.0.0.1:0", &options).unwrap();
        let addr = acceptor.local_addr().unwrap();

        let _client = TcpChannel::connect(addr).unwrap();
        let (server, peer) = acceptor.accept().unwrap();

        assert!(server.is_blocking());
        assert!(server.nodelay().unwrap());
        assert_eq!(server.read_timeout(), Some(Duration::from_millis(20)));
        assert_eq!(server.peer_addr().unwrap(), peer);
    }
}
