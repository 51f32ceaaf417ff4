use crate::error::{Error, Result};
use crate::net::{ByteChannel, ReadOutcome, SocketOptions};
use crate::selector::{KeySet, Selectable};
use crate::state::{Phase, ShutdownState, Transition};
use crate::sys::WakeFd;
use crate::sys::platform::{
    Wait, connect_in_progress, domain_of, sys_close, sys_connect, sys_get_socket_error,
    sys_ipv6_is_necessary, sys_linger, sys_nodelay, sys_peername, sys_recv, sys_send,
    sys_send_vectored, sys_set_linger, sys_set_nodelay, sys_shutdown, sys_sockname, sys_socket,
    sys_wait,
};

use super::each_addr;

use std::fmt;
use std::io::{self, IoSlice};
use std::net::{Shutdown, SocketAddr, ToSocketAddrs};
use std::os::fd::RawFd;
use std::sync::atomic::{AtomicBool, AtomicI32, AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use std::time::{Duration, Instant};

use libc::{POLLIN, POLLOUT, c_short};
use tracing::{debug, trace};

/// Set in `TcpChannel::users` once the channel starts closing.
const CLOSING: usize = 1 << (usize::BITS - 1);

#[derive(Debug, Clone, Copy, Default)]
struct Timeouts {
    read: Option<Duration>,
    write: Option<Duration>,
}

/// A connected TCP channel.
///
/// `TcpChannel` tracks the shutdown state of both directions and applies
/// the half-close rules on every call:
/// - reading end-of-stream is an outcome, not a state change,
/// - a local [`shutdown_input`](Self::shutdown_input) turns reads into
///   end-of-stream,
/// - writing after [`shutdown_output`](Self::shutdown_output) or after
///   [`close`](Self::close) fails with [`Error::BrokenConnection`].
///
/// All methods take `&self`: one thread may read while another writes,
/// and a third may close the channel. Closing wakes calls blocked on the
/// channel, which then fail with [`Error::BrokenConnection`]. The
/// descriptor is released only after every call using it has returned,
/// so it is never reused under a call still in flight.
pub struct TcpChannel {
    fd: AtomicI32,
    state: ShutdownState,
    blocking: AtomicBool,
    timeouts: Mutex<Timeouts>,
    keys: KeySet,

    /// Calls currently using `fd`, plus the [`CLOSING`] bit.
    users: AtomicUsize,

    /// Made readable by `close` to interrupt blocked waits.
    wake: WakeFd,
}

/// A call holding the descriptor open.
struct InUse<'a> {
    channel: &'a TcpChannel,
    fd: RawFd,
}

impl Drop for InUse<'_> {
    fn drop(&mut self) {
        self.channel.leave();
    }
}

impl TcpChannel {
    /// Opens a connection to `addr` with default options.
    pub fn connect<A: ToSocketAddrs>(addr: A) -> Result<Self> {
        Self::connect_with(addr, &SocketOptions::new())
    }

    /// Opens a connection to `addr`.
    ///
    /// Each resolved address is tried in turn. The handshake is bounded
    /// by the configured connect timeout, if any.
    pub fn connect_with<A: ToSocketAddrs>(addr: A, options: &SocketOptions) -> Result<Self> {
        each_addr(addr, |addr| Self::connect_addr(addr, options))
    }

    fn connect_addr(addr: &SocketAddr, options: &SocketOptions) -> Result<Self> {
        let (channel, connected) = Self::begin_connect(addr)?;

        if !connected {
            let held = channel.enter()?;
            let deadline = options.connect_timeout.map(|t| Instant::now() + t);

            if sys_wait(held.fd, POLLOUT, None, deadline)? == Wait::TimedOut {
                return Err(Error::Timeout);
            }

            channel.finish_connect()?;
        }

        channel.configure(options)?;

        debug!(fd = channel.fd.load(Ordering::Acquire), %addr, "channel connected");
        Ok(channel)
    }

    /// Starts a non-blocking connect.
    ///
    /// Returns the channel and whether the handshake already completed.
    pub(crate) fn begin_connect(addr: &SocketAddr) -> Result<(Self, bool)> {
        let domain = domain_of(addr);
        let channel = Self::from_raw(sys_socket(domain)?, true)?;
        let held = channel.enter()?;

        sys_ipv6_is_necessary(held.fd, domain)?;

        let connected: Result<bool> = match sys_connect(held.fd, addr) {
            Ok(()) => Ok(true),
            Err(err) if connect_in_progress(&err) => Ok(false),
            Err(err) => Err(err.into()),
        };

        drop(held);
        connected.map(|connected| (channel, connected))
    }

    /// Reports the outcome of a connect started by
    /// [`begin_connect`](Self::begin_connect) once the socket is writable.
    pub(crate) fn finish_connect(&self) -> Result<()> {
        sys_get_socket_error(self.enter()?.fd)?;
        Ok(())
    }

    /// Wraps a connected, OS-non-blocking socket. The descriptor is
    /// closed if the channel cannot be set up.
    pub(crate) fn from_raw(fd: RawFd, blocking: bool) -> Result<Self> {
        let wake = match WakeFd::new() {
            Ok(wake) => wake,
            Err(err) => {
                sys_close(fd);
                return Err(err.into());
            }
        };

        Ok(Self {
            fd: AtomicI32::new(fd),
            state: ShutdownState::new(),
            blocking: AtomicBool::new(blocking),
            timeouts: Mutex::new(Timeouts::default()),
            keys: KeySet::new(),
            users: AtomicUsize::new(0),
            wake,
        })
    }

    /// Applies the per-connection options.
    pub(crate) fn configure(&self, options: &SocketOptions) -> Result<()> {
        if let Some(nodelay) = options.nodelay {
            self.set_nodelay(nodelay)?;
        }
        if let Some(linger) = options.linger {
            self.set_linger(linger)?;
        }

        self.set_read_timeout(options.read_timeout);
        self.set_write_timeout(options.write_timeout);
        self.blocking.store(!options.nonblocking, Ordering::Release);

        Ok(())
    }

    /// Holds the descriptor open for the duration of a call; fails with
    /// [`Error::Closed`] once the channel is closing.
    fn enter(&self) -> Result<InUse<'_>> {
        let previous = self.users.fetch_add(1, Ordering::AcqRel);
        let held = InUse {
            channel: self,
            fd: self.fd.load(Ordering::Acquire),
        };

        if previous & CLOSING != 0 || held.fd < 0 || self.state.is_closed() {
            return Err(Error::Closed);
        }

        Ok(held)
    }

    /// Like [`enter`](Self::enter) for data transfer; fails with
    /// [`Error::BrokenConnection`].
    fn enter_io(&self) -> Result<InUse<'_>> {
        self.enter().map_err(|_| Error::BrokenConnection)
    }

    /// The last call to leave a closing channel releases the descriptor.
    fn leave(&self) {
        if self.users.fetch_sub(1, Ordering::AcqRel) == CLOSING | 1 {
            self.release_fd();
        }
    }

    fn release_fd(&self) {
        let fd = self.fd.swap(-1, Ordering::AcqRel);

        if fd >= 0 {
            sys_close(fd);
            trace!(fd, "descriptor released");
        }
    }

    fn timeouts(&self) -> Timeouts {
        *self.timeouts.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Reads into `buf`. See [`ByteChannel::read`].
    pub fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        let held = self.enter_io()?;
        let fd = held.fd;

        if self.state.is_input_shutdown() {
            return Ok(ReadOutcome::EndOfStream);
        }

        if buf.is_empty() {
            return Ok(ReadOutcome::Data(0));
        }

        let deadline = self.timeouts().read.map(|t| Instant::now() + t);

        loop {
            let n = sys_recv(fd, buf);

            if n > 0 {
                return Ok(ReadOutcome::Data(n as usize));
            }

            if n == 0 {
                self.state.observe_eof();
                trace!(fd, "end-of-stream");
                return Ok(ReadOutcome::EndOfStream);
            }

            let err = io::Error::last_os_error();

            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if !self.is_blocking() {
                        return Ok(ReadOutcome::Data(0));
                    }
                    self.await_ready(fd, POLLIN, deadline)?;
                }
                _ => return Err(self.transport_error(err)),
            }
        }
    }

    /// Writes from `buf`. See [`ByteChannel::write`].
    pub fn write(&self, buf: &[u8]) -> Result<usize> {
        let held = self.enter_io()?;

        if self.state.is_output_shutdown() {
            return Err(Error::BrokenConnection);
        }

        if buf.is_empty() {
            return Ok(0);
        }

        self.send_with(held.fd, |fd| sys_send(fd, buf))
    }

    /// Gathers the slices into a single `sendmsg(2)`.
    pub fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let held = self.enter_io()?;

        if self.state.is_output_shutdown() {
            return Err(Error::BrokenConnection);
        }

        if bufs.iter().all(|b| b.is_empty()) {
            return Ok(0);
        }

        self.send_with(held.fd, |fd| sys_send_vectored(fd, bufs))
    }

    fn send_with(&self, fd: RawFd, send: impl Fn(RawFd) -> isize) -> Result<usize> {
        let deadline = self.timeouts().write.map(|t| Instant::now() + t);

        loop {
            let n = send(fd);

            if n >= 0 {
                return Ok(n as usize);
            }

            let err = io::Error::last_os_error();

            match err.kind() {
                io::ErrorKind::Interrupted => continue,
                io::ErrorKind::WouldBlock => {
                    if !self.is_blocking() {
                        return Ok(0);
                    }
                    self.await_ready(fd, POLLOUT, deadline)?;
                }
                _ => return Err(self.transport_error(err)),
            }
        }
    }

    fn await_ready(&self, fd: RawFd, events: c_short, deadline: Option<Instant>) -> Result<()> {
        let wait = sys_wait(fd, events, Some(self.wake.as_raw_fd()), deadline);

        if self.state.is_closed() {
            return Err(Error::BrokenConnection);
        }

        match wait? {
            Wait::TimedOut => Err(Error::Timeout),
            Wait::Ready | Wait::Woken => Ok(()),
        }
    }

    fn transport_error(&self, err: io::Error) -> Error {
        let err = match err.kind() {
            // Retransmission or keepalive expiry: the kernel dropped the
            // connection.
            io::ErrorKind::TimedOut => Error::ConnectionReset,
            _ => Error::from(err),
        };

        if matches!(err, Error::ConnectionReset) {
            self.state.observe_reset();
        }

        debug!(%err, "transport error");
        err
    }

    /// Shuts down the read direction.
    ///
    /// Later reads report end-of-stream without touching the socket.
    /// Repeating the call is a no-op. Some platforms reject the shutdown
    /// once the peer has fully closed; the direction is marked shut down
    /// anyway.
    pub fn shutdown_input(&self) -> Result<()> {
        let held = self.enter()?;
        self.shutdown_direction(held.fd, Shutdown::Read, self.state.shutdown_input())
    }

    /// Shuts down the write direction, sending FIN to the peer.
    ///
    /// Repeating the call is a no-op.
    pub fn shutdown_output(&self) -> Result<()> {
        let held = self.enter()?;
        self.shutdown_direction(held.fd, Shutdown::Write, self.state.shutdown_output())
    }

    fn shutdown_direction(&self, fd: RawFd, how: Shutdown, transition: Transition) -> Result<()> {
        match transition {
            Transition::AlreadyDone => Ok(()),
            Transition::Closed => Err(Error::Closed),
            Transition::Applied if self.state.is_closed() => Err(Error::Closed),
            Transition::Applied => match sys_shutdown(fd, how) {
                Ok(()) => {
                    debug!(fd, ?how, "direction shut down");
                    Ok(())
                }
                Err(err) if peer_gone(&err) => {
                    debug!(fd, ?how, %err, "shutdown after peer teardown");
                    Ok(())
                }
                Err(err) => Err(err.into()),
            },
        }
    }

    /// Closes the channel, releasing both directions.
    ///
    /// Registered selection keys are cancelled and blocked calls are
    /// woken; the descriptor is released once the last of them returns.
    /// Idempotent.
    pub fn close(&self) {
        if self.state.close() != Transition::Applied {
            return;
        }

        self.keys.cancel_all();
        self.wake.wake();

        let users = self.users.fetch_or(CLOSING, Ordering::AcqRel);
        if users == 0 {
            self.release_fd();
        }

        debug!(in_flight = users, "channel closed");
    }

    pub fn is_input_shutdown(&self) -> bool {
        self.state.is_input_shutdown()
    }

    pub fn is_output_shutdown(&self) -> bool {
        self.state.is_output_shutdown()
    }

    pub fn is_closed(&self) -> bool {
        self.state.is_closed()
    }

    /// The shutdown state of this channel.
    pub fn state(&self) -> &ShutdownState {
        &self.state
    }

    pub fn phase(&self) -> Phase {
        self.state.phase()
    }

    /// Switches between blocking and non-blocking mode.
    ///
    /// # Errors
    ///
    /// [`Error::IllegalBlockingMode`] when switching to blocking mode
    /// while registered with a selector.
    pub fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        let _held = self.enter()?;

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

    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(sys_sockname(self.enter()?.fd)?)
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        Ok(sys_peername(self.enter()?.fd)?)
    }

    /// Sets `TCP_NODELAY`.
    pub fn set_nodelay(&self, nodelay: bool) -> Result<()> {
        Ok(sys_set_nodelay(self.enter()?.fd, nodelay)?)
    }

    pub fn nodelay(&self) -> Result<bool> {
        Ok(sys_nodelay(self.enter()?.fd)?)
    }

    /// Sets `SO_LINGER`. With `Some(Duration::ZERO)`, [`close`](Self::close)
    /// resets the connection instead of the normal FIN sequence.
    pub fn set_linger(&self, linger: Option<Duration>) -> Result<()> {
        Ok(sys_set_linger(self.enter()?.fd, linger)?)
    }

    pub fn linger(&self) -> Result<Option<Duration>> {
        Ok(sys_linger(self.enter()?.fd)?)
    }

    /// Bounds blocking reads. `None` waits indefinitely.
    pub fn set_read_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().unwrap_or_else(PoisonError::into_inner).read = timeout;
    }

    pub fn read_timeout(&self) -> Option<Duration> {
        self.timeouts().read
    }

    /// Bounds blocking writes. `None` waits indefinitely.
    pub fn set_write_timeout(&self, timeout: Option<Duration>) {
        self.timeouts.lock().unwrap_or_else(PoisonError::into_inner).write = timeout;
    }

    pub fn write_timeout(&self) -> Option<Duration> {
        self.timeouts().write
    }

    /// Descriptor for selector registration. Registration and close
    /// serialize on the key set, so it stays valid while registering.
    pub(crate) fn raw_fd(&self) -> Option<RawFd> {
        match self.fd.load(Ordering::Acquire) {
            fd if fd >= 0 && !self.state.is_closed() => Some(fd),
            _ => None,
        }
    }
}

/// `ENOTCONN` and `EINVAL` from `shutdown(2)` mean the connection is
/// already gone on the peer side.
fn peer_gone(err: &io::Error) -> bool {
    matches!(err.raw_os_error(), Some(libc::ENOTCONN) | Some(libc::EINVAL))
}

impl ByteChannel for TcpChannel {
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome> {
        TcpChannel::read(self, buf)
    }

    fn write(&self, buf: &[u8]) -> Result<usize> {
        TcpChannel::write(self, buf)
    }

    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        TcpChannel::write_vectored(self, bufs)
    }

    fn shutdown_input(&self) -> Result<()> {
        TcpChannel::shutdown_input(self)
    }

    fn shutdown_output(&self) -> Result<()> {
        TcpChannel::shutdown_output(self)
    }

    fn close(&self) {
        TcpChannel::close(self)
    }

    fn is_input_shutdown(&self) -> bool {
        TcpChannel::is_input_shutdown(self)
    }

    fn is_output_shutdown(&self) -> bool {
        TcpChannel::is_output_shutdown(self)
    }

    fn is_closed(&self) -> bool {
        TcpChannel::is_closed(self)
    }

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()> {
        TcpChannel::set_nonblocking(self, nonblocking)
    }

    fn is_blocking(&self) -> bool {
        TcpChannel::is_blocking(self)
    }
}

impl Selectable for TcpChannel {
    fn selectable_fd(&self) -> Option<RawFd> {
        self.raw_fd()
    }

    fn is_blocking(&self) -> bool {
        TcpChannel::is_blocking(self)
    }

    fn key_set(&self) -> &KeySet {
        &self.keys
    }
}

/// Adapter for code written against `std::io`. End-of-stream reads as
/// `Ok(0)`.
impl io::Read for &TcpChannel {
    fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
        match TcpChannel::read(*self, buf)? {
            ReadOutcome::Data(0) if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            ReadOutcome::Data(n) => Ok(n),
            ReadOutcome::EndOfStream => Ok(0),
        }
    }
}

impl io::Write for &TcpChannel {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        match TcpChannel::write(*self, buf)? {
            0 if !buf.is_empty() => Err(io::ErrorKind::WouldBlock.into()),
            n => Ok(n),
        }
    }

    fn write_vectored(&mut self, bufs: &[IoSlice<'_>]) -> io::Result<usize> {
        Ok(TcpChannel::write_vectored(*self, bufs)?)
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl Drop for TcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for TcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TcpChannel")
            .field("fd", &self.fd.load(Ordering::Acquire))
            .field("state", &self.state)
            .field("blocking", &self.is_blocking())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::net::TcpAcceptor;

    use std::sync::{Arc, mpsc};
    use std::thread;

    fn pair() -> (TcpChannel, TcpChannel) {
        let acceptor = TcpAcceptor::bind("127.0.0.1:0").unwrap();
        let addr = acceptor.local_addr().unwrap();

        let client = TcpChannel::connect(addr).unwrap();
        let (server, _) = acceptor.accept().unwrap();

        (client, server)
    }

    #[test]
    fn test_eof_does_not_mark_input_shutdown() {
        let (client, server) = pair();

        client.shutdown_output().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);

        assert!(!server.is_input_shutdown());
        assert!(server.state().eof_observed());
    }

    #[test]
    fn test_local_input_shutdown_reads_eof() {
        let (client, server) = pair();

        client.write_all(b"ignored").unwrap();
        server.shutdown_input().unwrap();
        server.shutdown_input().unwrap();

        let mut buf = [0u8; 16];
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::EndOfStream);
        assert_eq!(server.phase(), Phase::HalfShut);
    }

    #[test]
    fn test_write_after_output_shutdown_is_broken() {
        let (client, _server) = pair();

        client.shutdown_output().unwrap();

        assert!(matches!(client.write(b"x"), Err(Error::BrokenConnection)));
        assert!(client.is_output_shutdown());
        assert!(!client.is_input_shutdown());
    }

    #[test]
    fn test_close_is_idempotent_and_final() {
        let (client, _server) = pair();

        client.close();
        client.close();

        let mut buf = [0u8; 4];
        assert!(matches!(client.read(&mut buf), Err(Error::BrokenConnection)));
        assert!(matches!(client.write(b"x"), Err(Error::BrokenConnection)));
        assert!(matches!(client.shutdown_output(), Err(Error::Closed)));
        assert!(client.is_input_shutdown());
        assert!(client.is_output_shutdown());
        assert_eq!(client.phase(), Phase::Closed);
    }

    #[test]
    fn test_nonblocking_read_with_no_data() {
        let (client, _server) = pair();

        client.set_nonblocking(true).unwrap();

        let mut buf = [0u8; 4];
        assert_eq!(client.read(&mut buf).unwrap(), ReadOutcome::Data(0));
    }

    #[test]
    fn test_read_timeout_leaves_channel_usable() {
        let (client, server) = pair();

        server.set_read_timeout(Some(Duration::from_millis(50)));

        let mut buf = [0u8; 4];
        assert!(matches!(server.read(&mut buf), Err(Error::Timeout)));

        client.write_all(b"late").unwrap();
        assert_eq!(server.read(&mut buf).unwrap(), ReadOutcome::Data(4));
        assert_eq!(&buf, b"late");
    }

    #[test]
    fn test_close_wakes_blocked_reader() {
        let (_client, server) = pair();
        let server = Arc::new(server);

        let (done, outcome) = mpsc::channel();
        let reader = server.clone();

        let handle = thread::spawn(move || {
            let mut buf = [0u8; 16];
            done.send(reader.read(&mut buf)).unwrap();
        });

        thread::sleep(Duration::from_millis(100));
        server.close();

        let result = outcome.recv_timeout(Duration::from_secs(3)).unwrap();
        assert!(matches!(result, Err(Error::BrokenConnection)));

        handle.join().unwrap();
        assert_eq!(server.fd.load(Ordering::Acquire), -1);
    }

    #[test]
    fn test_descriptor_outlives_calls_in_flight() {
        let (_client, server) = pair();

        let held = server.enter().unwrap();
        server.close();

        // Still open for the call in flight, refused to new ones.
        assert!(server.fd.load(Ordering::Acquire) >= 0);
        assert!(matches!(server.local_addr(), Err(Error::Closed)));
        assert!(matches!(server.shutdown_input(), Err(Error::Closed)));

        drop(held);
        assert_eq!(server.fd.load(Ordering::Acquire), -1);
    }

    #[test]
    fn test_kernel_timeout_on_transfer_is_a_reset() {
        let (client, _server) = pair();

        let err = client.transport_error(io::Error::from_raw_os_error(libc::ETIMEDOUT));

        assert!(matches!(err, Error::ConnectionReset));
        assert!(err.is_transport());
        assert!(client.state().reset_observed());
    }

    #[test]
    fn test_socket_options_round_trip() {
        let (client, _server) = pair();

        client.set_nodelay(true).unwrap();
        assert!(client.nodelay().unwrap());

        client.set_linger(Some(Duration::ZERO)).unwrap();
        assert_eq!(client.linger().unwrap(), Some(Duration::ZERO));

        client.set_linger(None).unwrap();
        assert_eq!(client.linger().unwrap(), None);
    }
}
