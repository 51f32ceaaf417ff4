use std::time::Duration;

/// Socket configuration applied when connecting or binding.
///
/// Unset options keep the operating system defaults.
///
/// # Examples
///
/// ```rust,ignore
/// let options = SocketOptions::new()
///     .nodelay(true)
///     .linger(Some(Duration::ZERO))
///     .read_timeout(Some(Duration::from_secs(1)));
///
/// let channel = TcpChannel::connect_with("127.0.0.1:8080", &options)?;
/// ```
#[derive(Debug, Clone)]
pub struct SocketOptions {
    pub(crate) nodelay: Option<bool>,
    pub(crate) linger: Option<Option<Duration>>,
    pub(crate) read_timeout: Option<Duration>,
    pub(crate) write_timeout: Option<Duration>,
    pub(crate) connect_timeout: Option<Duration>,
    pub(crate) accept_timeout: Option<Duration>,
    pub(crate) nonblocking: bool,
    pub(crate) reuse_address: bool,
    pub(crate) backlog: u32,
}

impl SocketOptions {
    /// Creates the default configuration: blocking, `SO_REUSEADDR` on
    /// listeners, a backlog of 128, no timeouts.
    pub fn new() -> Self {
        Self {
            nodelay: None,
            linger: None,
            read_timeout: None,
            write_timeout: None,
            connect_timeout: None,
            accept_timeout: None,
            nonblocking: false,
            reuse_address: true,
            backlog: 128,
        }
    }

    /// Sets `TCP_NODELAY`.
    pub fn nodelay(mut self, nodelay: bool) -> Self {
        self.nodelay = Some(nodelay);
        self
    }

    /// Sets `SO_LINGER`. `Some(Duration::ZERO)` turns `close` into a
    /// reset-level close.
    pub fn linger(mut self, linger: Option<Duration>) -> Self {
        self.linger = Some(linger);
        self
    }

    /// Bounds blocking reads. An expired read fails with
    /// [`Error::Timeout`](crate::Error::Timeout) and leaves the channel usable.
    pub fn read_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.read_timeout = timeout;
        self
    }

    /// Bounds blocking writes.
    pub fn write_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.write_timeout = timeout;
        self
    }

    /// Bounds the TCP handshake of `connect`.
    pub fn connect_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Bounds blocking `accept` calls.
    pub fn accept_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.accept_timeout = timeout;
        self
    }

    /// Starts the channel in non-blocking mode.
    pub fn nonblocking(mut self, nonblocking: bool) -> Self {
        self.nonblocking = nonblocking;
        self
    }

    /// Enables `SO_REUSEADDR` on listeners.
    pub fn reuse_address(mut self, reuse: bool) -> Self {
        self.reuse_address = reuse;
        self
    }

    /// Sets the listen backlog.
    ///
    /// # Panics
    ///
    /// Panics if `backlog == 0`.
    pub fn backlog(mut self, backlog: u32) -> Self {
        assert!(backlog > 0, "backlog must be > 0");

        self.backlog = backlog;
        self
    }
}

impl Default for SocketOptions {
    fn default() -> Self {
        Self::new()
    }
}
