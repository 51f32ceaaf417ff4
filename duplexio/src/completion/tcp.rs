use super::group::{Command, Op, Shared, Source};
use super::{AsyncGroup, Completer, Completion, Transfer, pair};
use crate::error::{Error, Result};
use crate::net::{SocketOptions, TcpAcceptor, TcpChannel};

use std::fmt;
use std::io;
use std::net::{SocketAddr, ToSocketAddrs};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use tracing::debug;

/// A listening socket whose accepts complete on an [`AsyncGroup`].
pub struct AsyncTcpListener {
    id: u64,
    acceptor: Arc<TcpAcceptor>,
    group: Arc<Shared>,
    closed: AtomicBool,
}

impl AsyncTcpListener {
    /// Binds a listener to `addr` and attaches it to `group`.
    pub fn bind<A: ToSocketAddrs>(group: &AsyncGroup, addr: A) -> Result<Self> {
        Self::bind_with(group, addr, &SocketOptions::new())
    }

    /// Binds a listener with explicit options. The listener is always
    /// non-blocking; accepted channels inherit the per-connection options.
    pub fn bind_with<A: ToSocketAddrs>(
        group: &AsyncGroup,
        addr: A,
        options: &SocketOptions,
    ) -> Result<Self> {
        if group.is_shutdown() {
            return Err(Error::Closed);
        }

        let options = options.clone().nonblocking(true);
        let acceptor = Arc::new(TcpAcceptor::bind_with(addr, &options)?);
        let id = group.shared.next_id();

        group.shared.submit(Command::Attach {
            id,
            source: Source::Listener(acceptor.clone()),
        });

        Ok(Self {
            id,
            acceptor,
            group: group.shared.clone(),
            closed: AtomicBool::new(false),
        })
    }

    /// Accepts the next connection.
    ///
    /// Pending accepts are served in submission order.
    pub fn accept(&self) -> Completion<AsyncTcpChannel> {
        let (completer, completion) = pair();

        if self.closed.load(Ordering::Acquire) {
            completer.fail(Error::Closed);
        } else {
            self.group.submit(Command::Submit {
                id: self.id,
                op: Op::Accept(completer),
            });
        }

        completion
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.acceptor.local_addr()
    }

    /// Stops listening. Pending accepts complete with
    /// [`Error::Cancelled`]. Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.group.submit(Command::Detach { id: self.id });
            debug!(id = self.id, "async listener closed");
        }
    }
}

impl Drop for AsyncTcpListener {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AsyncTcpListener {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTcpListener")
            .field("id", &self.id)
            .field("acceptor", &self.acceptor)
            .finish()
    }
}

/// A TCP channel whose reads and writes complete on an [`AsyncGroup`].
///
/// Reads and writes are queued and served in submission order per
/// direction. Buffers are moved into the operation and handed back in
/// the resulting [`Transfer`].
pub struct AsyncTcpChannel {
    id: u64,
    channel: Arc<TcpChannel>,
    group: Arc<Shared>,
    closed: AtomicBool,
}

impl AsyncTcpChannel {
    pub(crate) fn new(id: u64, channel: Arc<TcpChannel>, group: Arc<Shared>) -> Self {
        Self {
            id,
            channel,
            group,
            closed: AtomicBool::new(false),
        }
    }

    /// Connects to `addr` through `group`.
    ///
    /// Only the first resolved address is tried.
    pub fn connect<A: ToSocketAddrs>(group: &AsyncGroup, addr: A) -> Completion<AsyncTcpChannel> {
        let (completer, completion) = pair();

        let started = addr
            .to_socket_addrs()
            .map_err(Error::from)
            .and_then(|mut addrs| {
                addrs.next().ok_or_else(|| {
                    Error::Io(io::Error::new(
                        io::ErrorKind::InvalidInput,
                        "could not resolve to any address",
                    ))
                })
            })
            .and_then(|addr| TcpChannel::begin_connect(&addr))
            .and_then(|(channel, _)| channel.set_nonblocking(true).map(|()| channel));

        match started {
            Ok(channel) => {
                let id = group.shared.next_id();

                group.shared.submit(Command::Attach {
                    id,
                    source: Source::Channel(Arc::new(channel)),
                });
                group.shared.submit(Command::Submit {
                    id,
                    op: Op::Connect(completer),
                });
            }
            Err(err) => {
                completer.fail(err);
            }
        }

        completion
    }

    /// Reads into `buf`.
    ///
    /// The transfer reports the bytes read, or end-of-stream once the
    /// peer shut down its output.
    pub fn read(&self, buf: Vec<u8>) -> Completion<Transfer> {
        self.submit(|completer| Op::Read(buf, completer))
    }

    /// Writes the whole of `buf`.
    pub fn write(&self, buf: Vec<u8>) -> Completion<Transfer> {
        self.submit(|completer| Op::Write(buf, completer))
    }

    fn submit(&self, op: impl FnOnce(Completer<Transfer>) -> Op) -> Completion<Transfer> {
        let (completer, completion) = pair();

        if self.closed.load(Ordering::Acquire) {
            completer.fail(Error::Closed);
        } else {
            self.group.submit(Command::Submit {
                id: self.id,
                op: op(completer),
            });
        }

        completion
    }

    /// Shuts down the read direction. See [`TcpChannel::shutdown_input`].
    pub fn shutdown_input(&self) -> Result<()> {
        self.channel.shutdown_input()
    }

    /// Shuts down the write direction. Writes still queued fail with
    /// [`Error::BrokenConnection`].
    pub fn shutdown_output(&self) -> Result<()> {
        self.channel.shutdown_output()
    }

    pub fn local_addr(&self) -> Result<SocketAddr> {
        self.channel.local_addr()
    }

    pub fn peer_addr(&self) -> Result<SocketAddr> {
        self.channel.peer_addr()
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire) || self.channel.is_closed()
    }

    /// Closes the channel. Pending operations complete with
    /// [`Error::Cancelled`]; new ones fail with [`Error::Closed`].
    /// Idempotent.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.group.submit(Command::Detach { id: self.id });
            debug!(id = self.id, "async channel closed");
        }
    }
}

impl Drop for AsyncTcpChannel {
    fn drop(&mut self) {
        self.close();
    }
}

impl fmt::Debug for AsyncTcpChannel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("AsyncTcpChannel")
            .field("id", &self.id)
            .field("channel", &self.channel)
            .finish()
    }
}
