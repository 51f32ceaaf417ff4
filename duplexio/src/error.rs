//! Error types shared by channels, the selector and async completions.
//!
//! Socket failures are reported as explicit variants instead of raw OS
//! codes so callers can branch on [`ErrorKind`] without inspecting
//! `errno`. End-of-stream is *not* an error: it is reported through
//! [`ReadOutcome::EndOfStream`](crate::net::ReadOutcome::EndOfStream).

use std::io;

/// Convenience alias used throughout the crate.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors produced by `duplexio`.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// The write direction is gone: written after a local or peer
    /// shutdown, or any I/O issued after the channel was closed.
    #[error("broken connection")]
    BrokenConnection,

    /// The peer terminated the connection abruptly.
    #[error("connection reset by peer")]
    ConnectionReset,

    /// A bounded wait expired. The underlying operation is unaffected.
    ///
    /// Only the crate's own deadlines produce this variant; `ETIMEDOUT`
    /// from the kernel is not mapped here.
    #[error("operation timed out")]
    Timeout,

    /// The operation was intentionally aborted.
    #[error("operation cancelled")]
    Cancelled,

    /// The acceptor, channel or key was already closed.
    #[error("channel closed")]
    Closed,

    /// A registration was attempted on a closed selector.
    #[error("selector closed")]
    ClosedSelector,

    /// Only non-blocking channels may be registered with a selector.
    #[error("channel must be in non-blocking mode to be registered")]
    IllegalBlockingMode,

    /// Any other operating system error.
    #[error(transparent)]
    Io(io::Error),
}

/// Coarse classification of an [`Error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    BrokenConnection,
    ConnectionReset,
    Timeout,
    Cancelled,
    Closed,
    ClosedSelector,
    IllegalBlockingMode,
    Other,
}

impl Error {
    /// Returns the kind of this error.
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::BrokenConnection => ErrorKind::BrokenConnection,
            Error::ConnectionReset => ErrorKind::ConnectionReset,
            Error::Timeout => ErrorKind::Timeout,
            Error::Cancelled => ErrorKind::Cancelled,
            Error::Closed => ErrorKind::Closed,
            Error::ClosedSelector => ErrorKind::ClosedSelector,
            Error::IllegalBlockingMode => ErrorKind::IllegalBlockingMode,
            Error::Io(_) => ErrorKind::Other,
        }
    }

    /// Returns `true` for errors that mean the transport itself is gone.
    pub fn is_transport(&self) -> bool {
        matches!(self, Error::BrokenConnection | Error::ConnectionReset)
    }

    /// Copies the error so it can be delivered to several waiters.
    /// OS errors keep their kind and message.
    pub(crate) fn duplicate(&self) -> Self {
        match self {
            Error::BrokenConnection => Error::BrokenConnection,
            Error::ConnectionReset => Error::ConnectionReset,
            Error::Timeout => Error::Timeout,
            Error::Cancelled => Error::Cancelled,
            Error::Closed => Error::Closed,
            Error::ClosedSelector => Error::ClosedSelector,
            Error::IllegalBlockingMode => Error::IllegalBlockingMode,
            Error::Io(err) => match err.raw_os_error() {
                Some(code) => Error::Io(io::Error::from_raw_os_error(code)),
                None => Error::Io(io::Error::new(err.kind(), err.to_string())),
            },
        }
    }
}

impl From<io::Error> for Error {
    fn from(err: io::Error) -> Self {
        match err.kind() {
            io::ErrorKind::BrokenPipe | io::ErrorKind::NotConnected => Error::BrokenConnection,
            io::ErrorKind::ConnectionReset | io::ErrorKind::ConnectionAborted => {
                Error::ConnectionReset
            }
            _ => Error::Io(err),
        }
    }
}

impl From<Error> for io::Error {
    fn from(err: Error) -> Self {
        match err {
            Error::Io(err) => err,
            Error::BrokenConnection => io::Error::new(io::ErrorKind::BrokenPipe, err),
            Error::ConnectionReset => io::Error::new(io::ErrorKind::ConnectionReset, err),
            Error::Timeout => io::Error::new(io::ErrorKind::TimedOut, err),
            Error::Cancelled => io::Error::new(io::ErrorKind::Interrupted, err),
            Error::IllegalBlockingMode => io::Error::new(io::ErrorKind::InvalidInput, err),
            Error::Closed | Error::ClosedSelector => io::Error::new(io::ErrorKind::NotConnected, err),
        }
    }
}
