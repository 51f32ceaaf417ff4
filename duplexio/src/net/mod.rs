//! TCP channels with explicit half-close semantics.
//!
//! This module exposes:
//! - [`ByteChannel`], the contract consumers (framing layers) program
//!   against,
//! - [`TcpChannel`], a connected TCP endpoint tracking its own
//!   [`ShutdownState`](crate::state::ShutdownState),
//! - [`TcpAcceptor`], a listening socket whose blocking accept can be
//!   cancelled with a [`CancelToken`](crate::CancelToken),
//! - [`SocketOptions`], the configuration applied when connecting or
//!   binding.
//!
//! Every socket is non-blocking at the OS level. Blocking mode is
//! provided by waiting in `poll(2)`, which is what makes per-call
//! timeouts and cancellation possible without touching connection state.

mod options;
mod tcp;

pub use options::SocketOptions;
pub use tcp::listener::TcpAcceptor;
pub use tcp::stream::TcpChannel;

use crate::error::{Error, Result};

use std::io::{self, IoSlice};

/// Result of a successful read.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ReadOutcome {
    /// `n` bytes were read. Zero only for an empty buffer or a
    /// non-blocking channel with nothing available.
    Data(usize),

    /// The peer shut down its output. Not an error, and it does not
    /// mark the local input as shut down.
    EndOfStream,
}

impl ReadOutcome {
    pub fn is_eof(self) -> bool {
        matches!(self, ReadOutcome::EndOfStream)
    }

    /// Number of bytes transferred, `None` at end-of-stream.
    pub fn bytes(self) -> Option<usize> {
        match self {
            ReadOutcome::Data(n) => Some(n),
            ReadOutcome::EndOfStream => None,
        }
    }
}

/// A bidirectional byte stream with independently closable directions.
///
/// Implementations are safe to use from one reader thread and one writer
/// thread at the same time.
pub trait ByteChannel {
    /// Reads into `buf`.
    ///
    /// Returns [`ReadOutcome::EndOfStream`] once the peer shut down its
    /// output, and again on every later read. After a local
    /// [`shutdown_input`](Self::shutdown_input) reads report end-of-stream
    /// without touching the socket.
    fn read(&self, buf: &mut [u8]) -> Result<ReadOutcome>;

    /// Writes from `buf`, returning the number of bytes accepted.
    ///
    /// Fails with [`Error::BrokenConnection`] after a local output
    /// shutdown. A write issued shortly after the peer closed may still
    /// succeed; the failure shows up on a later write.
    fn write(&self, buf: &[u8]) -> Result<usize>;

    /// Gathers the slices into one write.
    fn write_vectored(&self, bufs: &[IoSlice<'_>]) -> Result<usize> {
        let buf = bufs.iter().find(|b| !b.is_empty()).map_or(&[][..], |b| &**b);
        self.write(buf)
    }

    /// Writes the entire buffer.
    ///
    /// # Errors
    ///
    /// Returns `WriteZero` if a write reports progress of zero, which
    /// happens on a non-blocking channel whose send buffer is full.
    fn write_all(&self, mut buf: &[u8]) -> Result<()> {
        while !buf.is_empty() {
            let n = self.write(buf)?;

            if n == 0 {
                return Err(Error::Io(io::Error::new(
                    io::ErrorKind::WriteZero,
                    "write returned zero bytes",
                )));
            }

            buf = &buf[n..];
        }

        Ok(())
    }

    fn shutdown_input(&self) -> Result<()>;

    fn shutdown_output(&self) -> Result<()>;

    /// Releases both directions. Idempotent.
    fn close(&self);

    fn is_input_shutdown(&self) -> bool;

    fn is_output_shutdown(&self) -> bool;

    fn is_closed(&self) -> bool;

    fn set_nonblocking(&self, nonblocking: bool) -> Result<()>;

    fn is_blocking(&self) -> bool;
}

/// Copies bytes from `src` to `dst` until `src` reaches end-of-stream.
///
/// Returns the number of bytes copied. Both channels must be in
/// blocking mode. Neither channel is shut down or closed.
pub fn copy<R, W>(src: &R, dst: &W) -> Result<u64>
where
    R: ByteChannel + ?Sized,
    W: ByteChannel + ?Sized,
{
    if !src.is_blocking() || !dst.is_blocking() {
        return Err(Error::IllegalBlockingMode);
    }

    let mut buf = [0u8; 8 * 1024];
    let mut total = 0u64;

    loop {
        match src.read(&mut buf)? {
            ReadOutcome::EndOfStream => return Ok(total),
            ReadOutcome::Data(n) => {
                dst.write_all(&buf[..n])?;
                total += n as u64;
            }
        }
    }
}
