//! TCP networking implementation.
//!
//! It is split into:
//! - [`listener`]: accepting incoming TCP connections,
//! - [`stream`]: connected TCP channels with half-close tracking.

pub mod listener;
pub mod stream;

use crate::error::{Error, Result};

use std::io;
use std::net::{SocketAddr, ToSocketAddrs};

/// Runs `f` for each resolved address until one succeeds.
pub(crate) fn each_addr<A, T>(addr: A, mut f: impl FnMut(&SocketAddr) -> Result<T>) -> Result<T>
where
    A: ToSocketAddrs,
{
    let mut last = None;

    for addr in addr.to_socket_addrs()? {
        match f(&addr) {
            Ok(value) => return Ok(value),
            Err(err) => last = Some(err),
        }
    }

    Err(last.unwrap_or_else(|| {
        Error::Io(io::Error::new(
            io::ErrorKind::InvalidInput,
            "could not resolve to any address",
        ))
    }))
}
