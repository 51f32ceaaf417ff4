//! # duplexio
//!
//! **duplexio** models a TCP connection as what it really is: two
//! independent half-duplex directions that can be shut down separately,
//! plus a final close. It is the transport layer of the **Nebula**
//! ecosystem and sits below the framing and protocol crates.
//!
//! The crate provides:
//!
//! - **Byte channels** with explicit half-close semantics: reading
//!   end-of-stream is an outcome, not a state change, and writing after a
//!   local shutdown is a broken connection
//! - A **shutdown state tracker** shared lock-free between the reader, the
//!   writer and the owner of a connection
//! - A **readiness selector** on epoll (Linux) or kqueue (macOS, FreeBSD)
//!   with registration from any thread and a sticky wake-up
//! - An **async completion bridge** that turns non-blocking accept, read
//!   and write into single-delivery completion handles
//! - **Cancellation tokens** that unblock a blocking accept from any thread
//!
//! ## Quick Start
//!
//! ```rust,ignore
//! use duplexio::net::{ByteChannel, ReadOutcome, TcpAcceptor, TcpChannel};
//!
//! let acceptor = TcpAcceptor::bind("127.0.0.1:0")?;
//! let client = TcpChannel::connect(acceptor.local_addr()?)?;
//! let (server, _) = acceptor.accept()?;
//!
//! client.write_all(b"request")?;
//! client.shutdown_output()?;
//!
//! let mut buf = [0u8; 64];
//! while let ReadOutcome::Data(n) = server.read(&mut buf)? {
//!     println!("received {n} bytes");
//! }
//!
//! // The server can still answer on its open output direction.
//! server.write_all(b"response")?;
//! ```
//!
//! ## Modules
//!
//! - [`net`]: TCP channels, the acceptor and socket options
//! - [`state`]: per-connection shutdown state
//! - [`selector`]: the readiness registry
//! - [`completion`]: async groups and completion handles
//! - [`cancel`]: cancellation tokens
//!
//! ## Getting Started
//!
//! Add duplexio to your `Cargo.toml`:
//!
//! ```toml
//! [dependencies]
//! duplexio = { git = "https://github.com/Nebula-ecosystem/duplexio" }
//! ```

#[cfg(not(unix))]
compile_error!("duplexio only supports unix platforms");

mod error;
mod sys;

pub mod cancel;
pub mod completion;
pub mod net;
pub mod selector;
pub mod state;

pub use cancel::CancelToken;
pub use error::{Error, ErrorKind, Result};
