//! Platform-specific socket calls and readiness pollers.
//!
//! This module provides a unified interface over the operating system:
//! - raw socket syscalls used by the channels ([`unix`]),
//! - a wake-up descriptor used for cross-thread interruption ([`WakeFd`]),
//! - the readiness poller backing the selector (`epoll` on Linux,
//!   `kqueue` on macOS and FreeBSD).
//!
//! The concrete poller is selected at compile time depending on the
//! target operating system.

pub(crate) mod common;

pub(crate) use common::{Event, Filter, WakeFd};

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
mod kqueue;

#[cfg(any(target_os = "linux", target_os = "android"))]
mod epoll;

#[cfg(any(target_os = "macos", target_os = "ios", target_os = "freebsd"))]
pub(crate) type Poller = kqueue::KqueuePoller;

#[cfg(any(target_os = "linux", target_os = "android"))]
pub(crate) type Poller = epoll::EpollPoller;

#[cfg(unix)]
pub(crate) mod unix;

#[cfg(unix)]
pub(crate) use unix as platform;
