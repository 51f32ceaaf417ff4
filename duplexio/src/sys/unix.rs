use libc::{
    AF_INET, AF_INET6, F_GETFD, F_GETFL, F_SETFD, F_SETFL, FD_CLOEXEC, IPPROTO_IPV6, IPPROTO_TCP,
    IPV6_V6ONLY, O_NONBLOCK, POLLIN, POLLNVAL, SHUT_RD, SHUT_RDWR, SHUT_WR, SO_ERROR, SO_LINGER,
    SO_REUSEADDR, SOCK_STREAM, SOL_SOCKET, TCP_NODELAY, c_int, c_short, c_void, linger, pollfd,
    sockaddr, sockaddr_in, sockaddr_in6, sockaddr_storage, socklen_t,
};
use std::io::{self, IoSlice};
use std::net::{Ipv4Addr, Ipv6Addr, Shutdown, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::fd::RawFd;
use std::time::{Duration, Instant};
use std::{cmp, mem};

/// Flags passed to every `send(2)` so a closed peer yields `EPIPE`
/// instead of raising `SIGPIPE`.
#[cfg(any(target_os = "linux", target_os = "android", target_os = "freebsd"))]
const SEND_FLAGS: c_int = libc::MSG_NOSIGNAL;

#[cfg(not(any(target_os = "linux", target_os = "android", target_os = "freebsd")))]
const SEND_FLAGS: c_int = 0;

/// Upper bound on the number of slices handed to a single `sendmsg(2)`.
const MAX_IOV: usize = 1024;

/// Receives from a socket into the given buffer.
///
/// Returns the number of bytes read, `0` at end-of-stream, or a negative
/// value on error.
pub(crate) fn sys_recv(fd: RawFd, buffer: &mut [u8]) -> isize {
    unsafe { libc::recv(fd, buffer.as_mut_ptr() as *mut c_void, buffer.len(), 0) }
}

/// Sends the buffer on a socket without raising `SIGPIPE`.
///
/// Returns the number of bytes written, or a negative value on error.
pub(crate) fn sys_send(fd: RawFd, buffer: &[u8]) -> isize {
    unsafe { libc::send(fd, buffer.as_ptr() as *const c_void, buffer.len(), SEND_FLAGS) }
}

/// Gathers the slices into a single `sendmsg(2)` call.
pub(crate) fn sys_send_vectored(fd: RawFd, buffers: &[IoSlice<'_>]) -> isize {
    let mut msg: libc::msghdr = unsafe { mem::zeroed() };

    // `IoSlice` is guaranteed to be ABI compatible with `iovec` on unix.
    msg.msg_iov = buffers.as_ptr() as *mut libc::iovec;
    msg.msg_iovlen = cmp::min(buffers.len(), MAX_IOV) as _;

    unsafe { libc::sendmsg(fd, &msg, SEND_FLAGS) }
}

/// Closes a file descriptor.
pub(crate) fn sys_close(fd: RawFd) {
    unsafe { libc::close(fd) };
}

/// Switches a file descriptor between blocking and non-blocking mode.
pub(crate) fn sys_set_nonblocking(fd: RawFd, nonblocking: bool) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, F_GETFL) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let flags = if nonblocking {
        flags | O_NONBLOCK
    } else {
        flags & !O_NONBLOCK
    };

    let rc = unsafe { libc::fcntl(fd, F_SETFL, flags) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Marks a file descriptor close-on-exec.
pub(crate) fn sys_set_cloexec(fd: RawFd) -> io::Result<()> {
    let flags = unsafe { libc::fcntl(fd, F_GETFD) };
    if flags < 0 {
        return Err(io::Error::last_os_error());
    }

    let rc = unsafe { libc::fcntl(fd, F_SETFD, flags | FD_CLOEXEC) };
    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    Ok(())
}

/// Applies the descriptor flags every socket owned by the crate carries:
/// close-on-exec, non-blocking, and no `SIGPIPE` where `send` cannot
/// suppress it.
fn prepare_socket(fd: RawFd) -> io::Result<()> {
    sys_set_cloexec(fd)?;
    sys_set_nonblocking(fd, true)?;

    #[cfg(any(target_os = "macos", target_os = "ios"))]
    sys_setsockopt(fd, SOL_SOCKET, libc::SO_NOSIGPIPE, 1 as c_int)?;

    Ok(())
}

/// Creates a non-blocking stream socket.
pub(crate) fn sys_socket(domain: c_int) -> io::Result<RawFd> {
    let fd = unsafe { libc::socket(domain, SOCK_STREAM, 0) };
    if fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = prepare_socket(fd) {
        sys_close(fd);
        return Err(e);
    }

    Ok(fd)
}

/// Binds a socket to an address.
pub(crate) fn sys_bind(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { libc::bind(fd, &storage as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Marks a socket as a listening socket.
pub(crate) fn sys_listen(fd: RawFd, backlog: u32) -> io::Result<()> {
    let backlog = cmp::min(backlog, c_int::MAX as u32) as c_int;

    let rc = unsafe { libc::listen(fd, backlog) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Accepts a new incoming connection.
///
/// The returned client socket carries the same descriptor flags as
/// sockets created by [`sys_socket`].
pub(crate) fn sys_accept(fd: RawFd) -> io::Result<(RawFd, SocketAddr)> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let client_fd = unsafe { libc::accept(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if client_fd < 0 {
        return Err(io::Error::last_os_error());
    }

    if let Err(e) = prepare_socket(client_fd) {
        sys_close(client_fd);
        return Err(e);
    }

    match sockaddr_storage_to_socketaddr(&storage) {
        Ok(addr) => Ok((client_fd, addr)),
        Err(e) => {
            sys_close(client_fd);
            Err(e)
        }
    }
}

/// Returns the local address of a socket.
pub(crate) fn sys_sockname(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { libc::getsockname(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        sockaddr_storage_to_socketaddr(&storage)
    }
}

/// Returns the remote address of a connected socket.
pub(crate) fn sys_peername(fd: RawFd) -> io::Result<SocketAddr> {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };
    let mut len = mem::size_of::<sockaddr_storage>() as socklen_t;

    let rc = unsafe { libc::getpeername(fd, &mut storage as *mut _ as *mut sockaddr, &mut len) };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        sockaddr_storage_to_socketaddr(&storage)
    }
}

/// Initiates a non-blocking connection.
pub(crate) fn sys_connect(fd: RawFd, addr: &SocketAddr) -> io::Result<()> {
    let (storage, len) = socketaddr_to_storage(addr);

    let rc = unsafe { libc::connect(fd, &storage as *const _ as *const sockaddr, len) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

/// Returns `true` for the errors a non-blocking `connect(2)` reports
/// while the handshake is still running.
pub(crate) fn connect_in_progress(err: &io::Error) -> bool {
    err.kind() == io::ErrorKind::WouldBlock
        || err.raw_os_error() == Some(libc::EINPROGRESS)
        || err.raw_os_error() == Some(libc::EALREADY)
}

/// Reads and clears the pending `SO_ERROR` of a socket.
pub(crate) fn sys_get_socket_error(fd: RawFd) -> io::Result<()> {
    let mut value: c_int = 0;
    let mut len = mem::size_of::<c_int>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            SOL_SOCKET,
            SO_ERROR,
            &mut value as *mut _ as *mut c_void,
            &mut len,
        )
    };

    if rc < 0 {
        return Err(io::Error::last_os_error());
    }

    if value != 0 {
        return Err(io::Error::from_raw_os_error(value));
    }

    Ok(())
}

/// Shuts down a socket.
pub(crate) fn sys_shutdown(fd: RawFd, how: Shutdown) -> io::Result<()> {
    let how = match how {
        Shutdown::Read => SHUT_RD,
        Shutdown::Write => SHUT_WR,
        Shutdown::Both => SHUT_RDWR,
    };

    let rc = unsafe { libc::shutdown(fd, how) };
    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sys_setsockopt<T>(fd: RawFd, level: c_int, name: c_int, value: T) -> io::Result<()> {
    let rc = unsafe {
        libc::setsockopt(
            fd,
            level,
            name,
            &value as *const T as *const c_void,
            mem::size_of::<T>() as socklen_t,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

fn sys_getsockopt<T: Copy>(fd: RawFd, level: c_int, name: c_int, mut value: T) -> io::Result<T> {
    let mut len = mem::size_of::<T>() as socklen_t;

    let rc = unsafe {
        libc::getsockopt(
            fd,
            level,
            name,
            &mut value as *mut T as *mut c_void,
            &mut len,
        )
    };

    if rc < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(value)
    }
}

/// Enables `SO_REUSEADDR` on a socket.
pub(crate) fn sys_set_reuseaddr(fd: RawFd) -> io::Result<()> {
    sys_setsockopt(fd, SOL_SOCKET, SO_REUSEADDR, 1 as c_int)
}

/// Sets `TCP_NODELAY`.
pub(crate) fn sys_set_nodelay(fd: RawFd, nodelay: bool) -> io::Result<()> {
    sys_setsockopt(fd, IPPROTO_TCP, TCP_NODELAY, nodelay as c_int)
}

/// Reads `TCP_NODELAY`.
pub(crate) fn sys_nodelay(fd: RawFd) -> io::Result<bool> {
    sys_getsockopt(fd, IPPROTO_TCP, TCP_NODELAY, 0 as c_int).map(|v| v != 0)
}

/// Sets `SO_LINGER`.
///
/// `Some(Duration::ZERO)` makes `close(2)` discard unsent data and send
/// a reset to the peer.
pub(crate) fn sys_set_linger(fd: RawFd, value: Option<Duration>) -> io::Result<()> {
    let value = linger {
        l_onoff: value.is_some() as c_int,
        l_linger: value.map_or(0, |d| cmp::min(d.as_secs(), c_int::MAX as u64) as c_int),
    };

    sys_setsockopt(fd, SOL_SOCKET, SO_LINGER, value)
}

/// Reads `SO_LINGER`.
pub(crate) fn sys_linger(fd: RawFd) -> io::Result<Option<Duration>> {
    let value = sys_getsockopt(
        fd,
        SOL_SOCKET,
        SO_LINGER,
        linger {
            l_onoff: 0,
            l_linger: 0,
        },
    )?;

    Ok((value.l_onoff != 0).then(|| Duration::from_secs(value.l_linger as u64)))
}

/// Outcome of [`sys_wait`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Wait {
    /// The descriptor reported the requested readiness (or an error).
    Ready,
    /// The wake descriptor fired first.
    Woken,
    /// The deadline passed.
    TimedOut,
}

/// Blocks until `fd` reports `events`, `wake` becomes readable, or the
/// deadline passes.
///
/// Error and hang-up conditions count as ready: the following syscall
/// reports them.
pub(crate) fn sys_wait(
    fd: RawFd,
    events: c_short,
    wake: Option<RawFd>,
    deadline: Option<Instant>,
) -> io::Result<Wait> {
    loop {
        let timeout = match deadline {
            Some(deadline) => {
                let now = Instant::now();
                if now >= deadline {
                    return Ok(Wait::TimedOut);
                }
                Some(deadline - now)
            }
            None => None,
        };

        let mut fds = [
            pollfd {
                fd,
                events,
                revents: 0,
            },
            pollfd {
                fd: wake.unwrap_or(-1),
                events: POLLIN,
                revents: 0,
            },
        ];

        let rc = unsafe { libc::poll(fds.as_mut_ptr(), fds.len() as libc::nfds_t, timeout_ms(timeout)) };

        if rc < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::Interrupted {
                continue;
            }
            return Err(err);
        }

        if rc == 0 {
            continue;
        }

        if fds[1].revents != 0 {
            return Ok(Wait::Woken);
        }

        if fds[0].revents & POLLNVAL != 0 {
            return Err(io::Error::from_raw_os_error(libc::EBADF));
        }

        if fds[0].revents != 0 {
            return Ok(Wait::Ready);
        }
    }
}

/// Converts an optional timeout to the millisecond argument of
/// `poll(2)` / `epoll_wait(2)`, rounding up so that a sub-millisecond
/// timeout never turns into a busy loop.
pub(crate) fn timeout_ms(timeout: Option<Duration>) -> c_int {
    match timeout {
        None => -1,
        Some(d) => {
            let mut ms = d.as_millis();
            if Duration::from_millis(ms as u64) < d {
                ms += 1;
            }
            cmp::min(ms, c_int::MAX as u128) as c_int
        }
    }
}

/// Returns the socket domain matching an address family.
pub(crate) fn domain_of(addr: &SocketAddr) -> c_int {
    match addr {
        SocketAddr::V4(_) => AF_INET,
        SocketAddr::V6(_) => AF_INET6,
    }
}

/// Converts a `sockaddr_storage` to a Rust `SocketAddr`.
pub(crate) fn sockaddr_storage_to_socketaddr(storage: &sockaddr_storage) -> io::Result<SocketAddr> {
    match storage.ss_family as c_int {
        AF_INET => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in) };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);

            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }

        AF_INET6 => {
            let addr = unsafe { &*(storage as *const _ as *const sockaddr_in6) };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);

            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }

        _ => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "unsupported address family",
        )),
    }
}

/// Converts a `SocketAddr` to a `sockaddr_storage`.
pub(crate) fn socketaddr_to_storage(addr: &SocketAddr) -> (sockaddr_storage, socklen_t) {
    let mut storage: sockaddr_storage = unsafe { mem::zeroed() };

    match addr {
        SocketAddr::V4(v4) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in) };
            sa.sin_family = AF_INET as _;
            sa.sin_port = v4.port().to_be();
            sa.sin_addr.s_addr = u32::from(*v4.ip()).to_be();

            (storage, mem::size_of::<sockaddr_in>() as socklen_t)
        }

        SocketAddr::V6(v6) => {
            let sa = unsafe { &mut *(&mut storage as *mut _ as *mut sockaddr_in6) };
            sa.sin6_family = AF_INET6 as _;
            sa.sin6_port = v6.port().to_be();
            sa.sin6_addr.s6_addr = v6.ip().octets();
            sa.sin6_flowinfo = v6.flowinfo();
            sa.sin6_scope_id = v6.scope_id();

            (storage, mem::size_of::<sockaddr_in6>() as socklen_t)
        }
    }
}

/// Enables IPv6 dual-stack support when required.
pub(crate) fn sys_ipv6_is_necessary(fd: RawFd, domain: c_int) -> io::Result<()> {
    if domain == AF_INET6 {
        sys_setsockopt(fd, IPPROTO_IPV6, IPV6_V6ONLY, 0 as c_int)?;
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_timeout_ms_rounds_up() {
        assert_eq!(timeout_ms(None), -1);
        assert_eq!(timeout_ms(Some(Duration::ZERO)), 0);
        assert_eq!(timeout_ms(Some(Duration::from_micros(10))), 1);
        assert_eq!(timeout_ms(Some(Duration::from_millis(250))), 250);
    }

    #[test]
    fn test_sockaddr_conversion_keeps_port_and_ip() {
        let addr: SocketAddr = "127.0.0.1:4242".parse().unwrap();
        let (storage, _) = socketaddr_to_storage(&addr);
        assert_eq!(sockaddr_storage_to_socketaddr(&storage).unwrap(), addr);

        let addr: SocketAddr = "[::1]:8080".parse().unwrap();
        let (storage, _) = socketaddr_to_storage(&addr);
        assert_eq!(sockaddr_storage_to_socketaddr(&storage).unwrap(), addr);
    }
}
