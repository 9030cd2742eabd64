//! IPv4/IPv6 accept sockets.
//!
//! Built directly on `libc` rather than a socket-builder crate: `SO_REUSEADDR`
//! and `IPV6_V6ONLY` must be set between `socket()` and `bind()`, which
//! `std::net::TcpListener::bind` does not expose, so the raw fd is managed
//! by hand and handed to `TcpListener::from_raw_fd` once listening.

use std::io;
use std::mem;
use std::net::{SocketAddr, TcpListener};
use std::os::unix::io::{FromRawFd, RawFd};

use log::info;

use crate::config::Config;
use crate::error::{DaemonError, Result};

const BACKLOG: i32 = 5;

/// The daemon's listening sockets: zero, one, or two of them depending on
/// which families `Config` enables.
pub struct Listener {
    pub v4: Option<TcpListener>,
    pub v6: Option<TcpListener>,
}

impl Listener {
    pub fn bind(config: &Config) -> Result<Self> {
        let v4 = if config.ipv4_enabled {
            Some(bind_v4(config.port)?)
        } else {
            None
        };

        let v6 = if config.ipv6_enabled {
            Some(bind_v6(config.port)?)
        } else {
            None
        };

        Ok(Listener { v4, v6 })
    }

    /// Accepts one pending connection, setting the accepted socket
    /// non-blocking before handing it back.
    pub fn accept(listener: &TcpListener) -> io::Result<(std::net::TcpStream, SocketAddr)> {
        let (stream, peer) = listener.accept()?;
        stream.set_nonblocking(true)?;
        Ok((stream, peer))
    }
}

fn bind_v4(port: u16) -> Result<TcpListener> {
    unsafe {
        let fd = checked_socket(libc::socket(libc::AF_INET, libc::SOCK_STREAM, 0))?;
        set_reuseaddr(fd)?;
        set_nonblocking(fd)?;

        let mut addr: libc::sockaddr_in = mem::zeroed();
        addr.sin_family = libc::AF_INET as libc::sa_family_t;
        addr.sin_port = port.to_be();
        addr.sin_addr.s_addr = libc::INADDR_ANY.to_be();

        let addr_ptr = &addr as *const libc::sockaddr_in as *const libc::sockaddr;
        checked_cfg(
            libc::bind(fd, addr_ptr, mem::size_of::<libc::sockaddr_in>() as u32),
            "bind IPv4 socket",
        )?;
        checked_cfg(libc::listen(fd, BACKLOG), "listen on IPv4 socket")?;

        finish(fd, "IPv4")
    }
}

fn bind_v6(port: u16) -> Result<TcpListener> {
    unsafe {
        let fd = checked_socket(libc::socket(libc::AF_INET6, libc::SOCK_STREAM, 0))?;
        set_reuseaddr(fd)?;
        let v6only: libc::c_int = 1;
        checked_cfg(
            libc::setsockopt(
                fd,
                libc::IPPROTO_IPV6,
                libc::IPV6_V6ONLY,
                &v6only as *const _ as *const libc::c_void,
                mem::size_of::<libc::c_int>() as u32,
            ),
            "set IPV6_V6ONLY",
        )?;
        set_nonblocking(fd)?;

        let mut addr: libc::sockaddr_in6 = mem::zeroed();
        addr.sin6_family = libc::AF_INET6 as libc::sa_family_t;
        addr.sin6_port = port.to_be();
        addr.sin6_addr = libc::in6_addr { s6_addr: [0u8; 16] };

        let addr_ptr = &addr as *const libc::sockaddr_in6 as *const libc::sockaddr;
        checked_cfg(
            libc::bind(fd, addr_ptr, mem::size_of::<libc::sockaddr_in6>() as u32),
            "bind IPv6 socket",
        )?;
        checked_cfg(libc::listen(fd, BACKLOG), "listen on IPv6 socket")?;

        finish(fd, "IPv6")
    }
}

unsafe fn set_reuseaddr(fd: RawFd) -> Result<()> {
    let one: libc::c_int = 1;
    checked_cfg(
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const libc::c_void,
            mem::size_of::<libc::c_int>() as u32,
        ),
        "set SO_REUSEADDR",
    )?;
    Ok(())
}

unsafe fn set_nonblocking(fd: RawFd) -> Result<()> {
    let flags = checked_cfg(libc::fcntl(fd, libc::F_GETFL, 0), "fcntl F_GETFL")?;
    checked_cfg(
        libc::fcntl(fd, libc::F_SETFL, flags | libc::O_NONBLOCK),
        "fcntl F_SETFL O_NONBLOCK",
    )?;
    Ok(())
}

/// `socket()` creation failures are reported like the original's own
/// socket-creation checks: a runtime/resource error distinct from a usage
/// mistake, mapped to the network error class.
fn checked_socket(rc: libc::c_int) -> Result<libc::c_int> {
    if rc < 0 {
        Err(DaemonError::Network(io::Error::last_os_error()))
    } else {
        Ok(rc)
    }
}

/// `setsockopt`/`bind`/`listen`/`fcntl` failures during listener setup are
/// configuration-class errors, matching the original's `exit_status = 1`
/// for bind/listen/setnonblocking failures.
fn checked_cfg(rc: libc::c_int, what: &str) -> Result<libc::c_int> {
    if rc < 0 {
        Err(DaemonError::Configuration(format!(
            "{what}: {}",
            io::Error::last_os_error()
        )))
    } else {
        Ok(rc)
    }
}

unsafe fn finish(fd: RawFd, family: &str) -> Result<TcpListener> {
    let listener = TcpListener::from_raw_fd(fd);
    info!("listening on {family} port via fd {fd}: {}", listener.local_addr()?);
    Ok(listener)
}
