//! UDP listen primitive
//!
//! Binds the relay's sockets with the options the forwarding pipeline
//! relies on. Server-side listeners receive packet info (the destination
//! address and interface of each datagram) as ancillary data; per-session
//! upstream sockets only need the optional firewall mark.
//!
//! Failures to set an option on an otherwise working socket are returned
//! as a soft error alongside the socket instead of aborting the bind.

use std::io;
use std::mem;
use std::net::SocketAddr;
use std::os::unix::io::AsRawFd;

use socket2::{Domain, Protocol, Socket, Type};
use tracing::debug;

use crate::error::SocketError;

/// Linux kernel constant: `IP_PKTINFO` (`SOL_IP` level).
/// Enables `in_pktinfo` control messages on received IPv4 datagrams; the
/// same class selects the source address on send.
pub const IP_PKTINFO: libc::c_int = 8;

/// Linux kernel constant: `IPV6_RECVPKTINFO` (`SOL_IPV6` level).
/// Enables `in6_pktinfo` control messages on received IPv6 datagrams.
pub const IPV6_RECVPKTINFO: libc::c_int = 49;

/// Linux kernel constant: `IPV6_PKTINFO` (`SOL_IPV6` level).
/// The control message class delivered by `IPV6_RECVPKTINFO` and consumed
/// on send.
pub const IPV6_PKTINFO: libc::c_int = 50;

/// Bind a UDP socket for the relay.
///
/// When `is_server` is true the socket is prepared as a client-facing
/// listener: packet-info reception is enabled and an IPv6 bind accepts
/// IPv4 traffic as well (dual-stack). A nonzero `fwmark` is applied with
/// `SO_MARK`.
///
/// Returns the bound socket in nonblocking mode, plus the first soft
/// (non-fatal) socket-option error, if any, for the caller to log.
///
/// # Errors
///
/// Returns `SocketError` if socket creation or binding fails.
pub fn listen_udp(
    addr: SocketAddr,
    is_server: bool,
    fwmark: u32,
) -> Result<(std::net::UdpSocket, Option<SocketError>), SocketError> {
    let socket = Socket::new(Domain::for_address(addr), Type::DGRAM, Some(Protocol::UDP))
        .map_err(|e| SocketError::SocketCreation(e.to_string()))?;

    let mut soft_err: Option<SocketError> = None;
    let mut soft = |err: SocketError| {
        if soft_err.is_none() {
            soft_err = Some(err);
        }
    };

    if addr.is_ipv6() {
        // Dual-stack: accept IPv4 clients as IPv4-in-IPv6.
        if let Err(e) = socket.set_only_v6(false) {
            soft(SocketError::socket_option("IPV6_V6ONLY", e.to_string()));
        }
    }

    if is_server {
        if addr.is_ipv6() {
            if let Err(e) = set_int_option(&socket, libc::SOL_IPV6, IPV6_RECVPKTINFO, 1) {
                soft(SocketError::socket_option("IPV6_RECVPKTINFO", e.to_string()));
            }
        }
        // IPv4 listeners need IP_PKTINFO directly; dual-stack listeners
        // set it too so mapped IPv4 traffic reports packet info.
        if let Err(e) = set_int_option(&socket, libc::SOL_IP, IP_PKTINFO, 1) {
            soft(SocketError::socket_option("IP_PKTINFO", e.to_string()));
        }
    }

    if fwmark != 0 {
        if let Err(e) = set_fwmark(&socket, fwmark) {
            soft(e);
        }
    }

    socket
        .set_nonblocking(true)
        .map_err(|e| SocketError::socket_option("O_NONBLOCK", e.to_string()))?;

    socket
        .bind(&addr.into())
        .map_err(|e| SocketError::bind(addr, e.to_string()))?;

    debug!(
        %addr,
        is_server,
        fwmark,
        "Bound UDP socket"
    );

    Ok((socket.into(), soft_err))
}

/// Set an integer socket option via raw `setsockopt`.
fn set_int_option(
    socket: &Socket,
    level: libc::c_int,
    option: libc::c_int,
    value: libc::c_int,
) -> io::Result<()> {
    let fd = socket.as_raw_fd();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            level,
            option,
            std::ptr::addr_of!(value).cast::<libc::c_void>(),
            mem::size_of::<libc::c_int>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(())
}

/// Set `SO_MARK` for policy routing.
fn set_fwmark(socket: &Socket, mark: u32) -> Result<(), SocketError> {
    let fd = socket.as_raw_fd();

    let ret = unsafe {
        libc::setsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_MARK,
            std::ptr::addr_of!(mark).cast::<libc::c_void>(),
            mem::size_of::<u32>() as libc::socklen_t,
        )
    };

    if ret != 0 {
        let err = io::Error::last_os_error();
        return Err(SocketError::socket_option(
            "SO_MARK",
            format!("Failed to set fwmark {mark}: {err}"),
        ));
    }

    debug!("Set fwmark: {}", mark);
    Ok(())
}
