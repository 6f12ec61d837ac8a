//! `recvmsg`/`sendmsg` on tokio UDP sockets
//!
//! tokio's `UdpSocket` has no API for ancillary data, so the relay drops
//! to raw syscalls for the two operations that need it: reading client
//! datagrams together with their packet info, and writing replies with the
//! cached packet info attached. Readiness comes from tokio (`try_io`), so
//! a `WouldBlock` result re-arms the reactor instead of spinning.

use std::io;
use std::mem;
use std::net::{Ipv4Addr, Ipv6Addr, SocketAddr, SocketAddrV4, SocketAddrV6};
use std::os::unix::io::{AsRawFd, RawFd};

use socket2::SockAddr;
use tokio::io::Interest;
use tokio::net::UdpSocket;

use crate::error::SocketError;

/// A datagram received with ancillary data.
#[derive(Debug)]
pub struct RecvMsg {
    /// Number of payload bytes received
    pub len: usize,
    /// Number of ancillary bytes received
    pub oob_len: usize,
    /// `msg_flags` as reported by the kernel
    pub flags: libc::c_int,
    /// Source address
    pub src: SocketAddr,
}

/// Check receive flags for truncation.
///
/// # Errors
///
/// Returns a recoverable `SocketError` when the datagram (`MSG_TRUNC`) or
/// its control messages (`MSG_CTRUNC`) were cut short; the caller drops
/// the packet.
pub fn parse_flags_for_error(flags: libc::c_int) -> Result<(), SocketError> {
    if flags & libc::MSG_TRUNC != 0 {
        return Err(SocketError::Truncated(
            "datagram truncated (MSG_TRUNC)".into(),
        ));
    }
    if flags & libc::MSG_CTRUNC != 0 {
        return Err(SocketError::Truncated(
            "control messages truncated (MSG_CTRUNC)".into(),
        ));
    }
    Ok(())
}

/// Receive a datagram and its ancillary data.
///
/// # Errors
///
/// Returns the underlying I/O error from `recvmsg`.
pub async fn recv_msg(
    socket: &UdpSocket,
    buf: &mut [u8],
    oob_buf: &mut [u8],
) -> io::Result<RecvMsg> {
    let fd = socket.as_raw_fd();
    loop {
        socket.readable().await?;
        match socket.try_io(Interest::READABLE, || recv_msg_sync(fd, buf, oob_buf)) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            result => return result,
        }
    }
}

/// Send a datagram with ancillary data to `dst`.
///
/// An empty `oob` sends without ancillary data.
///
/// # Errors
///
/// Returns the underlying I/O error from `sendmsg`.
pub async fn send_msg(
    socket: &UdpSocket,
    buf: &[u8],
    oob: &[u8],
    dst: SocketAddr,
) -> io::Result<usize> {
    let fd = socket.as_raw_fd();
    loop {
        socket.writable().await?;
        match socket.try_io(Interest::WRITABLE, || send_msg_sync(fd, buf, oob, dst)) {
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => {}
            result => return result,
        }
    }
}

#[allow(clippy::cast_possible_truncation)] // socklen_t is always u32
#[allow(clippy::cast_sign_loss)] // n is checked nonnegative
fn recv_msg_sync(fd: RawFd, buf: &mut [u8], oob_buf: &mut [u8]) -> io::Result<RecvMsg> {
    let mut iov = libc::iovec {
        iov_base: buf.as_mut_ptr().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut src_addr: libc::sockaddr_storage = unsafe { mem::zeroed() };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = std::ptr::addr_of_mut!(src_addr).cast::<libc::c_void>();
    msg.msg_namelen = mem::size_of::<libc::sockaddr_storage>() as libc::socklen_t;
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    msg.msg_control = oob_buf.as_mut_ptr().cast::<libc::c_void>();
    msg.msg_controllen = oob_buf.len() as _;

    let n = unsafe { libc::recvmsg(fd, &mut msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }

    let src = parse_sockaddr(&src_addr)?;

    Ok(RecvMsg {
        len: n as usize,
        oob_len: msg.msg_controllen as usize,
        flags: msg.msg_flags,
        src,
    })
}

#[allow(clippy::cast_sign_loss)] // n is checked nonnegative
fn send_msg_sync(fd: RawFd, buf: &[u8], oob: &[u8], dst: SocketAddr) -> io::Result<usize> {
    let addr = SockAddr::from(dst);

    let mut iov = libc::iovec {
        iov_base: buf.as_ptr().cast_mut().cast::<libc::c_void>(),
        iov_len: buf.len(),
    };

    let mut msg: libc::msghdr = unsafe { mem::zeroed() };
    msg.msg_name = addr.as_ptr().cast_mut().cast::<libc::c_void>();
    msg.msg_namelen = addr.len();
    msg.msg_iov = std::ptr::addr_of_mut!(iov);
    msg.msg_iovlen = 1;
    if !oob.is_empty() {
        msg.msg_control = oob.as_ptr().cast_mut().cast::<libc::c_void>();
        msg.msg_controllen = oob.len() as _;
    }

    let n = unsafe { libc::sendmsg(fd, &msg, 0) };
    if n < 0 {
        return Err(io::Error::last_os_error());
    }
    Ok(n as usize)
}

/// Convert a kernel-filled `sockaddr_storage` into a `SocketAddr`.
fn parse_sockaddr(storage: &libc::sockaddr_storage) -> io::Result<SocketAddr> {
    match libc::c_int::from(storage.ss_family) {
        libc::AF_INET => {
            // Safety: the kernel wrote a sockaddr_in for AF_INET.
            let addr = unsafe {
                &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in>()
            };
            let ip = Ipv4Addr::from(u32::from_be(addr.sin_addr.s_addr));
            let port = u16::from_be(addr.sin_port);
            Ok(SocketAddr::V4(SocketAddrV4::new(ip, port)))
        }
        libc::AF_INET6 => {
            // Safety: the kernel wrote a sockaddr_in6 for AF_INET6.
            let addr = unsafe {
                &*std::ptr::addr_of!(*storage).cast::<libc::sockaddr_in6>()
            };
            let ip = Ipv6Addr::from(addr.sin6_addr.s6_addr);
            let port = u16::from_be(addr.sin6_port);
            Ok(SocketAddr::V6(SocketAddrV6::new(
                ip,
                port,
                addr.sin6_flowinfo,
                addr.sin6_scope_id,
            )))
        }
        family => Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unexpected address family {family}"),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::socket::{listen_udp, UDP_OOB_BUFFER_SIZE};

    #[test]
    fn test_parse_flags_for_error() {
        assert!(parse_flags_for_error(0).is_ok());
        assert!(parse_flags_for_error(libc::MSG_TRUNC).is_err());
        assert!(parse_flags_for_error(libc::MSG_CTRUNC).is_err());
        assert!(parse_flags_for_error(libc::MSG_TRUNC | libc::MSG_CTRUNC).is_err());
    }

    #[tokio::test]
    async fn test_recv_msg_carries_payload_and_source() {
        let (listener, _) = listen_udp("127.0.0.1:0".parse().unwrap(), true, 0).unwrap();
        let listener = UdpSocket::from_std(listener).unwrap();
        let listen_addr = listener.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        sender.send_to(b"ping", listen_addr).await.unwrap();

        let mut buf = [0u8; 64];
        let mut oob_buf = [0u8; UDP_OOB_BUFFER_SIZE];
        let msg = recv_msg(&listener, &mut buf, &mut oob_buf).await.unwrap();

        assert_eq!(msg.len, 4);
        assert_eq!(&buf[..4], b"ping");
        assert_eq!(msg.src, sender.local_addr().unwrap());
        assert!(parse_flags_for_error(msg.flags).is_ok());
        // IP_PKTINFO was enabled, so ancillary data arrived.
        assert!(msg.oob_len > 0);
    }

    #[tokio::test]
    async fn test_send_msg_without_oob() {
        let receiver = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let receiver_addr = receiver.local_addr().unwrap();

        let sender = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let sent = send_msg(&sender, b"hello", &[], receiver_addr).await.unwrap();
        assert_eq!(sent, 5);

        let mut buf = [0u8; 64];
        let (n, src) = receiver.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"hello");
        assert_eq!(src, sender.local_addr().unwrap());
    }
}
