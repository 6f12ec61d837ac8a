//! UDP socket utilities for swgp-relay
//!
//! This module provides the low-level socket operations the relay is built
//! on:
//!
//! - [`listen_udp`]: bind a UDP socket with the options the relay needs:
//!   packet-info reception (`IP_PKTINFO` / `IPV6_RECVPKTINFO`), dual-stack
//!   acceptance, and an optional firewall mark (`SO_MARK`). Option failures
//!   after the socket exists are reported as a soft error so the caller can
//!   log and continue.
//! - [`recv_msg`] / [`send_msg`]: `recvmsg`/`sendmsg` on a tokio
//!   `UdpSocket`, carrying ancillary (OOB) bytes alongside the datagram.
//! - [`update_oob_cache`]: filter received control messages down to the
//!   packet-info entry and keep it in the form `sendmsg` expects, so a
//!   reply leaves through the same local address the client hit.
//!
//! Address canonicalization lives here too: the listener is dual-stack, so
//! an IPv4 client may appear either as `a.b.c.d` or as `::ffff:a.b.c.d`
//! depending on the socket family. [`canonical_addr`] maps both to the
//! IPv4-in-IPv6 form so they compare and hash equal.

mod listen;
mod msg;
mod oob;

use std::net::{SocketAddr, SocketAddrV6};

pub use listen::listen_udp;
pub use msg::{parse_flags_for_error, recv_msg, send_msg, RecvMsg};
pub use oob::{parse_control_messages, update_oob_cache, ControlMessage};

/// Control message buffer size for the relay's `recvmsg` calls.
///
/// Large enough for an `in6_pktinfo` entry plus slack for classes the
/// filter discards.
pub const UDP_OOB_BUFFER_SIZE: usize = 128;

/// Canonicalize a socket address for use as a session key or comparison.
///
/// IPv4 addresses become their IPv4-in-IPv6 mapped form, so the same
/// client hashes identically whether the kernel reported it through an
/// IPv4 or a dual-stack IPv6 socket.
#[must_use]
pub fn canonical_addr(addr: SocketAddr) -> SocketAddr {
    match addr {
        SocketAddr::V4(v4) => {
            SocketAddr::V6(SocketAddrV6::new(v4.ip().to_ipv6_mapped(), v4.port(), 0, 0))
        }
        SocketAddr::V6(_) => addr,
    }
}

/// Check whether a canonical address belongs to the IPv4 address family.
#[must_use]
pub fn is_ipv4_client(addr: SocketAddr) -> bool {
    match addr {
        SocketAddr::V4(_) => true,
        SocketAddr::V6(v6) => v6.ip().to_ipv4_mapped().is_some(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_canonical_addr_maps_ipv4() {
        let v4: SocketAddr = "10.0.0.1:51820".parse().unwrap();
        let canonical = canonical_addr(v4);
        assert_eq!(canonical, "[::ffff:10.0.0.1]:51820".parse().unwrap());

        // Mapped form is a fixed point.
        assert_eq!(canonical_addr(canonical), canonical);
    }

    #[test]
    fn test_canonical_addr_keeps_ipv6() {
        let v6: SocketAddr = "[2001:db8::1]:51820".parse().unwrap();
        assert_eq!(canonical_addr(v6), v6);
    }

    #[test]
    fn test_canonical_forms_compare_equal() {
        let raw: SocketAddr = "10.0.0.1:51820".parse().unwrap();
        let mapped: SocketAddr = "[::ffff:10.0.0.1]:51820".parse().unwrap();
        assert_eq!(canonical_addr(raw), canonical_addr(mapped));
    }

    #[test]
    fn test_is_ipv4_client() {
        assert!(is_ipv4_client("10.0.0.1:1".parse().unwrap()));
        assert!(is_ipv4_client("[::ffff:10.0.0.1]:1".parse().unwrap()));
        assert!(!is_ipv4_client("[2001:db8::1]:1".parse().unwrap()));
    }
}
