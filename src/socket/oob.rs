//! Control-message parsing and the per-session OOB cache
//!
//! Each datagram read from the listener arrives with ancillary (OOB)
//! bytes. The only class the relay cares about is packet info, the local
//! address and interface the datagram arrived on. [`update_oob_cache`]
//! extracts that entry, rewrites it into the form `sendmsg` consumes for
//! source selection, and stores it as the session's cache; replies sent
//! with the cached bytes leave through the same local address the client
//! hit. Every other control-message class is discarded.

use std::mem;

use crate::error::SocketError;

use super::listen::{IPV6_PKTINFO, IP_PKTINFO};

/// Control message header size
const CMSG_HDR_LEN: usize = mem::size_of::<libc::cmsghdr>();

/// Align a control message length the way the kernel does.
const fn cmsg_align(len: usize) -> usize {
    (len + mem::size_of::<libc::c_long>() - 1) & !(mem::size_of::<libc::c_long>() - 1)
}

/// A single parsed control message, borrowing its data from the OOB buffer.
#[derive(Debug, Clone, Copy)]
pub struct ControlMessage<'a> {
    /// Originating protocol level (`SOL_IP`, `SOL_IPV6`, ...)
    pub level: libc::c_int,
    /// Message type within the level
    pub cmsg_type: libc::c_int,
    /// Message payload
    pub data: &'a [u8],
}

/// Parse a raw OOB buffer into its control messages.
///
/// # Errors
///
/// Returns a recoverable `SocketError` if a header's length field is
/// inconsistent with the buffer.
pub fn parse_control_messages(oob: &[u8]) -> Result<Vec<ControlMessage<'_>>, SocketError> {
    let mut messages = Vec::new();
    let mut offset = 0;

    while offset + CMSG_HDR_LEN <= oob.len() {
        // Safety: the region is at least CMSG_HDR_LEN bytes; the read is
        // unaligned-safe.
        let hdr: libc::cmsghdr =
            unsafe { std::ptr::read_unaligned(oob[offset..].as_ptr().cast()) };

        #[allow(clippy::unnecessary_cast)] // cmsg_len is usize or u32 by target
        let cmsg_len = hdr.cmsg_len as usize;
        if cmsg_len < CMSG_HDR_LEN || offset + cmsg_len > oob.len() {
            return Err(SocketError::ControlMessage(format!(
                "cmsg_len {cmsg_len} inconsistent with buffer of {} bytes at offset {offset}",
                oob.len()
            )));
        }

        messages.push(ControlMessage {
            level: hdr.cmsg_level,
            cmsg_type: hdr.cmsg_type,
            data: &oob[offset + CMSG_HDR_LEN..offset + cmsg_len],
        });

        offset += cmsg_align(cmsg_len);
    }

    Ok(messages)
}

/// Serialize a single control message into a buffer `sendmsg` accepts.
fn encode_control_message(level: libc::c_int, cmsg_type: libc::c_int, data: &[u8]) -> Vec<u8> {
    let cmsg_len = CMSG_HDR_LEN + data.len();
    let mut buf = vec![0u8; cmsg_align(cmsg_len)];

    let mut hdr: libc::cmsghdr = unsafe { mem::zeroed() };
    #[allow(clippy::unnecessary_cast)]
    {
        hdr.cmsg_len = cmsg_len as _;
    }
    hdr.cmsg_level = level;
    hdr.cmsg_type = cmsg_type;
    // Safety: buf is at least CMSG_HDR_LEN bytes.
    unsafe { std::ptr::write_unaligned(buf.as_mut_ptr().cast(), hdr) };
    buf[CMSG_HDR_LEN..cmsg_len].copy_from_slice(data);

    buf
}

/// Update a session's OOB cache from freshly received ancillary bytes.
///
/// Retains only packet-info entries (`IP_PKTINFO` / `IPV6_PKTINFO`),
/// rewritten for sending. If `oob` carries no such entry, the cache is
/// left unchanged.
///
/// # Errors
///
/// Returns a recoverable `SocketError` if the OOB buffer is malformed;
/// the cache is left unchanged.
pub fn update_oob_cache(cache: &mut Vec<u8>, oob: &[u8]) -> Result<(), SocketError> {
    for cmsg in parse_control_messages(oob)? {
        match (cmsg.level, cmsg.cmsg_type) {
            (libc::SOL_IP, IP_PKTINFO)
                if cmsg.data.len() >= mem::size_of::<libc::in_pktinfo>() =>
            {
                // Safety: length checked; unaligned-safe read.
                let mut info: libc::in_pktinfo =
                    unsafe { std::ptr::read_unaligned(cmsg.data.as_ptr().cast()) };
                // On send the kernel selects the source from ipi_spec_dst;
                // the destination the client hit arrived in ipi_addr.
                info.ipi_spec_dst = info.ipi_addr;
                let bytes = unsafe {
                    std::slice::from_raw_parts(
                        std::ptr::addr_of!(info).cast::<u8>(),
                        mem::size_of::<libc::in_pktinfo>(),
                    )
                };
                *cache = encode_control_message(libc::SOL_IP, IP_PKTINFO, bytes);
                return Ok(());
            }
            (libc::SOL_IPV6, IPV6_PKTINFO)
                if cmsg.data.len() >= mem::size_of::<libc::in6_pktinfo>() =>
            {
                // in6_pktinfo is symmetric: ipi6_addr is the source on send.
                *cache = encode_control_message(
                    libc::SOL_IPV6,
                    IPV6_PKTINFO,
                    &cmsg.data[..mem::size_of::<libc::in6_pktinfo>()],
                );
                return Ok(());
            }
            _ => {} // unknown classes are discarded
        }
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn v4_pktinfo_oob(ifindex: i32, addr: [u8; 4], spec_dst: [u8; 4]) -> Vec<u8> {
        let mut info: libc::in_pktinfo = unsafe { mem::zeroed() };
        info.ipi_ifindex = ifindex;
        info.ipi_addr.s_addr = u32::from_be_bytes(addr).to_be();
        info.ipi_spec_dst.s_addr = u32::from_be_bytes(spec_dst).to_be();
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(info).cast::<u8>(),
                mem::size_of::<libc::in_pktinfo>(),
            )
        };
        encode_control_message(libc::SOL_IP, IP_PKTINFO, bytes)
    }

    fn parse_v4_pktinfo(data: &[u8]) -> libc::in_pktinfo {
        assert!(data.len() >= mem::size_of::<libc::in_pktinfo>());
        unsafe { std::ptr::read_unaligned(data.as_ptr().cast()) }
    }

    #[test]
    fn test_empty_oob_keeps_cache() {
        let mut cache = vec![1, 2, 3];
        update_oob_cache(&mut cache, &[]).unwrap();
        assert_eq!(cache, vec![1, 2, 3]);
    }

    #[test]
    fn test_v4_pktinfo_cached_with_spec_dst_rewritten() {
        let mut cache = Vec::new();
        let oob = v4_pktinfo_oob(7, [192, 0, 2, 1], [0, 0, 0, 0]);
        update_oob_cache(&mut cache, &oob).unwrap();

        let messages = parse_control_messages(&cache).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].level, libc::SOL_IP);
        assert_eq!(messages[0].cmsg_type, IP_PKTINFO);

        let info = parse_v4_pktinfo(messages[0].data);
        assert_eq!(info.ipi_ifindex, 7);
        // The destination address became the send-side source.
        assert_eq!(u32::from_be(info.ipi_spec_dst.s_addr).to_be_bytes(), [192, 0, 2, 1]);
    }

    #[test]
    fn test_unknown_class_discarded() {
        let mut cache = vec![9, 9];
        let oob = encode_control_message(libc::SOL_SOCKET, libc::SO_TIMESTAMP, &[0u8; 16]);
        update_oob_cache(&mut cache, &oob).unwrap();
        // Nothing recognized: previous cache kept.
        assert_eq!(cache, vec![9, 9]);
    }

    #[test]
    fn test_pktinfo_survives_mixed_classes() {
        let mut cache = Vec::new();
        let mut oob = encode_control_message(libc::SOL_SOCKET, libc::SO_TIMESTAMP, &[0u8; 16]);
        oob.extend_from_slice(&v4_pktinfo_oob(3, [198, 51, 100, 7], [0, 0, 0, 0]));
        update_oob_cache(&mut cache, &oob).unwrap();

        let messages = parse_control_messages(&cache).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].cmsg_type, IP_PKTINFO);
    }

    #[test]
    fn test_newer_pktinfo_replaces_cache() {
        let mut cache = Vec::new();
        update_oob_cache(&mut cache, &v4_pktinfo_oob(1, [192, 0, 2, 1], [0; 4])).unwrap();
        update_oob_cache(&mut cache, &v4_pktinfo_oob(2, [192, 0, 2, 2], [0; 4])).unwrap();

        let messages = parse_control_messages(&cache).unwrap();
        let info = parse_v4_pktinfo(messages[0].data);
        assert_eq!(info.ipi_ifindex, 2);
    }

    #[test]
    fn test_malformed_cmsg_rejected() {
        // A header claiming more data than the buffer holds.
        let mut bogus = encode_control_message(libc::SOL_IP, IP_PKTINFO, &[0u8; 12]);
        bogus.truncate(CMSG_HDR_LEN + 4);
        let mut cache = vec![5];
        assert!(update_oob_cache(&mut cache, &bogus).is_err());
        assert_eq!(cache, vec![5]);
    }

    #[test]
    fn test_v6_pktinfo_cached() {
        let mut info: libc::in6_pktinfo = unsafe { mem::zeroed() };
        info.ipi6_ifindex = 4;
        info.ipi6_addr.s6_addr = [0xfd; 16];
        let bytes = unsafe {
            std::slice::from_raw_parts(
                std::ptr::addr_of!(info).cast::<u8>(),
                mem::size_of::<libc::in6_pktinfo>(),
            )
        };
        let oob = encode_control_message(libc::SOL_IPV6, IPV6_PKTINFO, bytes);

        let mut cache = Vec::new();
        update_oob_cache(&mut cache, &oob).unwrap();

        let messages = parse_control_messages(&cache).unwrap();
        assert_eq!(messages.len(), 1);
        assert_eq!(messages[0].level, libc::SOL_IPV6);
        assert_eq!(messages[0].cmsg_type, IPV6_PKTINFO);
    }
}
