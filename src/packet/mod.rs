//! Packet handlers for the swgp obfuscation layer
//!
//! A [`Handler`] transforms between swgp packets (the obfuscated datagrams
//! exchanged with clients) and WireGuard packets (the raw datagrams
//! exchanged with the real endpoint), in place, inside a single buffer.
//!
//! Each handler declares a front and rear overhead. The relay reserves
//! those regions when sizing buffers so that encryption never copies the
//! payload: the plaintext is written into the middle of the buffer and the
//! handler fills the reserved regions around it.
//!
//! # Modes
//!
//! - `zero-overhead` ([`ZeroOverheadHandler`]): encrypts the first 16 bytes
//!   of each packet with a single AES-256 block and pads handshake-class
//!   messages to a random length. Data packets keep their exact size, so
//!   the mode costs no tunnel MTU.
//! - `paranoid` ([`ParanoidHandler`]): seals the whole packet with
//!   XChaCha20-Poly1305 and pads every packet to a random length.

mod paranoid;
mod zero_overhead;

use std::ops::Range;
use std::sync::Arc;

use crate::error::HandlerError;

pub use paranoid::ParanoidHandler;
pub use zero_overhead::ZeroOverheadHandler;

/// WireGuard handshake initiation message type
pub const WG_MESSAGE_TYPE_HANDSHAKE_INITIATION: u8 = 1;

/// WireGuard handshake response message type
pub const WG_MESSAGE_TYPE_HANDSHAKE_RESPONSE: u8 = 2;

/// WireGuard cookie reply message type
pub const WG_MESSAGE_TYPE_COOKIE_REPLY: u8 = 3;

/// WireGuard transport data message type
pub const WG_MESSAGE_TYPE_DATA: u8 = 4;

/// Exact length of a WireGuard handshake initiation message
pub const WG_HANDSHAKE_INITIATION_LENGTH: usize = 148;

/// Exact length of a WireGuard handshake response message
pub const WG_HANDSHAKE_RESPONSE_LENGTH: usize = 92;

/// Exact length of a WireGuard cookie reply message
pub const WG_COOKIE_REPLY_LENGTH: usize = 64;

/// Minimum length of a WireGuard transport data message (keepalive)
pub const WG_DATA_MIN_LENGTH: usize = 32;

/// Bytes a WireGuard transport data message adds around its inner packet:
/// 16-byte message header plus 16-byte Poly1305 tag
pub const WG_DATA_OVERHEAD: usize = 32;

/// WireGuard pads transport data to a multiple of 16; tunnel MTU
/// calculations round down with this mask
pub const WG_DATA_LENGTH_MASK: usize = !0b1111;

/// In-place transform between swgp packets and WireGuard packets.
///
/// Both operations return the range of the result within the caller's
/// buffer, so ownership of the buffer can move on (e.g. into a send queue)
/// without holding a borrow.
pub trait Handler: Send + Sync {
    /// Bytes the handler needs in front of the plaintext
    fn front_overhead(&self) -> usize;

    /// Bytes the handler needs behind the plaintext
    fn rear_overhead(&self) -> usize;

    /// Decrypt the swgp packet occupying all of `buf` in place.
    ///
    /// Returns the range of the recovered WireGuard packet within `buf`.
    ///
    /// # Errors
    ///
    /// Returns a recoverable [`HandlerError`] on authentication or format
    /// failure; the caller drops the datagram.
    fn decrypt_zero_copy(&self, buf: &mut [u8]) -> Result<Range<usize>, HandlerError>;

    /// Encrypt the WireGuard packet at `buf[start..start + len]` in place,
    /// using the reserved regions around it.
    ///
    /// Requires `start >= front_overhead()` and
    /// `start + len + rear_overhead() <= buf.len()`. Returns the range of
    /// the finished swgp packet within `buf`.
    ///
    /// # Errors
    ///
    /// Returns a recoverable [`HandlerError`] if the payload does not fit.
    fn encrypt_zero_copy(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<Range<usize>, HandlerError>;
}

/// Look up the packet handler for a proxy mode.
///
/// # Errors
///
/// Returns [`HandlerError::UnknownProxyMode`] for unrecognized modes and
/// [`HandlerError::PskLength`] when the PSK does not fit the mode.
pub fn get_handler(mode: &str, psk: &[u8]) -> Result<Arc<dyn Handler>, HandlerError> {
    match mode {
        "zero-overhead" => Ok(Arc::new(ZeroOverheadHandler::new(psk)?)),
        "paranoid" => Ok(Arc::new(ParanoidHandler::new(psk)?)),
        _ => Err(HandlerError::UnknownProxyMode(mode.to_string())),
    }
}

/// Check whether a WireGuard message type byte is a handshake initiation
/// or response. Only these refresh a session's upstream read deadline.
#[must_use]
pub const fn is_handshake_message(message_type: u8) -> bool {
    matches!(
        message_type,
        WG_MESSAGE_TYPE_HANDSHAKE_INITIATION | WG_MESSAGE_TYPE_HANDSHAKE_RESPONSE
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_get_handler_known_modes() {
        let psk = [7u8; 32];

        let handler = get_handler("zero-overhead", &psk).unwrap();
        assert_eq!(handler.front_overhead(), 0);
        assert_eq!(handler.rear_overhead(), 0);

        let handler = get_handler("paranoid", &psk).unwrap();
        assert!(handler.front_overhead() > 0);
        assert!(handler.rear_overhead() > 0);
    }

    #[test]
    fn test_get_handler_unknown_mode() {
        let result = get_handler("rot13", &[0u8; 32]);
        assert!(matches!(result, Err(HandlerError::UnknownProxyMode(_))));
    }

    #[test]
    fn test_get_handler_bad_psk_length() {
        let result = get_handler("zero-overhead", &[0u8; 16]);
        assert!(matches!(result, Err(HandlerError::PskLength { .. })));

        let result = get_handler("paranoid", &[0u8; 31]);
        assert!(matches!(result, Err(HandlerError::PskLength { .. })));
    }

    #[test]
    fn test_is_handshake_message() {
        assert!(is_handshake_message(WG_MESSAGE_TYPE_HANDSHAKE_INITIATION));
        assert!(is_handshake_message(WG_MESSAGE_TYPE_HANDSHAKE_RESPONSE));
        assert!(!is_handshake_message(WG_MESSAGE_TYPE_COOKIE_REPLY));
        assert!(!is_handshake_message(WG_MESSAGE_TYPE_DATA));
    }

    #[test]
    fn test_tunnel_mtu_mask_alignment() {
        assert_eq!(1392 & WG_DATA_LENGTH_MASK, 1392);
        assert_eq!(1391 & WG_DATA_LENGTH_MASK, 1376);
        assert_eq!(15 & WG_DATA_LENGTH_MASK, 0);
    }
}
