//! Zero-overhead packet handler
//!
//! Encrypts the first 16 bytes of every packet with a single AES-256 block,
//! hiding the WireGuard message type, receiver index and counter. Handshake
//! initiation, handshake response and cookie reply messages additionally
//! get random-length padding followed by a little-endian `u16` padding
//! length, so their fixed sizes do not fingerprint the protocol. Transport
//! data keeps its exact size, which is what makes the mode free of tunnel
//! MTU cost.
//!
//! Wire format per message class:
//!
//! ```text
//! handshake/cookie: AES(first block) | rest | padding | pad_len (u16 LE)
//! data:             AES(first block) | rest
//! ```

use std::ops::Range;

use aes::cipher::{generic_array::GenericArray, BlockDecrypt, BlockEncrypt, KeyInit};
use aes::Aes256;
use rand::{thread_rng, Rng, RngCore};

use crate::error::HandlerError;

use super::{
    Handler, WG_COOKIE_REPLY_LENGTH, WG_DATA_MIN_LENGTH, WG_HANDSHAKE_INITIATION_LENGTH,
    WG_HANDSHAKE_RESPONSE_LENGTH, WG_MESSAGE_TYPE_COOKIE_REPLY, WG_MESSAGE_TYPE_DATA,
    WG_MESSAGE_TYPE_HANDSHAKE_INITIATION, WG_MESSAGE_TYPE_HANDSHAKE_RESPONSE,
};

/// AES block length; also the encrypted prefix length
const BLOCK_LENGTH: usize = 16;

/// Trailing padding length field size
const PADDING_LENGTH_FIELD: usize = 2;

/// Zero-overhead handler: AES-256 over the first block, padded handshakes.
pub struct ZeroOverheadHandler {
    cipher: Aes256,
}

impl ZeroOverheadHandler {
    /// Required PSK length (AES-256 key)
    pub const PSK_LENGTH: usize = 32;

    /// Create a handler from a 32-byte PSK.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::PskLength`] for any other PSK length.
    pub fn new(psk: &[u8]) -> Result<Self, HandlerError> {
        if psk.len() != Self::PSK_LENGTH {
            return Err(HandlerError::PskLength {
                mode: "zero-overhead",
                expected: Self::PSK_LENGTH,
                actual: psk.len(),
            });
        }
        Ok(Self {
            cipher: Aes256::new(GenericArray::from_slice(psk)),
        })
    }

    /// Expected WireGuard packet length for a padded message class, if any.
    fn expected_padded_length(message_type: u8) -> Option<usize> {
        match message_type {
            WG_MESSAGE_TYPE_HANDSHAKE_INITIATION => Some(WG_HANDSHAKE_INITIATION_LENGTH),
            WG_MESSAGE_TYPE_HANDSHAKE_RESPONSE => Some(WG_HANDSHAKE_RESPONSE_LENGTH),
            WG_MESSAGE_TYPE_COOKIE_REPLY => Some(WG_COOKIE_REPLY_LENGTH),
            _ => None,
        }
    }
}

impl Handler for ZeroOverheadHandler {
    fn front_overhead(&self) -> usize {
        0
    }

    fn rear_overhead(&self) -> usize {
        0
    }

    fn decrypt_zero_copy(&self, buf: &mut [u8]) -> Result<Range<usize>, HandlerError> {
        let n = buf.len();
        if n < BLOCK_LENGTH {
            return Err(HandlerError::PacketSize { len: n });
        }

        self.cipher
            .decrypt_block(GenericArray::from_mut_slice(&mut buf[..BLOCK_LENGTH]));

        let message_type = buf[0];
        if let Some(expected) = Self::expected_padded_length(message_type) {
            if n < BLOCK_LENGTH + PADDING_LENGTH_FIELD {
                return Err(HandlerError::Decrypt);
            }
            let padding_length =
                usize::from(u16::from_le_bytes([buf[n - 2], buf[n - 1]]));
            let wg_length = n
                .checked_sub(PADDING_LENGTH_FIELD + padding_length)
                .ok_or(HandlerError::Decrypt)?;
            // A wrong PSK yields a garbage type byte or a mismatched
            // length; both reject here.
            if wg_length != expected {
                return Err(HandlerError::Decrypt);
            }
            Ok(0..wg_length)
        } else if message_type == WG_MESSAGE_TYPE_DATA {
            if n < WG_DATA_MIN_LENGTH {
                return Err(HandlerError::Decrypt);
            }
            Ok(0..n)
        } else {
            Err(HandlerError::Decrypt)
        }
    }

    fn encrypt_zero_copy(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<Range<usize>, HandlerError> {
        if len < BLOCK_LENGTH {
            return Err(HandlerError::PacketSize { len });
        }
        let end = start
            .checked_add(len)
            .filter(|&end| end <= buf.len())
            .ok_or(HandlerError::BufferSpace {
                start,
                len,
                cap: buf.len(),
            })?;

        let message_type = buf[start];
        self.cipher.encrypt_block(GenericArray::from_mut_slice(
            &mut buf[start..start + BLOCK_LENGTH],
        ));

        if Self::expected_padded_length(message_type).is_none() {
            return Ok(start..end);
        }

        // Handshake-class messages get padding plus the trailing length.
        let headroom = buf.len() - end;
        if headroom < PADDING_LENGTH_FIELD {
            return Err(HandlerError::BufferSpace {
                start,
                len,
                cap: buf.len(),
            });
        }
        let max_padding = (headroom - PADDING_LENGTH_FIELD).min(usize::from(u16::MAX));
        let padding_length = thread_rng().gen_range(0..=max_padding);
        thread_rng().fill_bytes(&mut buf[end..end + padding_length]);
        let trailer = end + padding_length;
        #[allow(clippy::cast_possible_truncation)]
        let padding_length_field = (padding_length as u16).to_le_bytes();
        buf[trailer..trailer + PADDING_LENGTH_FIELD].copy_from_slice(&padding_length_field);

        Ok(start..trailer + PADDING_LENGTH_FIELD)
    }
}
