//! Paranoid packet handler
//!
//! Seals the whole WireGuard packet with XChaCha20-Poly1305 and pads every
//! packet to a random length, so neither content nor size reveals anything
//! about the tunnel. The payload length travels encrypted in front of the
//! payload.
//!
//! Wire format:
//!
//! ```text
//! nonce (24) | AEAD( length (u16 LE) | payload | padding ) | tag (16)
//! ```

use std::ops::Range;

use chacha20poly1305::aead::{AeadInPlace, KeyInit};
use chacha20poly1305::{Key, Tag, XChaCha20Poly1305, XNonce};
use rand::{thread_rng, Rng, RngCore};

use crate::error::HandlerError;

use super::Handler;

/// XChaCha20 nonce length
const NONCE_LENGTH: usize = 24;

/// Poly1305 tag length
const TAG_LENGTH: usize = 16;

/// Encrypted payload length field size
const LENGTH_FIELD: usize = 2;

/// Front overhead: nonce plus the encrypted length field
const FRONT_OVERHEAD: usize = NONCE_LENGTH + LENGTH_FIELD;

/// Paranoid handler: full-packet AEAD with length-hiding padding.
pub struct ParanoidHandler {
    cipher: XChaCha20Poly1305,
}

impl ParanoidHandler {
    /// Required PSK length (XChaCha20-Poly1305 key)
    pub const PSK_LENGTH: usize = 32;

    /// Create a handler from a 32-byte PSK.
    ///
    /// # Errors
    ///
    /// Returns [`HandlerError::PskLength`] for any other PSK length.
    pub fn new(psk: &[u8]) -> Result<Self, HandlerError> {
        if psk.len() != Self::PSK_LENGTH {
            return Err(HandlerError::PskLength {
                mode: "paranoid",
                expected: Self::PSK_LENGTH,
                actual: psk.len(),
            });
        }
        Ok(Self {
            cipher: XChaCha20Poly1305::new(Key::from_slice(psk)),
        })
    }
}

impl Handler for ParanoidHandler {
    fn front_overhead(&self) -> usize {
        FRONT_OVERHEAD
    }

    fn rear_overhead(&self) -> usize {
        TAG_LENGTH
    }

    fn decrypt_zero_copy(&self, buf: &mut [u8]) -> Result<Range<usize>, HandlerError> {
        let n = buf.len();
        if n < FRONT_OVERHEAD + TAG_LENGTH {
            return Err(HandlerError::PacketSize { len: n });
        }

        let mut nonce = [0u8; NONCE_LENGTH];
        nonce.copy_from_slice(&buf[..NONCE_LENGTH]);
        let mut tag = [0u8; TAG_LENGTH];
        tag.copy_from_slice(&buf[n - TAG_LENGTH..]);

        self.cipher
            .decrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                &[],
                &mut buf[NONCE_LENGTH..n - TAG_LENGTH],
                Tag::from_slice(&tag),
            )
            .map_err(|_| HandlerError::Decrypt)?;

        let wg_length = usize::from(u16::from_le_bytes([
            buf[NONCE_LENGTH],
            buf[NONCE_LENGTH + 1],
        ]));
        let end = FRONT_OVERHEAD
            .checked_add(wg_length)
            .filter(|&end| end <= n - TAG_LENGTH)
            .ok_or(HandlerError::Decrypt)?;

        Ok(FRONT_OVERHEAD..end)
    }

    #[allow(clippy::cast_possible_truncation)]
    fn encrypt_zero_copy(
        &self,
        buf: &mut [u8],
        start: usize,
        len: usize,
    ) -> Result<Range<usize>, HandlerError> {
        let cap = buf.len();
        if start < FRONT_OVERHEAD
            || len > usize::from(u16::MAX)
            || start + len + TAG_LENGTH > cap
        {
            return Err(HandlerError::BufferSpace { start, len, cap });
        }

        // Pad with random bytes up to whatever the buffer can hold; the
        // encrypted length field recovers the true payload size.
        let max_padding = (cap - TAG_LENGTH - start - len).min(usize::from(u16::MAX) - len);
        let padding_length = thread_rng().gen_range(0..=max_padding);
        let sealed_end = start + len + padding_length;
        thread_rng().fill_bytes(&mut buf[start + len..sealed_end]);

        buf[start - LENGTH_FIELD..start].copy_from_slice(&(len as u16).to_le_bytes());

        let mut nonce = [0u8; NONCE_LENGTH];
        thread_rng().fill_bytes(&mut nonce);
        let nonce_start = start - FRONT_OVERHEAD;
        buf[nonce_start..start - LENGTH_FIELD].copy_from_slice(&nonce);

        let tag = self
            .cipher
            .encrypt_in_place_detached(
                XNonce::from_slice(&nonce),
                &[],
                &mut buf[start - LENGTH_FIELD..sealed_end],
            )
            .map_err(|_| HandlerError::BufferSpace { start, len, cap })?;
        buf[sealed_end..sealed_end + TAG_LENGTH].copy_from_slice(tag.as_slice());

        Ok(nonce_start..sealed_end + TAG_LENGTH)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn handler() -> ParanoidHandler {
        ParanoidHandler::new(&[0x42u8; 32]).unwrap()
    }

    fn wg_packet(message_type: u8, len: usize) -> Vec<u8> {
        let mut packet = vec![0u8; len];
        packet[0] = message_type;
        for (i, byte) in packet.iter_mut().enumerate().skip(4) {
            *byte = (i % 251) as u8;
        }
        packet
    }

    #[test]
    fn test_roundtrip() {
        let handler = handler();
        let plaintext = wg_packet(1, 148);

        let mut buf = vec![0u8; 1392];
        buf[FRONT_OVERHEAD..FRONT_OVERHEAD + 148].copy_from_slice(&plaintext);
        let swgp = handler
            .encrypt_zero_copy(&mut buf, FRONT_OVERHEAD, 148)
            .unwrap();
        assert_eq!(swgp.start, 0);
        assert!(swgp.len() >= FRONT_OVERHEAD + 148 + TAG_LENGTH);

        let mut packet = buf[swgp].to_vec();
        let wg = handler.decrypt_zero_copy(&mut packet).unwrap();
        assert_eq!(&packet[wg], &plaintext[..]);
    }

    #[test]
    fn test_roundtrip_offset_start() {
        // The plaintext does not have to sit exactly at front_overhead.
        let handler = handler();
        let plaintext = wg_packet(4, 256);

        let mut buf = vec![0u8; 1392];
        let start = 100;
        buf[start..start + 256].copy_from_slice(&plaintext);
        let swgp = handler.encrypt_zero_copy(&mut buf, start, 256).unwrap();
        assert_eq!(swgp.start, start - FRONT_OVERHEAD);

        let mut packet = buf[swgp].to_vec();
        let wg = handler.decrypt_zero_copy(&mut packet).unwrap();
        assert_eq!(&packet[wg], &plaintext[..]);
    }

    #[test]
    fn test_tampering_detected() {
        let handler = handler();
        let plaintext = wg_packet(4, 64);

        let mut buf = vec![0u8; 512];
        buf[FRONT_OVERHEAD..FRONT_OVERHEAD + 64].copy_from_slice(&plaintext);
        let swgp = handler
            .encrypt_zero_copy(&mut buf, FRONT_OVERHEAD, 64)
            .unwrap();

        let mut packet = buf[swgp].to_vec();
        let middle = packet.len() / 2;
        packet[middle] ^= 0xFF;
        assert!(matches!(
            handler.decrypt_zero_copy(&mut packet),
            Err(HandlerError::Decrypt)
        ));
    }

    #[test]
    fn test_wrong_psk_rejected() {
        let handler = handler();
        let other = ParanoidHandler::new(&[0x24u8; 32]).unwrap();
        let plaintext = wg_packet(1, 148);

        let mut buf = vec![0u8; 1392];
        buf[FRONT_OVERHEAD..FRONT_OVERHEAD + 148].copy_from_slice(&plaintext);
        let swgp = handler
            .encrypt_zero_copy(&mut buf, FRONT_OVERHEAD, 148)
            .unwrap();

        let mut packet = buf[swgp].to_vec();
        assert!(other.decrypt_zero_copy(&mut packet).is_err());
    }

    #[test]
    fn test_short_packet_rejected() {
        let handler = handler();
        let mut short = vec![0u8; FRONT_OVERHEAD + TAG_LENGTH - 1];
        assert!(matches!(
            handler.decrypt_zero_copy(&mut short),
            Err(HandlerError::PacketSize { .. })
        ));
    }

    #[test]
    fn test_insufficient_front_headroom() {
        let handler = handler();
        let mut buf = vec![0u8; 512];
        assert!(matches!(
            handler.encrypt_zero_copy(&mut buf, 10, 64),
            Err(HandlerError::BufferSpace { .. })
        ));
    }

    #[test]
    fn test_psk_length_enforced() {
        assert!(ParanoidHandler::new(&[0u8; 16]).is_err());
        assert!(ParanoidHandler::new(&[0u8; 32]).is_ok());
    }

    #[test]
    fn test_padding_varies_packet_length() {
        // With 1KB of headroom, 32 encryptions of the same packet are
        // overwhelmingly unlikely to all pick the same padding.
        let handler = handler();
        let plaintext = wg_packet(4, 32);

        let mut lengths = std::collections::HashSet::new();
        for _ in 0..32 {
            let mut buf = vec![0u8; 1392];
            buf[FRONT_OVERHEAD..FRONT_OVERHEAD + 32].copy_from_slice(&plaintext);
            let swgp = handler
                .encrypt_zero_copy(&mut buf, FRONT_OVERHEAD, 32)
                .unwrap();
            lengths.insert(swgp.len());
        }
        assert!(lengths.len() > 1);
    }
}
