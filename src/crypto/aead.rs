//! Sealed frame encryption
//!
//! Every packet is sealed with ChaCha20-Poly1305 under the pre-shared key
//! and a fresh random nonce. Wire layout:
//!
//! ```text
//! [ nonce (12) | ciphertext (n) | tag (16) ]
//! ```

use std::fmt;

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Key, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;

use crate::error::CryptoError;

/// Authentication tag length
pub const TAG_LEN: usize = 16;

/// ChaCha20-Poly1305 key length
pub const KEY_LEN: usize = 32;

/// ChaCha20-Poly1305 nonce length
pub const NONCE_LEN: usize = 12;

/// Bytes a sealed frame adds on top of the packet
pub const FRAME_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Authenticated-encryption codec holding the shared key
///
/// Stateless apart from the key, so one instance can be shared by both
/// forwarding directions behind an `Arc`.
pub struct SealCodec {
    cipher: ChaCha20Poly1305,
}

impl SealCodec {
    /// Build a codec from raw key material
    ///
    /// The key is used as-is; there is no derivation step.
    pub fn new(key: &[u8]) -> Result<Self, CryptoError> {
        if key.len() != KEY_LEN {
            return Err(CryptoError::InvalidKeyLength {
                expected: KEY_LEN,
                got: key.len(),
            });
        }

        Ok(Self {
            cipher: ChaCha20Poly1305::new(Key::from_slice(key)),
        })
    }

    /// Seal a packet into `nonce || ciphertext || tag`
    ///
    /// The nonce comes from the OS random source. If that source fails the
    /// error is returned; there is no fallback nonce.
    pub fn seal(&self, packet: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut nonce = [0u8; NONCE_LEN];
        OsRng
            .try_fill_bytes(&mut nonce)
            .map_err(|e| CryptoError::Randomness {
                reason: e.to_string(),
            })?;

        let ciphertext = self
            .cipher
            .encrypt(Nonce::from_slice(&nonce), packet)
            .map_err(|_| CryptoError::Encryption)?;

        let mut frame = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        frame.extend_from_slice(&nonce);
        frame.extend_from_slice(&ciphertext);
        Ok(frame)
    }

    /// Open a sealed frame and return the packet
    pub fn open(&self, frame: &[u8]) -> Result<Vec<u8>, CryptoError> {
        if frame.len() < NONCE_LEN {
            return Err(CryptoError::MalformedFrame {
                len: frame.len(),
                min: NONCE_LEN,
            });
        }

        let (nonce, ciphertext) = frame.split_at(NONCE_LEN);

        self.cipher
            .decrypt(Nonce::from_slice(nonce), ciphertext)
            .map_err(|_| CryptoError::AuthenticationFailed)
    }
}

impl fmt::Debug for SealCodec {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SealCodec")
            .field("key", &"<redacted>")
            .finish()
    }
}
