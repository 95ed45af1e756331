//! Part sealing with `XChaCha20-Poly1305`.
//!
//! A part message fills the network payload slot exactly, so it is sealed
//! in place and the Poly1305 tag is returned detached. The tag travels in
//! the message MAC field.
//!
//! ```ignore
//! use shardcast_crypto::aead::PartCipher;
//!
//! let cipher = PartCipher::from_material(&[7u8; 56]);
//! let mut buffer = b"part bytes".to_vec();
//! let mac = cipher.seal(&mut buffer, b"")?;
//! cipher.open(&mut buffer, &mac, b"")?;
//! ```

use crate::{CryptoError, PART_MAC_SIZE};
use chacha20poly1305::{
    Tag, XChaCha20Poly1305, XNonce,
    aead::{AeadInPlace, KeyInit},
};
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Key size (32 bytes).
pub const KEY_SIZE: usize = 32;

/// Extended nonce size (24 bytes).
pub const NONCE_SIZE: usize = 24;

/// Key material consumed by [`PartCipher::from_material`].
pub const MATERIAL_SIZE: usize = KEY_SIZE + NONCE_SIZE;

/// Key and nonce bound to exactly one part message.
///
/// Both are zeroized on drop.
#[derive(Zeroize, ZeroizeOnDrop)]
pub struct PartCipher {
    key: [u8; KEY_SIZE],
    nonce: [u8; NONCE_SIZE],
}

impl PartCipher {
    /// Split derived material into key (first 32 bytes) and nonce.
    #[must_use]
    pub fn from_material(material: &[u8; MATERIAL_SIZE]) -> Self {
        let mut key = [0u8; KEY_SIZE];
        let mut nonce = [0u8; NONCE_SIZE];
        key.copy_from_slice(&material[..KEY_SIZE]);
        nonce.copy_from_slice(&material[KEY_SIZE..]);
        Self { key, nonce }
    }

    /// Encrypt `buffer` in place and return the detached MAC.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the AEAD rejects the input.
    pub fn seal(&self, buffer: &mut [u8], aad: &[u8]) -> Result<[u8; PART_MAC_SIZE], CryptoError> {
        let tag = XChaCha20Poly1305::new((&self.key).into())
            .encrypt_in_place_detached(XNonce::from_slice(&self.nonce), aad, buffer)
            .map_err(|_| CryptoError::EncryptionFailed)?;

        let mut mac = [0u8; PART_MAC_SIZE];
        mac.copy_from_slice(&tag);
        Ok(mac)
    }

    /// Verify `mac` and decrypt `buffer` in place.
    ///
    /// On failure the buffer content is unspecified and must be discarded.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` if the MAC has the wrong
    /// length or does not verify.
    pub fn open(&self, buffer: &mut [u8], mac: &[u8], aad: &[u8]) -> Result<(), CryptoError> {
        if mac.len() != PART_MAC_SIZE {
            return Err(CryptoError::DecryptionFailed);
        }

        XChaCha20Poly1305::new((&self.key).into())
            .decrypt_in_place_detached(
                XNonce::from_slice(&self.nonce),
                aad,
                buffer,
                Tag::from_slice(mac),
            )
            .map_err(|_| CryptoError::DecryptionFailed)
    }
}

impl std::fmt::Debug for PartCipher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("PartCipher([REDACTED])")
    }
}
