//! Single-use per-part cyphers.
//!
//! A [`Cypher`] is the pair (encryption key material, message fingerprint)
//! derived deterministically from a [`TransferKey`] and a sequence index.
//! The receiver derives the same cyphers and listens on their fingerprints,
//! so the fingerprint both routes an inbound message to its transfer and
//! selects the key that decrypts it.
//!
//! Reusing a cypher would encrypt two plaintexts under the same key and
//! nonce. Callers obtain cyphers from a pool that hands each index out once.

use crate::aead::{MATERIAL_SIZE, PartCipher};
use crate::hash::Kdf;
use crate::{CryptoError, FINGERPRINT_SIZE, PART_MAC_SIZE, TransferKey};
use serde::{Deserialize, Serialize};
use std::fmt;
use zeroize::Zeroize;

const FINGERPRINT_CONTEXT: &str = "shardcast 2024 part fingerprint";
const PART_KEY_CONTEXT: &str = "shardcast 2024 part key";

/// Message fingerprint identifying one cypher of one transfer.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Fingerprint(pub [u8; FINGERPRINT_SIZE]);

impl Fingerprint {
    /// Raw fingerprint bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; FINGERPRINT_SIZE] {
        &self.0
    }
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", hex::encode(&self.0[..8]))
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&hex::encode(&self.0[..8]))
    }
}

/// Output of encrypting one part message.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EncryptedPart {
    /// Ciphertext, same length as the plaintext part message
    pub ciphertext: Vec<u8>,
    /// Detached authentication tag
    pub mac: [u8; PART_MAC_SIZE],
    /// Fingerprint the receiver listens on
    pub fingerprint: Fingerprint,
}

/// Cypher bound to a transfer key and a sequence index.
#[derive(Clone)]
pub struct Cypher {
    key: TransferKey,
    index: u16,
}

impl Cypher {
    /// Derive the cypher at `index` for `key`.
    #[must_use]
    pub fn new(key: &TransferKey, index: u16) -> Self {
        Self {
            key: key.clone(),
            index,
        }
    }

    /// Sequence index of this cypher within its pool.
    #[must_use]
    pub fn index(&self) -> u16 {
        self.index
    }

    /// Message fingerprint of this cypher.
    #[must_use]
    pub fn fingerprint(&self) -> Fingerprint {
        Fingerprint(Kdf::new(FINGERPRINT_CONTEXT).derive_key(&self.ikm()))
    }

    /// Encrypt a part message.
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::EncryptionFailed` if the AEAD fails.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedPart, CryptoError> {
        let mut ciphertext = plaintext.to_vec();
        let mac = self.part_cipher().seal(&mut ciphertext, &self.aad())?;

        Ok(EncryptedPart {
            ciphertext,
            mac,
            fingerprint: self.fingerprint(),
        })
    }

    /// Decrypt a part message previously produced by [`Cypher::encrypt`].
    ///
    /// # Errors
    ///
    /// Returns `CryptoError::DecryptionFailed` if the MAC does not verify.
    pub fn decrypt(&self, ciphertext: &[u8], mac: &[u8]) -> Result<Vec<u8>, CryptoError> {
        let mut plaintext = ciphertext.to_vec();
        self.part_cipher().open(&mut plaintext, mac, &self.aad())?;
        Ok(plaintext)
    }

    fn ikm(&self) -> [u8; 34] {
        let mut ikm = [0u8; 34];
        ikm[..32].copy_from_slice(self.key.as_bytes());
        ikm[32..].copy_from_slice(&self.index.to_be_bytes());
        ikm
    }

    fn aad(&self) -> [u8; 2] {
        self.index.to_be_bytes()
    }

    fn part_cipher(&self) -> PartCipher {
        let mut material = [0u8; MATERIAL_SIZE];
        Kdf::new(PART_KEY_CONTEXT).derive(&self.ikm(), &mut material);
        let cipher = PartCipher::from_material(&material);
        material.zeroize();
        cipher
    }
}

impl fmt::Debug for Cypher {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cypher")
            .field("index", &self.index)
            .field("fingerprint", &self.fingerprint())
            .finish()
    }
}
