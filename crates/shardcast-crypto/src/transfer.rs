//! Transfer identifiers, keys and whole-file MACs.

use crate::CryptoError;
use crate::hash::{Kdf, hash, keyed_hash};
use crate::random::random_32;
use serde::{Deserialize, Deserializer, Serialize, Serializer};
use subtle::ConstantTimeEq;
use zeroize::{Zeroize, ZeroizeOnDrop};

/// Random per-transfer identifier.
pub type TransferId = [u8; 32];

/// Identity a transfer is addressed to (and whose fingerprints receive it).
pub type RecipientId = [u8; 32];

/// Content-derived identifier of a file.
pub type FileId = [u8; 32];

/// Generate a new random transfer ID.
///
/// # Errors
///
/// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
pub fn new_transfer_id() -> Result<TransferId, CryptoError> {
    random_32()
}

/// Compute the file ID of the given contents.
#[must_use]
pub fn file_id(data: &[u8]) -> FileId {
    hash(data)
}

/// 256-bit symmetric key shared between sender and receiver of one transfer.
///
/// Serialized as a hex string. Zeroized on drop.
#[derive(Clone, PartialEq, Eq, Zeroize, ZeroizeOnDrop)]
pub struct TransferKey([u8; 32]);

impl TransferKey {
    /// Wrap raw key bytes.
    #[must_use]
    pub fn from_bytes(bytes: [u8; 32]) -> Self {
        Self(bytes)
    }

    /// Generate a new random key.
    ///
    /// # Errors
    ///
    /// Returns [`CryptoError::RandomFailed`] if the OS CSPRNG fails.
    pub fn generate() -> Result<Self, CryptoError> {
        Ok(Self(random_32()?))
    }

    /// Raw key bytes.
    #[must_use]
    pub fn as_bytes(&self) -> &[u8; 32] {
        &self.0
    }

    /// Parse a key from its hex encoding.
    ///
    /// # Errors
    ///
    /// Returns an error if the string is not 64 hex characters.
    pub fn from_hex(encoded: &str) -> Result<Self, CryptoError> {
        let bytes =
            hex::decode(encoded).map_err(|e| CryptoError::InvalidKeyEncoding(e.to_string()))?;
        let actual = bytes.len();
        let bytes: [u8; 32] = bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
            expected: 32,
            actual,
        })?;
        Ok(Self(bytes))
    }
}

impl std::fmt::Debug for TransferKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("TransferKey([REDACTED])")
    }
}

impl Serialize for TransferKey {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&hex::encode(self.0))
    }
}

impl<'de> Deserialize<'de> for TransferKey {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let encoded = String::deserialize(deserializer)?;
        Self::from_hex(&encoded).map_err(serde::de::Error::custom)
    }
}

/// MAC over an entire file, keyed by its transfer key.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TransferMac(pub [u8; 32]);

/// Compute the transfer MAC of a file.
#[must_use]
pub fn create_transfer_mac(file: &[u8], key: &TransferKey) -> TransferMac {
    let mac_key = Kdf::new("shardcast 2024 transfer mac").derive_key(key.as_bytes());
    TransferMac(keyed_hash(&mac_key, file))
}

/// Verify a file against its transfer MAC in constant time.
#[must_use]
pub fn verify_transfer_mac(file: &[u8], key: &TransferKey, mac: &TransferMac) -> bool {
    let expected = create_transfer_mac(file, key);
    expected.0.ct_eq(&mac.0).into()
}
