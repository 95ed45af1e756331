//! BLAKE3 content hashing and key derivation.
//!
//! File IDs are plain content hashes, transfer MACs are keyed hashes, and
//! every secret derived from a transfer key goes through [`Kdf`] under its
//! own context string.

/// Output of every hash in this module.
pub type Digest = [u8; 32];

/// Content hash of `data`.
#[must_use]
pub fn hash(data: &[u8]) -> Digest {
    blake3::hash(data).into()
}

/// Hash of `data` keyed by `key`.
#[must_use]
pub fn keyed_hash(key: &Digest, data: &[u8]) -> Digest {
    blake3::keyed_hash(key, data).into()
}

/// Domain-separated key derivation.
///
/// Two derivers with different contexts never produce related output for
/// the same input material.
#[derive(Debug, Clone, Copy)]
pub struct Kdf {
    context: &'static str,
}

impl Kdf {
    /// Deriver for `context`, which must be a hardcoded, unique string.
    #[must_use]
    pub const fn new(context: &'static str) -> Self {
        Self { context }
    }

    /// Fill `output` with material derived from `ikm`.
    ///
    /// Shorter outputs are prefixes of longer ones.
    pub fn derive(&self, ikm: &[u8], output: &mut [u8]) {
        blake3::Hasher::new_derive_key(self.context)
            .update(ikm)
            .finalize_xof()
            .fill(output);
    }

    /// Derive a 32-byte key from `ikm`.
    #[must_use]
    pub fn derive_key(&self, ikm: &[u8]) -> Digest {
        blake3::derive_key(self.context, ikm)
    }
}
