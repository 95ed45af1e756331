//! # shardcast Crypto
//!
//! Cryptographic primitives for shardcast file transfers.
//!
//! This crate provides:
//! - Per-transfer symmetric keys and transfer MACs
//! - Single-use per-part cyphers (key material + message fingerprint)
//! - `XChaCha20-Poly1305` AEAD encryption
//! - BLAKE3 hashing and key derivation
//! - Secure random number generation
//!
//! ## Cryptographic Suite
//!
//! | Function | Algorithm | Security Level |
//! |----------|-----------|----------------|
//! | Part encryption | XChaCha20-Poly1305 | 256-bit key |
//! | Fingerprints | BLAKE3 KDF | 128-bit collision |
//! | Transfer MAC | Keyed BLAKE3 | 128-bit |
//! | File ID | BLAKE3 | 128-bit collision |
//!
//! ## Cypher derivation
//!
//! ```text
//!  TransferKey ──┬── KDF("fingerprint", index) ──▶ Fingerprint (32 B)
//!                └── KDF("part key",    index) ──▶ AEAD key (32 B) + nonce (24 B)
//! ```
//!
//! Every index yields an independent cypher; a cypher is used for exactly one
//! physical send of one file part.

#![warn(missing_docs)]
#![warn(clippy::all)]
#![deny(unsafe_op_in_unsafe_fn)]

pub mod aead;
pub mod cypher;
pub mod error;
pub mod hash;
pub mod random;
pub mod transfer;

pub use cypher::{Cypher, EncryptedPart, Fingerprint};
pub use error::CryptoError;
pub use transfer::{
    FileId, RecipientId, TransferId, TransferKey, TransferMac, create_transfer_mac, file_id,
    new_transfer_id, verify_transfer_mac,
};

/// Message fingerprint size
pub const FINGERPRINT_SIZE: usize = 32;

/// Detached part MAC (Poly1305 tag) size
pub const PART_MAC_SIZE: usize = 16;
